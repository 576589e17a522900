//! Task-state store with optimistic concurrency, append-only snapshots, and
//! the pure `StateReducer` that defines legal plan-step transitions.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{MemoryError, Result};
use crate::schema::{
    now_ms, Constraint, PlanStep, TaskCreateInput, TaskSnapshot, TaskState, TaskStatus, TaskUpdate,
};

#[derive(Clone)]
pub struct TaskStore {
    db: Db,
}

impl TaskStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn create(&self, input: TaskCreateInput) -> Result<TaskState> {
        let state = TaskState {
            id: Uuid::new_v4(),
            goal: input.goal,
            status: input.status.unwrap_or(TaskStatus::Pending),
            constraints: input.constraints,
            plan: input.plan,
            done: Default::default(),
            blocked: Default::default(),
            next_action: None,
            updated_at: now_ms(),
            version: 1,
            session_id: input.session_id,
            metadata: input.metadata,
        };
        self.db.with(|conn| {
            insert_task_row(conn, &state)?;
            insert_snapshot(conn, &state)?;
            Ok(())
        })?;
        Ok(state)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<TaskState>> {
        self.db.with(|conn| load_task(conn, id))
    }

    /// Field-level merge. Fails with `Conflict` if `update.version` is
    /// present and does not equal the stored version. When `action_id` was
    /// already applied to this task, returns the current state unchanged —
    /// no version bump, no second snapshot.
    pub fn update(&self, id: Uuid, update: TaskUpdate, action_id: Option<&str>) -> Result<TaskState> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction().map_err(MemoryError::from)?;
            let mut current = load_task(&tx, id)?
                .ok_or_else(|| MemoryError::NotFound(format!("task {id}")))?;

            if let Some(action_id) = action_id {
                if action_already_applied(&tx, id, action_id)? {
                    return Ok(current);
                }
            }

            if let Some(expected) = update.version {
                if expected != current.version {
                    return Err(MemoryError::Conflict(format!(
                        "task {id} version mismatch: expected {expected}, found {}",
                        current.version
                    )));
                }
            }

            if let Some(goal) = update.goal {
                current.goal = goal;
            }
            if let Some(status) = update.status {
                current.status = status;
            }
            if let Some(constraints) = update.constraints {
                current.constraints = constraints;
            }
            if let Some(plan) = update.plan {
                current.plan = plan;
            }
            if let Some(done) = update.done {
                current.done = done;
            }
            if let Some(blocked) = update.blocked {
                current.blocked = blocked;
            }
            if update.next_action.is_some() {
                current.next_action = update.next_action;
            }
            if let Some(metadata) = update.metadata {
                current.metadata = Some(metadata);
            }

            current.version += 1;
            current.updated_at = now_ms();

            update_task_row(&tx, &current)?;
            insert_snapshot(&tx, &current)?;
            if let Some(action_id) = action_id {
                record_action(&tx, id, action_id, current.version)?;
            }
            tx.commit().map_err(MemoryError::from)?;
            Ok(current)
        })
    }

    /// Construct a new row whose fields equal the snapshot at `version`, but
    /// with a strictly greater version than current — never decreases
    /// version.
    pub fn rollback(&self, id: Uuid, version: i64) -> Result<TaskState> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction().map_err(MemoryError::from)?;
            let snapshot: String = tx
                .query_row(
                    "SELECT state FROM task_snapshots WHERE task_id = ?1 AND version = ?2",
                    params![id.to_string(), version],
                    |r| r.get(0),
                )
                .optional()
                .map_err(MemoryError::from)?
                .ok_or_else(|| MemoryError::NotFound(format!("task {id} snapshot v{version}")))?;

            let mut restored: TaskState = serde_json::from_str(&snapshot)?;
            let current = load_task(&tx, id)?
                .ok_or_else(|| MemoryError::NotFound(format!("task {id}")))?;
            restored.version = current.version + 1;
            restored.updated_at = now_ms();

            update_task_row(&tx, &restored)?;
            insert_snapshot(&tx, &restored)?;
            tx.commit().map_err(MemoryError::from)?;
            Ok(restored)
        })
    }

    pub fn snapshot_count(&self, id: Uuid) -> Result<usize> {
        self.db.with(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_snapshots WHERE task_id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Most recently updated non-terminal task for the session, or `None`.
    pub fn get_current(&self, session_id: Option<&str>) -> Result<Option<TaskState>> {
        self.db.with(|conn| {
            let sql = if session_id.is_some() {
                "SELECT id FROM tasks WHERE session_id = ?1 AND status NOT IN ('completed','failed','cancelled')
                 ORDER BY updated_at DESC LIMIT 1"
            } else {
                "SELECT id FROM tasks WHERE status NOT IN ('completed','failed','cancelled')
                 ORDER BY updated_at DESC LIMIT 1"
            };
            let id: Option<String> = if let Some(sid) = session_id {
                conn.query_row(sql, params![sid], |r| r.get(0)).optional()?
            } else {
                conn.query_row(sql, [], |r| r.get(0)).optional()?
            };
            match id {
                Some(id) => load_task(conn, Uuid::parse_str(&id).unwrap_or_default()),
                None => Ok(None),
            }
        })
    }
}

fn load_task(conn: &rusqlite::Connection, id: Uuid) -> Result<Option<TaskState>> {
    conn.query_row(
        "SELECT goal, status, constraints, plan, done, blocked, next_action, updated_at, version, session_id, metadata
         FROM tasks WHERE id = ?1",
        params![id.to_string()],
        |row| {
            let status: String = row.get(1)?;
            let constraints: String = row.get(2)?;
            let plan: String = row.get(3)?;
            let done: String = row.get(4)?;
            let blocked: String = row.get(5)?;
            let metadata: Option<String> = row.get(10)?;
            Ok(TaskState {
                id,
                goal: row.get(0)?,
                status: TaskStatus::from_str_opt(&status).unwrap_or(TaskStatus::Pending),
                constraints: serde_json::from_str::<Vec<Constraint>>(&constraints).unwrap_or_default(),
                plan: serde_json::from_str::<Vec<PlanStep>>(&plan).unwrap_or_default(),
                done: serde_json::from_str(&done).unwrap_or_default(),
                blocked: serde_json::from_str(&blocked).unwrap_or_default(),
                next_action: row.get(6)?,
                updated_at: row.get(7)?,
                version: row.get(8)?,
                session_id: row.get(9)?,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            })
        },
    )
    .optional()
    .map_err(MemoryError::from)
}

fn insert_task_row(conn: &rusqlite::Connection, state: &TaskState) -> Result<()> {
    let constraints = serde_json::to_string(&state.constraints)?;
    let plan = serde_json::to_string(&state.plan)?;
    let done = serde_json::to_string(&state.done)?;
    let blocked = serde_json::to_string(&state.blocked)?;
    let metadata = state.metadata.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO tasks (id, goal, status, constraints, plan, done, blocked, next_action, updated_at, version, session_id, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            state.id.to_string(),
            state.goal,
            state.status.as_str(),
            constraints,
            plan,
            done,
            blocked,
            state.next_action,
            state.updated_at,
            state.version,
            state.session_id,
            metadata,
        ],
    )?;
    Ok(())
}

fn update_task_row(conn: &rusqlite::Connection, state: &TaskState) -> Result<()> {
    let constraints = serde_json::to_string(&state.constraints)?;
    let plan = serde_json::to_string(&state.plan)?;
    let done = serde_json::to_string(&state.done)?;
    let blocked = serde_json::to_string(&state.blocked)?;
    let metadata = state.metadata.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        "UPDATE tasks SET goal=?2, status=?3, constraints=?4, plan=?5, done=?6, blocked=?7,
            next_action=?8, updated_at=?9, version=?10, session_id=?11, metadata=?12
         WHERE id = ?1",
        params![
            state.id.to_string(),
            state.goal,
            state.status.as_str(),
            constraints,
            plan,
            done,
            blocked,
            state.next_action,
            state.updated_at,
            state.version,
            state.session_id,
            metadata,
        ],
    )?;
    Ok(())
}

fn action_already_applied(conn: &rusqlite::Connection, task_id: Uuid, action_id: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM task_actions WHERE task_id = ?1 AND action_id = ?2",
        params![task_id.to_string(), action_id],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

fn record_action(conn: &rusqlite::Connection, task_id: Uuid, action_id: &str, version: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO task_actions (task_id, action_id, version, recorded_at) VALUES (?1, ?2, ?3, ?4)",
        params![task_id.to_string(), action_id, version, now_ms()],
    )?;
    Ok(())
}

fn insert_snapshot(conn: &rusqlite::Connection, state: &TaskState) -> Result<()> {
    let serialised = serde_json::to_string(state)?;
    conn.execute(
        "INSERT INTO task_snapshots (task_id, version, state, recorded_at) VALUES (?1, ?2, ?3, ?4)",
        params![state.id.to_string(), state.version, serialised, now_ms()],
    )?;
    Ok(())
}

// ── StateReducer ─────────────────────────────────────────────────────────
//
// Pure, synchronous transition logic with no IO. The store persists only
// the resulting fields; callers apply the reducer, then pass the
// resulting `{state, action_id}` through `update`.

#[derive(Debug, Clone)]
pub struct ReducerOutcome {
    pub plan: Vec<PlanStep>,
    pub done: std::collections::BTreeSet<String>,
    pub blocked: std::collections::BTreeSet<String>,
    pub action_id: String,
}

pub struct StateReducer;

impl StateReducer {
    pub fn add_step(task: &TaskState, step: PlanStep) -> ReducerOutcome {
        let mut plan = task.plan.clone();
        plan.push(step);
        ReducerOutcome {
            plan,
            done: task.done.clone(),
            blocked: task.blocked.clone(),
            action_id: Uuid::new_v4().to_string(),
        }
    }

    /// Idempotent on identical `action_id`: repeated calls leave `done`
    /// unchanged (no duplicate entries) and the caller's resulting version
    /// bump happens at most once per distinct `action_id`.
    pub fn complete_step(task: &TaskState, step_id: &str, result: Option<serde_json::Value>, action_id: &str) -> ReducerOutcome {
        let already_done = task.done.contains(step_id);
        let mut plan = task.plan.clone();
        let mut done = task.done.clone();
        let mut blocked = task.blocked.clone();

        if !already_done {
            for step in &mut plan {
                if step.id == step_id {
                    step.status = TaskStatus::Completed;
                    step.result = result.clone();
                    step.action_id = Some(action_id.to_string());
                }
            }
            done.insert(step_id.to_string());
            blocked.remove(step_id);
        }

        ReducerOutcome {
            plan,
            done,
            blocked,
            action_id: action_id.to_string(),
        }
    }

    pub fn block_step(task: &TaskState, step_id: &str, reason: &str) -> ReducerOutcome {
        let mut plan = task.plan.clone();
        let mut blocked = task.blocked.clone();
        for step in &mut plan {
            if step.id == step_id {
                step.status = TaskStatus::Blocked;
                step.blocked_by = Some(reason.to_string());
            }
        }
        blocked.insert(step_id.to_string());
        ReducerOutcome {
            plan,
            done: task.done.clone(),
            blocked,
            action_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn unblock_step(task: &TaskState, step_id: &str) -> ReducerOutcome {
        let mut plan = task.plan.clone();
        let mut blocked = task.blocked.clone();
        for step in &mut plan {
            if step.id == step_id {
                step.status = TaskStatus::Pending;
                step.blocked_by = None;
            }
        }
        blocked.remove(step_id);
        ReducerOutcome {
            plan,
            done: task.done.clone(),
            blocked,
            action_id: Uuid::new_v4().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(Db::open_in_memory().unwrap())
    }

    fn plan_steps() -> Vec<PlanStep> {
        vec!["s1", "s2", "s3"]
            .into_iter()
            .map(|id| PlanStep {
                id: id.to_string(),
                description: id.to_string(),
                status: TaskStatus::Pending,
                dependencies: Default::default(),
                result: None,
                action_id: None,
                blocked_by: None,
            })
            .collect()
    }

    #[test]
    fn create_assigns_version_one() {
        let store = store();
        let task = store.create(TaskCreateInput { goal: "ship it".into(), plan: plan_steps(), ..Default::default() }).unwrap();
        assert_eq!(task.version, 1);
        assert_eq!(store.snapshot_count(task.id).unwrap(), 1);
    }

    #[test]
    fn version_mismatch_is_a_conflict() {
        let store = store();
        let task = store.create(TaskCreateInput { goal: "g".into(), ..Default::default() }).unwrap();
        let err = store
            .update(task.id, TaskUpdate { version: Some(task.version + 1), ..Default::default() }, None)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Conflict(_)));
    }

    #[test]
    fn complete_step_is_idempotent_on_same_action_id() {
        let store = store();
        let task = store.create(TaskCreateInput { goal: "g".into(), plan: plan_steps(), ..Default::default() }).unwrap();

        let mut current = task;
        for _ in 0..3 {
            let outcome = StateReducer::complete_step(&current, "s1", None, "A");
            current = store
                .update(
                    current.id,
                    TaskUpdate {
                        plan: Some(outcome.plan),
                        done: Some(outcome.done),
                        blocked: Some(outcome.blocked),
                        ..Default::default()
                    },
                    Some(&outcome.action_id),
                )
                .unwrap();
        }

        assert_eq!(current.done.len(), 1);
        assert!(current.done.contains("s1"));
        assert_eq!(current.version, 2);
    }

    #[test]
    fn rollback_never_decreases_version() {
        let store = store();
        let task = store.create(TaskCreateInput { goal: "g".into(), ..Default::default() }).unwrap();
        let v1_goal = task.goal.clone();
        let updated = store
            .update(task.id, TaskUpdate { goal: Some("changed".into()), ..Default::default() }, None)
            .unwrap();
        assert_eq!(updated.version, 2);

        let rolled_back = store.rollback(task.id, 1).unwrap();
        assert_eq!(rolled_back.goal, v1_goal);
        assert_eq!(rolled_back.version, 3);
    }

    #[test]
    fn get_current_skips_terminal_tasks() {
        let store = store();
        let task = store
            .create(TaskCreateInput { goal: "g".into(), session_id: Some("s1".into()), ..Default::default() })
            .unwrap();
        store
            .update(task.id, TaskUpdate { status: Some(TaskStatus::Completed), ..Default::default() }, None)
            .unwrap();
        assert!(store.get_current(Some("s1")).unwrap().is_none());
    }
}
