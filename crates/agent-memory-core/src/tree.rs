//! Closure-table + path-enumeration tree index: nodes, ancestor/descendant
//! closure rows, and tree-aware chunk search.
//!
//! Every structural mutation — insert, delete, move — runs inside one
//! `unchecked_transaction` so the node table and its closure rows never
//! drift apart.

use std::collections::HashSet;

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{MemoryError, Result};
use crate::schema::{
    now_ms, ChunkSearchOptions, MatchType, TreeNode, TreeNodeInput, TreeRoot,
    TreeSearchResult, TreeSubtree, TreeType,
};
use crate::semantic_store::SemanticStore;

#[derive(Clone)]
pub struct TreeIndex {
    db: Db,
}

impl TreeIndex {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn create_root(&self, tree_type: TreeType, name: &str, root_path: &str, metadata: Option<serde_json::Value>) -> Result<TreeRoot> {
        let root = TreeRoot {
            id: Uuid::new_v4(),
            tree_type,
            name: name.to_string(),
            root_path: root_path.to_string(),
            metadata,
            created_at: now_ms(),
            updated_at: now_ms(),
        };
        self.db.with(|conn| {
            let metadata = root.metadata.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "INSERT INTO tree_roots (id, tree_type, name, root_path, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![root.id.to_string(), tree_type_str(root.tree_type), root.name, root.root_path, metadata, root.created_at, root.updated_at],
            )
            .map_err(|e| MemoryError::database("tree root insert", e))?;
            Ok(())
        })?;
        Ok(root)
    }

    /// Insert a node under `tree_root_id`, with `input.parent_id = None`
    /// meaning "direct child of the root". Maintains closure rows in the
    /// same transaction: a self-row at depth 0, and one row per ancestor of
    /// the declared parent at `depth(ancestor→parent) + 1`.
    pub fn create_node(&self, tree_root_id: Uuid, tree_type: TreeType, input: TreeNodeInput) -> Result<TreeNode> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction().map_err(MemoryError::from)?;

            let parent_row = match input.parent_id {
                Some(parent_id) => Some(
                    tx.query_row("SELECT path, depth FROM tree_nodes WHERE id = ?1", params![parent_id.to_string()], |r| {
                        Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
                    })
                    .map_err(|_| MemoryError::NotFound(format!("parent node {parent_id}")))?,
                ),
                None => None,
            };

            let depth = parent_row.as_ref().map(|(_, d)| d + 1).unwrap_or(0);
            let parent_path = parent_row.map(|(p, _)| p).unwrap_or_default();
            let path = if parent_path.is_empty() {
                input.name.clone()
            } else {
                format!("{parent_path}/{}", input.name)
            };

            let sort_order = input.sort_order.unwrap_or(0);
            let node = TreeNode {
                id: Uuid::new_v4(),
                tree_type,
                tree_root_id,
                node_type: input.node_type,
                name: input.name,
                path,
                depth,
                parent_id: input.parent_id,
                sort_order,
                chunk_id: input.chunk_id,
                metadata: input.metadata,
                created_at: now_ms(),
                updated_at: now_ms(),
            };

            let metadata = node.metadata.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "INSERT INTO tree_nodes (id, tree_type, tree_root_id, node_type, name, path, depth, parent_id, sort_order, chunk_id, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    node.id.to_string(),
                    tree_type_str(node.tree_type),
                    node.tree_root_id.to_string(),
                    node.node_type,
                    node.name,
                    node.path,
                    node.depth,
                    node.parent_id.map(|p| p.to_string()),
                    node.sort_order,
                    node.chunk_id.map(|c| c.to_string()),
                    metadata,
                    node.created_at,
                    node.updated_at,
                ],
            )
            .map_err(|e| if is_unique_violation(&e) {
                MemoryError::Conflict(format!("path already exists under this root: {}", node.path))
            } else {
                MemoryError::database("tree node insert", e)
            })?;

            tx.execute(
                "INSERT INTO tree_closure (ancestor_id, descendant_id, depth) VALUES (?1, ?1, 0)",
                params![node.id.to_string()],
            )?;

            if let Some(parent_id) = node.parent_id {
                let ancestors: Vec<(String, u32)> = {
                    let mut stmt = tx.prepare(
                        "SELECT ancestor_id, depth FROM tree_closure WHERE descendant_id = ?1",
                    )?;
                    stmt.query_map(params![parent_id.to_string()], |r| Ok((r.get(0)?, r.get(1)?)))?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                };
                for (ancestor_id, ancestor_depth) in ancestors {
                    tx.execute(
                        "INSERT INTO tree_closure (ancestor_id, descendant_id, depth) VALUES (?1, ?2, ?3)",
                        params![ancestor_id, node.id.to_string(), ancestor_depth + 1],
                    )?;
                }
            }

            tx.commit().map_err(MemoryError::from)?;
            Ok(node)
        })
    }

    pub fn get_node(&self, id: Uuid) -> Result<Option<TreeNode>> {
        self.db.with(|conn| load_node(conn, id))
    }

    pub fn get_node_by_path(&self, tree_root_id: Uuid, path: &str) -> Result<Option<TreeNode>> {
        self.db.with(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM tree_nodes WHERE tree_root_id = ?1 AND path = ?2",
                    params![tree_root_id.to_string(), path],
                    |r| r.get(0),
                )
                .optional()?;
            match id.and_then(|id| Uuid::parse_str(&id).ok()) {
                Some(id) => load_node(conn, id),
                None => Ok(None),
            }
        })
    }

    /// Updates `name`, `node_type`, `sort_order`, and `metadata` in place.
    /// Does not touch `path`/`parent_id`/`depth` — use `move_subtree` to
    /// reparent.
    pub fn update_node(&self, id: Uuid, input: TreeNodeInput) -> Result<TreeNode> {
        self.db.with(|conn| {
            let metadata = input.metadata.as_ref().map(serde_json::to_string).transpose()?;
            let n = conn.execute(
                "UPDATE tree_nodes SET name = ?1, node_type = ?2, sort_order = ?3, metadata = ?4, updated_at = ?5 WHERE id = ?6",
                params![
                    input.name,
                    input.node_type,
                    input.sort_order.unwrap_or(0),
                    metadata,
                    now_ms(),
                    id.to_string(),
                ],
            )?;
            if n == 0 {
                return Err(MemoryError::NotFound(format!("node {id}")));
            }
            load_node(conn, id)?.ok_or_else(|| MemoryError::NotFound(format!("node {id}")))
        })
    }

    /// Delete a node and its whole subtree: every closure row whose
    /// descendant is reachable from `node_id` is removed first, then every
    /// reachable node row (including `node_id` itself) is deleted.
    pub fn delete_subtree(&self, node_id: Uuid) -> Result<usize> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction().map_err(MemoryError::from)?;
            let descendants: Vec<String> = {
                let mut stmt = tx.prepare("SELECT descendant_id FROM tree_closure WHERE ancestor_id = ?1")?;
                stmt.query_map(params![node_id.to_string()], |r| r.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            for descendant in &descendants {
                tx.execute("DELETE FROM tree_closure WHERE descendant_id = ?1", params![descendant])?;
            }
            let mut deleted = 0;
            for descendant in &descendants {
                deleted += tx.execute("DELETE FROM tree_nodes WHERE id = ?1", params![descendant])?;
            }
            tx.commit().map_err(MemoryError::from)?;
            Ok(deleted)
        })
    }

    /// Reparent `node_id` under `new_parent_id` (or to root level if `None`).
    /// Rewrites closure rows for the node and every one of its descendants.
    pub fn move_subtree(&self, node_id: Uuid, new_parent_id: Option<Uuid>) -> Result<()> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction().map_err(MemoryError::from)?;

            let node = load_node(&tx, node_id)?.ok_or_else(|| MemoryError::NotFound(format!("node {node_id}")))?;

            let new_parent_ancestors: Vec<(String, u32)> = match new_parent_id {
                Some(parent_id) => {
                    let mut stmt = tx.prepare("SELECT ancestor_id, depth FROM tree_closure WHERE descendant_id = ?1")?;
                    stmt.query_map(params![parent_id.to_string()], |r| Ok((r.get(0)?, r.get(1)?)))?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
                None => Vec::new(),
            };

            let descendants: Vec<(String, u32)> = {
                let mut stmt = tx.prepare("SELECT descendant_id, depth FROM tree_closure WHERE ancestor_id = ?1")?;
                stmt.query_map(params![node_id.to_string()], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            // Only the edges from node_id's *old* ancestor chain down into the
            // subtree need rewriting. Deleting by `descendant_id` alone would
            // also wipe the internal node_id -> descendant closure rows that
            // the reinsertion loop below never recreates.
            let old_ancestor_ids: Vec<String> = {
                let mut stmt = tx.prepare("SELECT ancestor_id FROM tree_closure WHERE descendant_id = ?1 AND depth > 0")?;
                stmt.query_map(params![node_id.to_string()], |r| r.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            if !old_ancestor_ids.is_empty() {
                let descendant_placeholders = vec!["?"; descendants.len()].join(",");
                let ancestor_placeholders = vec!["?"; old_ancestor_ids.len()].join(",");
                let sql = format!(
                    "DELETE FROM tree_closure WHERE descendant_id IN ({descendant_placeholders}) AND ancestor_id IN ({ancestor_placeholders})"
                );
                let mut stmt = tx.prepare(&sql)?;
                let mut all_params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(descendants.len() + old_ancestor_ids.len());
                for (descendant, _) in &descendants {
                    all_params.push(descendant);
                }
                for ancestor in &old_ancestor_ids {
                    all_params.push(ancestor);
                }
                stmt.execute(all_params.as_slice())?;
            }

            for (descendant, relative_depth) in &descendants {
                for (ancestor_id, ancestor_depth) in &new_parent_ancestors {
                    tx.execute(
                        "INSERT INTO tree_closure (ancestor_id, descendant_id, depth) VALUES (?1, ?2, ?3)",
                        params![ancestor_id, descendant, ancestor_depth + relative_depth + 1],
                    )?;
                }
            }

            let new_depth = new_parent_ancestors.iter().map(|(_, d)| *d).max().map(|d| d + 1).unwrap_or(0);
            let depth_delta = new_depth as i64 - node.depth as i64;
            tx.execute(
                "UPDATE tree_nodes SET parent_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![new_parent_id.map(|p| p.to_string()), now_ms(), node_id.to_string()],
            )?;
            if depth_delta != 0 {
                tx.execute(
                    "UPDATE tree_nodes SET depth = depth + ?1 WHERE id IN (SELECT descendant_id FROM tree_closure WHERE ancestor_id = ?2)",
                    params![depth_delta, node_id.to_string()],
                )?;
            }

            tx.commit().map_err(MemoryError::from)?;
            Ok(())
        })
    }

    pub fn get_children(&self, node_id: Uuid) -> Result<Vec<TreeNode>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT n.id FROM tree_closure c
                 JOIN tree_nodes n ON n.id = c.descendant_id
                 WHERE c.ancestor_id = ?1 AND c.depth = 1
                 ORDER BY n.sort_order ASC, n.name ASC",
            )?;
            let ids: Vec<String> = stmt.query_map(params![node_id.to_string()], |r| r.get(0))?.collect::<std::result::Result<Vec<_>, _>>()?;
            ids.into_iter()
                .filter_map(|id| Uuid::parse_str(&id).ok())
                .map(|id| load_node(conn, id).transpose())
                .filter_map(|r| r)
                .collect()
        })
    }

    pub fn get_ancestors(&self, node_id: Uuid) -> Result<Vec<TreeNode>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT n.id FROM tree_closure c
                 JOIN tree_nodes n ON n.id = c.ancestor_id
                 WHERE c.descendant_id = ?1 AND c.depth > 0
                 ORDER BY c.depth DESC",
            )?;
            let ids: Vec<String> = stmt.query_map(params![node_id.to_string()], |r| r.get(0))?.collect::<std::result::Result<Vec<_>, _>>()?;
            ids.into_iter()
                .filter_map(|id| Uuid::parse_str(&id).ok())
                .map(|id| load_node(conn, id).transpose())
                .filter_map(|r| r)
                .collect()
        })
    }

    pub fn get_descendants(&self, node_id: Uuid, max_depth: Option<u32>) -> Result<Vec<TreeNode>> {
        self.db.with(|conn| {
            let mut stmt = if let Some(max) = max_depth {
                conn.prepare(
                    "SELECT n.id FROM tree_closure c JOIN tree_nodes n ON n.id = c.descendant_id
                     WHERE c.ancestor_id = ?1 AND c.depth > 0 AND c.depth <= ?2 ORDER BY c.depth ASC",
                )?
            } else {
                conn.prepare(
                    "SELECT n.id FROM tree_closure c JOIN tree_nodes n ON n.id = c.descendant_id
                     WHERE c.ancestor_id = ?1 AND c.depth > 0 ORDER BY c.depth ASC",
                )?
            };
            let ids: Vec<String> = if let Some(max) = max_depth {
                stmt.query_map(params![node_id.to_string(), max], |r| r.get(0))?.collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                stmt.query_map(params![node_id.to_string()], |r| r.get(0))?.collect::<std::result::Result<Vec<_>, _>>()?
            };
            ids.into_iter()
                .filter_map(|id| Uuid::parse_str(&id).ok())
                .map(|id| load_node(conn, id).transpose())
                .filter_map(|r| r)
                .collect()
        })
    }

    pub fn get_subtree(&self, node_id: Uuid) -> Result<Option<TreeSubtree>> {
        let Some(node) = self.get_node(node_id)? else { return Ok(None) };
        Ok(Some(self.build_subtree(node)?))
    }

    fn build_subtree(&self, node: TreeNode) -> Result<TreeSubtree> {
        let mut children = Vec::new();
        for child in self.get_children(node.id)? {
            children.push(self.build_subtree(child)?);
        }
        Ok(TreeSubtree { node, children })
    }

    pub fn link_chunk(&self, node_id: Uuid, chunk_id: Uuid) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE tree_nodes SET chunk_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![chunk_id.to_string(), now_ms(), node_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn unlink_chunk(&self, node_id: Uuid) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "UPDATE tree_nodes SET chunk_id = NULL, updated_at = ?1 WHERE id = ?2",
                params![now_ms(), node_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn get_chunks_in_subtree(&self, node_id: Uuid) -> Result<Vec<Uuid>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT n.chunk_id FROM tree_closure c
                 JOIN tree_nodes n ON n.id = c.descendant_id
                 WHERE c.ancestor_id = ?1 AND n.chunk_id IS NOT NULL",
            )?;
            let ids: Vec<String> = stmt.query_map(params![node_id.to_string()], |r| r.get(0))?.collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().filter_map(|id| Uuid::parse_str(&id).ok()).collect())
        })
    }

    pub fn get_nodes_by_chunk_id(&self, chunk_id: Uuid) -> Result<Vec<TreeNode>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM tree_nodes WHERE chunk_id = ?1")?;
            let ids: Vec<String> = stmt.query_map(params![chunk_id.to_string()], |r| r.get(0))?.collect::<std::result::Result<Vec<_>, _>>()?;
            ids.into_iter()
                .filter_map(|id| Uuid::parse_str(&id).ok())
                .map(|id| load_node(conn, id).transpose())
                .filter_map(|r| r)
                .collect()
        })
    }

    /// Fetch chunks under `root`, run semantic search over `limit * 2`
    /// candidates, intersect with the subtree's chunk set, then map
    /// survivors back to their tree nodes.
    pub fn search_in_subtree(
        &self,
        root: Uuid,
        query: &str,
        semantic: &SemanticStore,
        node_types: Option<&[String]>,
        attach_ancestors: bool,
        limit: usize,
    ) -> Result<Vec<TreeSearchResult>> {
        let subtree_chunks: HashSet<Uuid> = self.get_chunks_in_subtree(root)?.into_iter().collect();
        if subtree_chunks.is_empty() {
            return Ok(Vec::new());
        }

        let options = ChunkSearchOptions { limit: limit * 2, ..Default::default() };
        let hits = semantic.search_fts(query, &options)?;

        let mut results = Vec::new();
        for hit in hits {
            if !subtree_chunks.contains(&hit.chunk.id) {
                continue;
            }
            for node in self.get_nodes_by_chunk_id(hit.chunk.id)? {
                if let Some(types) = node_types {
                    if !types.iter().any(|t| t == &node.node_type) {
                        continue;
                    }
                }
                let ancestors = if attach_ancestors { Some(self.get_ancestors(node.id)?) } else { None };
                results.push(TreeSearchResult {
                    node,
                    score: hit.score,
                    match_type: MatchType::Hybrid,
                    chunk: Some(hit.chunk.clone()),
                    ancestors,
                });
            }
            if results.len() >= limit {
                break;
            }
        }
        results.truncate(limit);
        Ok(results)
    }

    /// LIKE-based name search, scored by match quality: exact 1.0, prefix
    /// 0.8, contains 0.5.
    pub fn search_by_name(&self, tree_root_id: Uuid, pattern: &str) -> Result<Vec<TreeSearchResult>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name FROM tree_nodes WHERE tree_root_id = ?1 AND name LIKE ?2",
            )?;
            let like_pattern = format!("%{pattern}%");
            let rows: Vec<(String, String)> = stmt
                .query_map(params![tree_root_id.to_string(), like_pattern], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut results = Vec::new();
            for (id, name) in rows {
                let Ok(id) = Uuid::parse_str(&id) else { continue };
                let Some(node) = load_node(conn, id)? else { continue };
                let score = match_quality(&name, pattern);
                results.push(TreeSearchResult { node, score, match_type: MatchType::Name, chunk: None, ancestors: None });
            }
            results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            Ok(results)
        })
    }

    pub fn search_by_path(&self, tree_root_id: Uuid, pattern: &str) -> Result<Vec<TreeSearchResult>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path FROM tree_nodes WHERE tree_root_id = ?1 AND path LIKE ?2",
            )?;
            let like_pattern = format!("%{pattern}%");
            let rows: Vec<(String, String)> = stmt
                .query_map(params![tree_root_id.to_string(), like_pattern], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut results = Vec::new();
            for (id, path) in rows {
                let Ok(id) = Uuid::parse_str(&id) else { continue };
                let Some(node) = load_node(conn, id)? else { continue };
                let score = match_quality(&path, pattern);
                results.push(TreeSearchResult { node, score, match_type: MatchType::Path, chunk: None, ancestors: None });
            }
            results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            Ok(results)
        })
    }

    /// Checks that every node has a self-closure row and that no closure row
    /// references a missing node. Returns the list of problems found (empty
    /// means the tree is consistent).
    pub fn validate_integrity(&self, tree_root_id: Uuid) -> Result<Vec<String>> {
        self.db.with(|conn| {
            let mut problems = Vec::new();

            let mut stmt = conn.prepare("SELECT id FROM tree_nodes WHERE tree_root_id = ?1")?;
            let node_ids: HashSet<String> = stmt
                .query_map(params![tree_root_id.to_string()], |r| r.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .collect();

            for id in &node_ids {
                let has_self: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tree_closure WHERE ancestor_id = ?1 AND descendant_id = ?1 AND depth = 0",
                    params![id],
                    |r| r.get(0),
                )?;
                if has_self == 0 {
                    problems.push(format!("node {id} missing self-closure row"));
                }
            }

            let mut stmt = conn.prepare(
                "SELECT ancestor_id, descendant_id FROM tree_closure
                 WHERE ancestor_id IN (SELECT id FROM tree_nodes WHERE tree_root_id = ?1)
                    OR descendant_id IN (SELECT id FROM tree_nodes WHERE tree_root_id = ?1)",
            )?;
            let closure_rows: Vec<(String, String)> = stmt
                .query_map(params![tree_root_id.to_string()], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (ancestor, descendant) in closure_rows {
                if !node_ids.contains(&ancestor) {
                    problems.push(format!("closure row references missing ancestor {ancestor}"));
                }
                if !node_ids.contains(&descendant) {
                    problems.push(format!("closure row references missing descendant {descendant}"));
                }
            }

            Ok(problems)
        })
    }
}

fn match_quality(haystack: &str, pattern: &str) -> f32 {
    if haystack.eq_ignore_ascii_case(pattern) {
        1.0
    } else if haystack.to_lowercase().starts_with(&pattern.to_lowercase()) {
        0.8
    } else {
        0.5
    }
}

fn tree_type_str(tree_type: TreeType) -> &'static str {
    match tree_type {
        TreeType::Code => "code",
        TreeType::Doc => "doc",
        TreeType::Event => "event",
        TreeType::Task => "task",
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn load_node(conn: &rusqlite::Connection, id: Uuid) -> Result<Option<TreeNode>> {
    conn.query_row(
        "SELECT id, tree_type, tree_root_id, node_type, name, path, depth, parent_id, sort_order, chunk_id, metadata, created_at, updated_at
         FROM tree_nodes WHERE id = ?1",
        params![id.to_string()],
        |row| {
            let tree_type: String = row.get(1)?;
            let tree_root_id: String = row.get(2)?;
            let parent_id: Option<String> = row.get(7)?;
            let chunk_id: Option<String> = row.get(9)?;
            let metadata: Option<String> = row.get(10)?;
            Ok(TreeNode {
                id,
                tree_type: tree_type_from_str(&tree_type),
                tree_root_id: Uuid::parse_str(&tree_root_id).unwrap_or_default(),
                node_type: row.get(3)?,
                name: row.get(4)?,
                path: row.get(5)?,
                depth: row.get(6)?,
                parent_id: parent_id.and_then(|p| Uuid::parse_str(&p).ok()),
                sort_order: row.get(8)?,
                chunk_id: chunk_id.and_then(|c| Uuid::parse_str(&c).ok()),
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                created_at: row.get(11)?,
                updated_at: row.get(12)?,
            })
        },
    )
    .optional()
    .map_err(MemoryError::from)
}

fn tree_type_from_str(s: &str) -> TreeType {
    match s {
        "doc" => TreeType::Doc,
        "event" => TreeType::Event,
        "task" => TreeType::Task,
        _ => TreeType::Code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> (TreeIndex, Uuid) {
        let db = Db::open_in_memory().unwrap();
        let tree = TreeIndex::new(db);
        let root = tree.create_root(TreeType::Code, "repo", "/repo", None).unwrap();
        (tree, root.id)
    }

    fn node_input(name: &str, parent_id: Option<Uuid>) -> TreeNodeInput {
        TreeNodeInput { node_type: "dir".into(), name: name.into(), parent_id, sort_order: None, chunk_id: None, metadata: None }
    }

    #[test]
    fn create_node_sets_self_closure_and_path() {
        let (tree, root_id) = index();
        let node = tree.create_node(root_id, TreeType::Code, node_input("src", None)).unwrap();
        assert_eq!(node.path, "src");
        assert_eq!(node.depth, 0);
        let problems = tree.validate_integrity(root_id).unwrap();
        assert!(problems.is_empty());
    }

    #[test]
    fn nested_children_inherit_ancestor_closure() {
        let (tree, root_id) = index();
        let src = tree.create_node(root_id, TreeType::Code, node_input("src", None)).unwrap();
        let lib = tree.create_node(root_id, TreeType::Code, node_input("lib.rs", Some(src.id))).unwrap();

        let ancestors = tree.get_ancestors(lib.id).unwrap();
        assert_eq!(ancestors.len(), 1);
        assert_eq!(ancestors[0].id, src.id);

        let descendants = tree.get_descendants(src.id, None).unwrap();
        assert_eq!(descendants.len(), 1);
        assert_eq!(descendants[0].id, lib.id);
        assert_eq!(lib.path, "src/lib.rs");
    }

    #[test]
    fn duplicate_path_under_same_root_conflicts() {
        let (tree, root_id) = index();
        tree.create_node(root_id, TreeType::Code, node_input("src", None)).unwrap();
        let err = tree.create_node(root_id, TreeType::Code, node_input("src", None)).unwrap_err();
        assert!(matches!(err, MemoryError::Conflict(_)));
    }

    #[test]
    fn delete_subtree_removes_all_descendants() {
        let (tree, root_id) = index();
        let src = tree.create_node(root_id, TreeType::Code, node_input("src", None)).unwrap();
        let lib = tree.create_node(root_id, TreeType::Code, node_input("lib.rs", Some(src.id))).unwrap();

        tree.delete_subtree(src.id).unwrap();
        assert!(tree.get_node(src.id).unwrap().is_none());
        assert!(tree.get_node(lib.id).unwrap().is_none());
    }

    #[test]
    fn move_subtree_updates_ancestor_closure() {
        let (tree, root_id) = index();
        let a = tree.create_node(root_id, TreeType::Code, node_input("a", None)).unwrap();
        let b = tree.create_node(root_id, TreeType::Code, node_input("b", None)).unwrap();
        let child = tree.create_node(root_id, TreeType::Code, node_input("child", Some(a.id))).unwrap();

        tree.move_subtree(child.id, Some(b.id)).unwrap();

        let ancestors = tree.get_ancestors(child.id).unwrap();
        assert_eq!(ancestors.len(), 1);
        assert_eq!(ancestors[0].id, b.id);
    }

    #[test]
    fn move_subtree_preserves_internal_descendant_closure() {
        let (tree, root_id) = index();
        let a = tree.create_node(root_id, TreeType::Code, node_input("a", None)).unwrap();
        let b = tree.create_node(root_id, TreeType::Code, node_input("b", None)).unwrap();
        let child = tree.create_node(root_id, TreeType::Code, node_input("child", Some(a.id))).unwrap();
        let grandchild = tree.create_node(root_id, TreeType::Code, node_input("grandchild", Some(child.id))).unwrap();

        tree.move_subtree(child.id, Some(b.id)).unwrap();

        let child_descendants = tree.get_descendants(child.id, None).unwrap();
        assert_eq!(child_descendants.len(), 1);
        assert_eq!(child_descendants[0].id, grandchild.id);

        let grandchild_ancestors = tree.get_ancestors(grandchild.id).unwrap();
        let ancestor_ids: Vec<Uuid> = grandchild_ancestors.iter().map(|n| n.id).collect();
        assert!(ancestor_ids.contains(&child.id));
        assert!(ancestor_ids.contains(&b.id));
        assert!(!ancestor_ids.contains(&a.id));

        assert!(tree.validate_integrity(root_id).unwrap().is_empty());
    }

    #[test]
    fn get_subtree_builds_nested_structure() {
        let (tree, root_id) = index();
        let a = tree.create_node(root_id, TreeType::Code, node_input("a", None)).unwrap();
        tree.create_node(root_id, TreeType::Code, node_input("b", Some(a.id))).unwrap();

        let subtree = tree.get_subtree(a.id).unwrap().unwrap();
        assert_eq!(subtree.children.len(), 1);
        assert_eq!(subtree.children[0].node.name, "b");
    }

    #[test]
    fn search_by_name_scores_exact_over_contains() {
        let (tree, root_id) = index();
        tree.create_node(root_id, TreeType::Code, node_input("lib", None)).unwrap();
        tree.create_node(root_id, TreeType::Code, node_input("liblike", None)).unwrap();

        let results = tree.search_by_name(root_id, "lib").unwrap();
        assert_eq!(results[0].node.name, "lib");
        assert_eq!(results[0].score, 1.0);
    }
}
