//! Semantic chunk store: full-text (FTS5/bm25) and vector similarity search,
//! fused into one hybrid ranking.

use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::{check_cancelled, CancellationToken};
use crate::config::VectorConfig;
use crate::db::Db;
use crate::error::{MemoryError, Result};
use crate::schema::{
    dedupe_tags, now_ms, ChunkHit, ChunkInput, ChunkSearchOptions, MatchType, SemanticChunk,
};

/// Abstraction over "given a query vector, return the nearest stored
/// embeddings". The default and only shipped backend is [`ExactScanBackend`];
/// this trait exists so a future index-backed implementation can slot in
/// without touching callers.
pub trait VectorBackend: Send + Sync {
    fn search(&self, db: &Db, query: &[f32], limit: usize, max_scan_rows: usize) -> Result<Vec<(Uuid, f32)>>;
}

/// Brute-force cosine similarity over every stored `chunk_vectors` row.
/// Refuses with [`MemoryError::VectorDisabled`] above `max_scan_rows` rather
/// than silently degrading to an unbounded scan.
pub struct ExactScanBackend;

impl VectorBackend for ExactScanBackend {
    fn search(&self, db: &Db, query: &[f32], limit: usize, max_scan_rows: usize) -> Result<Vec<(Uuid, f32)>> {
        db.with(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunk_vectors", [], |r| r.get(0))?;
            if count as usize > max_scan_rows {
                return Err(MemoryError::VectorDisabled);
            }

            let mut stmt = conn.prepare("SELECT chunk_id, embedding FROM chunk_vectors")?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let bytes: Vec<u8> = row.get(1)?;
                Ok((id, bytes))
            })?;

            let mut scored = Vec::new();
            for row in rows {
                let (id, bytes) = row?;
                let Ok(vector) = decode_vector(&bytes) else { continue };
                let Ok(id) = Uuid::parse_str(&id) else { continue };
                scored.push((id, cosine_similarity(query, &vector)));
            }
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(limit);
            Ok(scored)
        })
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn encode_vector(vector: &[f32]) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(vector, bincode::config::standard())
        .map_err(|e| MemoryError::Invalid(format!("vector encode: {e}")))
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    let (vector, _): (Vec<f32>, usize) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| MemoryError::Invalid(format!("vector decode: {e}")))?;
    Ok(vector)
}

pub struct SemanticStore {
    db: Db,
    vector: VectorConfig,
    backend: Box<dyn VectorBackend>,
}

impl SemanticStore {
    pub fn new(db: Db, vector: VectorConfig) -> Self {
        Self { db, vector, backend: Box::new(ExactScanBackend) }
    }

    pub fn with_backend(db: Db, vector: VectorConfig, backend: Box<dyn VectorBackend>) -> Self {
        Self { db, vector, backend }
    }

    pub fn add(&self, input: ChunkInput) -> Result<SemanticChunk> {
        if input.text.trim().is_empty() {
            return Err(MemoryError::Invalid("chunk text must not be empty".into()));
        }
        if let Some(embedding) = &input.embedding {
            if embedding.len() != self.vector.dimension {
                return Err(MemoryError::Invalid(format!(
                    "embedding dimension {} does not match configured {}",
                    embedding.len(),
                    self.vector.dimension
                )));
            }
        }

        let chunk = SemanticChunk {
            id: Uuid::new_v4(),
            timestamp: now_ms(),
            text: input.text,
            tags: dedupe_tags(input.tags),
            source_event_id: input.source_event_id,
            source_type: input.source_type,
            session_id: input.session_id,
            embedding: input.embedding,
            metadata: input.metadata,
        };

        self.db.with(|conn| {
            let tags = serde_json::to_string(&chunk.tags)?;
            let metadata = chunk.metadata.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "INSERT INTO chunks (id, timestamp, text, tags, source_event_id, source_type, session_id, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    chunk.id.to_string(),
                    chunk.timestamp,
                    chunk.text,
                    tags,
                    chunk.source_event_id.map(|id| id.to_string()),
                    chunk.source_type,
                    chunk.session_id,
                    metadata,
                ],
            )
            .map_err(|e| MemoryError::database("chunk insert", e))?;

            if let Some(embedding) = &chunk.embedding {
                let bytes = encode_vector(embedding)?;
                conn.execute(
                    "INSERT INTO chunk_vectors (chunk_id, embedding) VALUES (?1, ?2)",
                    params![chunk.id.to_string(), bytes],
                )
                .map_err(|e| MemoryError::database("chunk vector insert", e))?;
            }
            Ok(())
        })?;

        debug!(chunk_id = %chunk.id, has_embedding = chunk.embedding.is_some(), "semantic chunk recorded");
        Ok(chunk)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<SemanticChunk>> {
        self.db.with(|conn| load_chunk(conn, id))
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        self.db.with(|conn| {
            let n = conn.execute("DELETE FROM chunks WHERE id = ?1", params![id.to_string()])?;
            Ok(n > 0)
        })
    }

    pub fn delete_by_session(&self, session_id: &str) -> Result<usize> {
        self.db.with(|conn| {
            let n = conn.execute("DELETE FROM chunks WHERE session_id = ?1", params![session_id])?;
            Ok(n)
        })
    }

    pub fn count(&self) -> Result<usize> {
        self.db.with(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }

    /// Full-text search over `chunks_fts`, scored by `bm25()` (lower is
    /// better in SQLite's convention; we negate so higher is better like
    /// every other score in this crate).
    pub fn search_fts(&self, query: &str, options: &ChunkSearchOptions) -> Result<Vec<ChunkHit>> {
        let match_expr = fts_match_expression(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, bm25(chunks_fts) AS rank
                 FROM chunks_fts
                 JOIN chunks c ON c.rowid = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?1
                 ORDER BY rank LIMIT ?2",
            )?;
            let limit = if options.limit == 0 { 20 } else { options.limit } as i64;
            let rows = stmt
                .query_map(params![match_expr, limit], |row| {
                    let id: String = row.get(0)?;
                    let rank: f64 = row.get(1)?;
                    Ok((id, rank))
                })
                .map_err(|e| MemoryError::SemanticSearch(e.to_string()))?;

            let mut hits = Vec::new();
            for row in rows {
                let (id, rank) = row.map_err(|e| MemoryError::SemanticSearch(e.to_string()))?;
                let Ok(id) = Uuid::parse_str(&id) else { continue };
                let Some(chunk) = load_chunk(conn, id)? else { continue };
                if !matches_options(&chunk, options) {
                    continue;
                }
                hits.push(ChunkHit { chunk, score: (-rank) as f32, match_type: MatchType::Fts });
            }
            Ok(hits)
        })
    }

    pub fn search_vector(&self, query_embedding: &[f32], options: &ChunkSearchOptions) -> Result<Vec<ChunkHit>> {
        let limit = if options.limit == 0 { 20 } else { options.limit };
        let scored = self.backend.search(&self.db, query_embedding, limit * 3, self.vector.max_exact_scan_rows)?;

        self.db.with(|conn| {
            let mut hits = Vec::new();
            for (id, score) in scored {
                let Some(chunk) = load_chunk(conn, id)? else { continue };
                if !matches_options(&chunk, options) {
                    continue;
                }
                hits.push(ChunkHit { chunk, score, match_type: MatchType::Vector });
                if hits.len() >= limit {
                    break;
                }
            }
            Ok(hits)
        })
    }

    /// Weighted fusion of FTS and vector search, each min-max normalised to
    /// `[0, 1]` before combining so neither leg's raw scale dominates.
    ///
    /// `cancel`, if given, is checked between the two fetch legs; a
    /// cancellation there skips the (potentially expensive) vector scan and
    /// returns `Err(MemoryError::Cancelled)` before fusion runs.
    pub fn search_hybrid(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        options: &ChunkSearchOptions,
        fts_weight: f32,
        vector_weight: f32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ChunkHit>> {
        let fetch_limit = options.limit.saturating_mul(2);
        let leg_options = ChunkSearchOptions { limit: fetch_limit, ..options.clone() };

        let fts_hits = self.search_fts(query, &leg_options).unwrap_or_else(|e| {
            warn!(error = %e, "fts leg of hybrid search failed, continuing vector-only");
            Vec::new()
        });

        check_cancelled(cancel)?;

        let vector_hits = if options.disable_vector {
            Vec::new()
        } else if let Some(embedding) = query_embedding {
            match self.search_vector(embedding, &leg_options) {
                Ok(hits) => hits,
                Err(MemoryError::VectorDisabled) => Vec::new(),
                Err(e) => {
                    warn!(error = %e, "vector leg of hybrid search failed, continuing fts-only");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let fts_norm = normalise(&fts_hits.iter().map(|h| h.score).collect::<Vec<_>>());
        let vec_norm = normalise(&vector_hits.iter().map(|h| h.score).collect::<Vec<_>>());

        let mut combined: std::collections::HashMap<Uuid, (SemanticChunk, f32, bool, bool)> = std::collections::HashMap::new();

        for (hit, norm) in fts_hits.into_iter().zip(fts_norm) {
            let id = hit.chunk.id;
            combined.insert(id, (hit.chunk, norm * fts_weight, true, false));
        }
        for (hit, norm) in vector_hits.into_iter().zip(vec_norm) {
            let id = hit.chunk.id;
            combined
                .entry(id)
                .and_modify(|(_, score, _, has_vec)| {
                    *score += norm * vector_weight;
                    *has_vec = true;
                })
                .or_insert((hit.chunk, norm * vector_weight, false, true));
        }

        let mut hits: Vec<ChunkHit> = combined
            .into_values()
            .map(|(chunk, score, has_fts, has_vec)| ChunkHit {
                chunk,
                score,
                match_type: if has_fts && has_vec { MatchType::Hybrid } else if has_vec { MatchType::Vector } else { MatchType::Fts },
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if options.limit > 0 {
            hits.truncate(options.limit);
        }
        Ok(hits)
    }

    /// Rebuild `chunks_fts` from `chunks` — recovery path if the FTS index
    /// and primary table drift apart (e.g. after a bulk import that bypassed
    /// the triggers).
    pub fn reindex(&self) -> Result<()> {
        self.db.with(|conn| {
            conn.execute("INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild')", [])
                .map_err(|e| MemoryError::database("fts reindex", e))?;
            Ok(())
        })
    }
}

/// Tokenises `query`, escapes embedded quotes, and builds a prefix-OR FTS5
/// expression: `"foo"* OR "bar"*`. Empty/punctuation-only queries yield an
/// empty string so callers can short-circuit rather than hit SQLite with an
/// unmatchable expression.
fn fts_match_expression(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"*", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn matches_options(chunk: &SemanticChunk, options: &ChunkSearchOptions) -> bool {
    if let Some(session_id) = &options.session_id {
        if chunk.session_id.as_deref() != Some(session_id.as_str()) {
            return false;
        }
    }
    if let Some(tags) = &options.tags {
        if !tags.iter().any(|t| chunk.tags.contains(t)) {
            return false;
        }
    }
    true
}

fn normalise(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if (max - min).abs() < f32::EPSILON {
        return scores.iter().map(|_| 1.0).collect();
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

fn load_chunk(conn: &rusqlite::Connection, id: Uuid) -> Result<Option<SemanticChunk>> {
    let chunk = conn
        .query_row(
            "SELECT id, timestamp, text, tags, source_event_id, source_type, session_id, metadata
             FROM chunks WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let tags: String = row.get(3)?;
                let source_event_id: Option<String> = row.get(4)?;
                let metadata: Option<String> = row.get(7)?;
                Ok(SemanticChunk {
                    id,
                    timestamp: row.get(1)?,
                    text: row.get(2)?,
                    tags: serde_json::from_str(&tags).unwrap_or_default(),
                    source_event_id: source_event_id.and_then(|s| Uuid::parse_str(&s).ok()),
                    source_type: row.get(5)?,
                    session_id: row.get(6)?,
                    embedding: None,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                })
            },
        )
        .optional()?;

    let Some(mut chunk) = chunk else { return Ok(None) };
    let embedding: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM chunk_vectors WHERE chunk_id = ?1",
            params![id.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(bytes) = embedding {
        chunk.embedding = decode_vector(&bytes).ok();
    }
    Ok(Some(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SemanticStore {
        SemanticStore::new(Db::open_in_memory().unwrap(), VectorConfig::default())
    }

    fn chunk(text: &str, embedding: Option<Vec<f32>>) -> ChunkInput {
        ChunkInput { text: text.into(), embedding, ..Default::default() }
    }

    #[test]
    fn add_then_get_round_trips_embedding() {
        let store = store();
        let vec = vec![1.0; 384];
        let added = store.add(chunk("hello world", Some(vec.clone()))).unwrap();
        let fetched = store.get(added.id).unwrap().unwrap();
        assert_eq!(fetched.embedding, Some(vec));
    }

    #[test]
    fn rejects_wrong_embedding_dimension() {
        let store = store();
        let err = store.add(chunk("hi", Some(vec![1.0, 2.0]))).unwrap_err();
        assert!(matches!(err, MemoryError::Invalid(_)));
    }

    #[test]
    fn fts_search_finds_matching_text() {
        let store = store();
        store.add(chunk("the quick brown fox", None)).unwrap();
        store.add(chunk("a lazy dog sleeps", None)).unwrap();

        let hits = store.search_fts("fox", &ChunkSearchOptions { limit: 10, ..Default::default() }).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].chunk.text.contains("fox"));
    }

    #[test]
    fn hybrid_search_combines_both_legs() {
        let embedding = vec![1.0, 0.0, 0.0];
        let cfg = VectorConfig { dimension: 3, ..VectorConfig::default() };
        let store = SemanticStore::new(Db::open_in_memory().unwrap(), cfg);

        store.add(ChunkInput { text: "rust programming language".into(), embedding: Some(embedding.clone()), ..Default::default() }).unwrap();
        store.add(ChunkInput { text: "unrelated gardening tips".into(), embedding: Some(vec![0.0, 1.0, 0.0]), ..Default::default() }).unwrap();

        let hits = store
            .search_hybrid("rust", Some(&embedding), &ChunkSearchOptions { limit: 5, ..Default::default() }, 0.3, 0.7, None)
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk.text, "rust programming language");
    }

    #[test]
    fn hybrid_search_respects_cancellation() {
        let embedding = vec![1.0, 0.0, 0.0];
        let cfg = VectorConfig { dimension: 3, ..VectorConfig::default() };
        let store = SemanticStore::new(Db::open_in_memory().unwrap(), cfg);
        store.add(ChunkInput { text: "rust programming language".into(), embedding: Some(embedding.clone()), ..Default::default() }).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = store
            .search_hybrid("rust", Some(&embedding), &ChunkSearchOptions { limit: 5, ..Default::default() }, 0.3, 0.7, Some(&token))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Cancelled));
    }

    #[test]
    fn reindex_does_not_error_on_empty_store() {
        let store = store();
        store.reindex().unwrap();
    }
}
