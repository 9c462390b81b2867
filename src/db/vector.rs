// src/db/vector.rs
// VectorStore: dual-representation embedding persistence (native sqlite-vec table +
// dense-BLOB fallback table) and nearest-neighbor search, per spec §4.4.
//
// Writes go to the native `vec0` table first (best-effort), then always to the BLOB
// table, which is the canonical row (it carries content + metadata). Re-writing the
// same id deletes before inserting, so a provider swap's dimension drift is tolerated
// per-row rather than requiring a global migration.

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{MemoryError, Result};

const MIN_DIMENSION: usize = 1;
const MAX_DIMENSION: usize = 10_000;

pub fn validate_dimension(dim: usize) -> Result<()> {
    if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&dim) {
        return Err(MemoryError::InvalidDimension(format!(
            "embedding dimension {dim} outside allowed range {MIN_DIMENSION}..={MAX_DIMENSION}"
        )));
    }
    Ok(())
}

pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Clone)]
pub struct ScoredEmbedding {
    pub rowid: i64,
    pub content: Option<String>,
    pub similarity: f32,
}

/// Which entity kind an embedding belongs to; each kind has its own vec0/BLOB table pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    Message,
    Decision,
    Mistake,
    Chunk,
}

impl EmbeddingKind {
    fn vec_table(self) -> &'static str {
        match self {
            EmbeddingKind::Message => "vec_messages",
            EmbeddingKind::Decision => "vec_decisions",
            EmbeddingKind::Mistake => "vec_mistakes",
            EmbeddingKind::Chunk => "vec_chunks",
        }
    }

    fn blob_table(self) -> &'static str {
        match self {
            EmbeddingKind::Message => "message_embeddings",
            EmbeddingKind::Decision => "decision_embeddings",
            EmbeddingKind::Mistake => "mistake_embeddings",
            EmbeddingKind::Chunk => "chunk_embeddings",
        }
    }

    fn blob_id_column(self) -> &'static str {
        match self {
            EmbeddingKind::Message => "message_id",
            EmbeddingKind::Decision => "decision_id",
            EmbeddingKind::Mistake => "mistake_id",
            EmbeddingKind::Chunk => "chunk_id",
        }
    }

    fn label(self) -> &'static str {
        match self {
            EmbeddingKind::Message => "message",
            EmbeddingKind::Decision => "decision",
            EmbeddingKind::Mistake => "mistake",
            EmbeddingKind::Chunk => "chunk",
        }
    }
}

fn ensure_vector_dims_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS vector_dims (kind TEXT PRIMARY KEY, dimension INTEGER NOT NULL);",
    )
}

fn recorded_dimension(conn: &Connection, kind: EmbeddingKind) -> rusqlite::Result<Option<usize>> {
    conn.query_row(
        "SELECT dimension FROM vector_dims WHERE kind = ?",
        [kind.label()],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|d| d as usize))
}

/// Ensure the native vec0 table exists for `kind` at dimension `dim`. Returns `true` if
/// the native table is usable (created or already matches `dim`), `false` if the
/// extension is unavailable or dimension doesn't match (caller falls back to BLOB-only).
fn ensure_vec_table(conn: &Connection, kind: EmbeddingKind, dim: usize) -> bool {
    if let Ok(ensure) = ensure_vector_dims_table(conn) {
        let _ = ensure;
    }
    match recorded_dimension(conn, kind) {
        Ok(Some(existing)) if existing != dim => return false,
        Ok(_) => {}
        Err(_) => return false,
    }

    let create = conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING vec0(embedding float[{}]);",
        kind.vec_table(),
        dim
    ));
    match create {
        Ok(()) => {
            let _ = conn.execute(
                "INSERT OR REPLACE INTO vector_dims (kind, dimension) VALUES (?, ?)",
                params![kind.label(), dim as i64],
            );
            true
        }
        Err(e) => {
            tracing::debug!(kind = kind.label(), error = %e, "native vector table unavailable, using BLOB fallback");
            false
        }
    }
}

/// Store an embedding for `rowid` under `kind`. Writes the native vec0 row first
/// (best-effort) then always writes the canonical BLOB row. Re-writes delete any
/// existing row first so dimension drift across provider swaps doesn't error.
pub fn store_embedding(
    conn: &Connection,
    kind: EmbeddingKind,
    rowid: i64,
    content: Option<&str>,
    embedding: &[f32],
    model_name: &str,
) -> Result<()> {
    validate_dimension(embedding.len())?;
    let bytes = serialize_embedding(embedding);
    let native_ok = ensure_vec_table(conn, kind, embedding.len());

    if native_ok {
        let _ = conn.execute(
            &format!("DELETE FROM {} WHERE rowid = ?", kind.vec_table()),
            [rowid],
        );
        if let Err(e) = conn.execute(
            &format!("INSERT INTO {} (rowid, embedding) VALUES (?, ?)", kind.vec_table()),
            params![rowid, bytes],
        ) {
            if !is_unique_violation(&e) {
                tracing::warn!(kind = kind.label(), error = %e, "native vector insert failed, BLOB row still written");
            }
        }
    }

    conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ?",
            kind.blob_table(),
            kind.blob_id_column()
        ),
        [rowid],
    )?;
    match kind {
        EmbeddingKind::Chunk => {
            return Err(MemoryError::InvalidInput(
                "store_embedding: use store_chunk_embedding for chunk rows (extra message_id column)".into(),
            ));
        }
        _ => {
            conn.execute(
                &format!(
                    "INSERT INTO {} ({}, content, embedding, model_name, created_at) VALUES (?, ?, ?, ?, strftime('%s','now') * 1000)",
                    kind.blob_table(),
                    kind.blob_id_column()
                ),
                params![rowid, content, bytes, model_name],
            )?;
        }
    }
    Ok(())
}

pub fn store_chunk_embedding(
    conn: &Connection,
    chunk_id: i64,
    message_id: i64,
    content: Option<&str>,
    embedding: &[f32],
    model_name: &str,
) -> Result<()> {
    validate_dimension(embedding.len())?;
    let bytes = serialize_embedding(embedding);
    let native_ok = ensure_vec_table(conn, EmbeddingKind::Chunk, embedding.len());

    if native_ok {
        let _ = conn.execute("DELETE FROM vec_chunks WHERE rowid = ?", [chunk_id]);
        if let Err(e) = conn.execute(
            "INSERT INTO vec_chunks (rowid, embedding) VALUES (?, ?)",
            params![chunk_id, bytes],
        ) && !is_unique_violation(&e)
        {
            tracing::warn!(error = %e, "native chunk vector insert failed, BLOB row still written");
        }
    }

    conn.execute("DELETE FROM chunk_embeddings WHERE chunk_id = ?", [chunk_id])?;
    conn.execute(
        "INSERT INTO chunk_embeddings (chunk_id, message_id, content, embedding, model_name, created_at) \
         VALUES (?, ?, ?, ?, ?, strftime('%s','now') * 1000)",
        params![chunk_id, message_id, content, bytes, model_name],
    )?;
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(ffi::Error { code: ffi::ErrorCode::ConstraintViolation, .. }, _)
    )
}

pub fn existing_ids(conn: &Connection, kind: EmbeddingKind) -> rusqlite::Result<std::collections::HashSet<i64>> {
    let col = kind.blob_id_column();
    let mut stmt = conn.prepare(&format!("SELECT {col} FROM {}", kind.blob_table()))?;
    let ids: rusqlite::Result<std::collections::HashSet<i64>> =
        stmt.query_map([], |row| row.get(0))?.collect();
    ids
}

pub fn count(conn: &Connection, kind: EmbeddingKind) -> rusqlite::Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", kind.blob_table()), [], |row| row.get(0))
}

pub fn clear_all(conn: &Connection, kind: EmbeddingKind) -> rusqlite::Result<()> {
    conn.execute(&format!("DELETE FROM {}", kind.blob_table()), [])?;
    let _ = conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", kind.vec_table()));
    conn.execute("DELETE FROM vector_dims WHERE kind = ?", [kind.label()])?;
    Ok(())
}

/// Search by cosine similarity. Uses the native vec0 table when present, scored via
/// `vec_distance_cosine` so `similarity = 1 - distance` matches true cosine distance
/// (vec0's own KNN `MATCH` operator defaults to euclidean, which would not); otherwise
/// scans the BLOB table and computes cosine similarity in-process.
pub fn search(
    conn: &Connection,
    kind: EmbeddingKind,
    query: &[f32],
    limit: usize,
) -> rusqlite::Result<Vec<ScoredEmbedding>> {
    let native_available = recorded_dimension(conn, kind)
        .ok()
        .flatten()
        .is_some_and(|d| d == query.len());

    if native_available {
        let bytes = serialize_embedding(query);
        let sql = format!(
            "SELECT v.rowid, b.content, vec_distance_cosine(v.embedding, ?1) AS distance FROM {} v \
             JOIN {} b ON b.{} = v.rowid \
             ORDER BY distance \
             LIMIT ?2",
            kind.vec_table(),
            kind.blob_table(),
            kind.blob_id_column()
        );
        let result = conn.prepare(&sql).and_then(|mut stmt| {
            stmt.query_map(params![bytes, limit as i64], |row| {
                let distance: f64 = row.get(2)?;
                Ok(ScoredEmbedding {
                    rowid: row.get(0)?,
                    content: row.get(1)?,
                    similarity: (1.0 - distance) as f32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        });
        if let Ok(rows) = result {
            return Ok(rows);
        }
        tracing::debug!(kind = kind.label(), "native vector search failed, falling back to BLOB scan");
    }

    let col = kind.blob_id_column();
    let mut stmt = conn.prepare(&format!("SELECT {col}, content, embedding FROM {}", kind.blob_table()))?;
    let mut scored: Vec<ScoredEmbedding> = stmt
        .query_map([], |row| {
            let rowid: i64 = row.get(0)?;
            let content: Option<String> = row.get(1)?;
            let bytes: Vec<u8> = row.get(2)?;
            Ok((rowid, content, bytes))
        })?
        .filter_map(|r| r.ok())
        .map(|(rowid, content, bytes)| {
            let embedding = deserialize_embedding(&bytes);
            let similarity = cosine_similarity(query, &embedding);
            ScoredEmbedding { rowid, content, similarity }
        })
        .collect();

    scored.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn
    }

    fn setup_with_native_vec() -> Connection {
        crate::db::pool::ensure_sqlite_vec_registered();
        setup()
    }

    fn insert_message(conn: &Connection) -> i64 {
        conn.execute(
            "INSERT INTO projects (canonical_path, source_kind) VALUES ('/p', 'assistant-a')",
            [],
        )
        .unwrap();
        let project_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO conversations (external_id, project_id, source_kind, first_at, last_at, created_at, updated_at) \
             VALUES (?, ?, 'assistant-a', 0, 0, 0, 0)",
            params![uuid::Uuid::new_v4().to_string(), project_id],
        )
        .unwrap();
        let conversation_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO messages (external_id, conversation_id, role, content, timestamp) VALUES (?, ?, 'user', 'hi', 0)",
            params![uuid::Uuid::new_v4().to_string(), conversation_id],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_validate_dimension_rejects_zero_and_huge() {
        assert!(validate_dimension(0).is_err());
        assert!(validate_dimension(10_001).is_err());
        assert!(validate_dimension(1536).is_ok());
    }

    #[test]
    fn test_cosine_similarity_identical_vectors_is_one() {
        let v = vec![0.1, 0.2, 0.3, 0.4];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let v = vec![1.5f32, -2.25, 0.0, 3.125];
        let bytes = serialize_embedding(&v);
        let back = deserialize_embedding(&bytes);
        assert_eq!(v, back);
    }

    #[test]
    fn test_store_and_search_message_embedding_blob_fallback() {
        let conn = setup();
        let id = insert_message(&conn);
        let v = vec![1.0, 0.0, 0.0];
        store_embedding(&conn, EmbeddingKind::Message, id, Some("hi"), &v, "test-model").unwrap();

        let existing = existing_ids(&conn, EmbeddingKind::Message).unwrap();
        assert!(existing.contains(&id));

        let results = search(&conn, EmbeddingKind::Message, &v, 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rowid, id);
        assert!(results[0].similarity > 0.99);
    }

    #[test]
    fn test_native_vec_search_similarity_matches_cosine_not_euclidean() {
        let conn = setup_with_native_vec();
        let id = insert_message(&conn);
        // Not unit-length, so L2 and cosine disagree: euclidean distance here is large
        // (~9.06) while cosine distance is 0, so `1 - distance` only lands in [-1, 1]
        // and near 1.0 if the native query is actually using vec_distance_cosine.
        let v = vec![3.0, 0.0, 0.0];
        store_embedding(&conn, EmbeddingKind::Message, id, Some("hi"), &v, "test-model").unwrap();

        let results = search(&conn, EmbeddingKind::Message, &v, 5).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].similarity >= -1.0 && results[0].similarity <= 1.0);
        assert!((results[0].similarity - 1.0).abs() < 1e-4, "expected cosine similarity ~1.0, got {}", results[0].similarity);
    }

    #[test]
    fn test_rewrite_same_id_tolerates_dimension_change() {
        let conn = setup();
        let id = insert_message(&conn);
        store_embedding(&conn, EmbeddingKind::Message, id, Some("a"), &[1.0, 0.0], "model-a").unwrap();
        // Re-embed with a different dimension (provider swap) — must not error.
        store_embedding(&conn, EmbeddingKind::Message, id, Some("a"), &[1.0, 0.0, 0.0, 0.0], "model-b").unwrap();

        let existing = existing_ids(&conn, EmbeddingKind::Message).unwrap();
        assert_eq!(existing.len(), 1);
    }

    #[test]
    fn test_clear_all_removes_rows() {
        let conn = setup();
        let id = insert_message(&conn);
        store_embedding(&conn, EmbeddingKind::Message, id, Some("a"), &[1.0, 0.0], "model-a").unwrap();
        clear_all(&conn, EmbeddingKind::Message).unwrap();
        assert_eq!(count(&conn, EmbeddingKind::Message).unwrap(), 0);
    }
}
