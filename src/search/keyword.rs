// src/search/keyword.rs
// FTS5 query path with a LIKE-sweep fallback when the FTS table is missing (e.g. a
// database created before FTS existed, or file corruption limited to that table).

use rusqlite::Connection;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTarget {
    Messages,
    Decisions,
    Mistakes,
}

impl SearchTarget {
    fn fts_table(self) -> &'static str {
        match self {
            SearchTarget::Messages => "messages_fts",
            SearchTarget::Decisions => "decisions_fts",
            SearchTarget::Mistakes => "mistakes_fts",
        }
    }

    fn base_table(self) -> &'static str {
        match self {
            SearchTarget::Messages => "messages",
            SearchTarget::Decisions => "decisions",
            SearchTarget::Mistakes => "mistakes",
        }
    }

    fn content_column(self) -> &'static str {
        match self {
            SearchTarget::Messages => "content",
            SearchTarget::Decisions => "text",
            SearchTarget::Mistakes => "what_went_wrong",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub rowid: i64,
    pub content: String,
    pub rank: f64,
}

/// Tokenizes `query` into whitespace-separated words, escapes internal double quotes,
/// and wraps each word in double quotes — defeats FTS5 operator injection (a query like
/// `foo OR bar` or `"unterminated` is treated as literal text, not query syntax).
pub fn sanitize_fts(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// FTS5 `MATCH` query with BM25 ranking. Returns `Err` if the FTS table is missing or
/// the query fails for any reason — callers should fall back to [`like_search`].
pub fn fts_search(conn: &Connection, target: SearchTarget, query: &str, limit: usize) -> Result<Vec<KeywordHit>> {
    let sanitized = sanitize_fts(query);
    if sanitized.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT b.id, b.{col}, bm25({fts}) AS rank FROM {fts} \
         JOIN {base} b ON b.id = {fts}.rowid \
         WHERE {fts} MATCH ?1 ORDER BY rank LIMIT ?2",
        col = target.content_column(),
        fts = target.fts_table(),
        base = target.base_table(),
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params![sanitized, limit as i64], |row| {
            Ok(KeywordHit {
                rowid: row.get(0)?,
                content: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                rank: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Plain substring sweep, ANDing one `LIKE '%word%'` clause per query word. Used when
/// FTS5 is unavailable for this target.
pub fn like_search(conn: &Connection, target: SearchTarget, query: &str, limit: usize) -> Result<Vec<KeywordHit>> {
    let words: Vec<&str> = query.split_whitespace().collect();
    if words.is_empty() {
        return Ok(Vec::new());
    }

    let col = target.content_column();
    let clauses: Vec<String> = (0..words.len()).map(|i| format!("{col} LIKE ?{}", i + 1)).collect();
    let sql = format!(
        "SELECT id, {col} FROM {base} WHERE {conds} LIMIT ?{}",
        words.len() + 1,
        base = target.base_table(),
        conds = clauses.join(" AND "),
    );

    let mut stmt = conn.prepare(&sql)?;
    let patterns: Vec<String> = words.iter().map(|w| format!("%{w}%")).collect();
    let mut params: Vec<&dyn rusqlite::ToSql> = patterns.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
    let limit_i64 = limit as i64;
    params.push(&limit_i64);

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(KeywordHit {
                rowid: row.get(0)?,
                content: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                rank: 0.0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Try FTS first, fall back to LIKE on any error (missing table, corrupted index, …).
pub fn search_with_fallback(conn: &Connection, target: SearchTarget, query: &str, limit: usize) -> Result<Vec<KeywordHit>> {
    match fts_search(conn, target, query, limit) {
        Ok(hits) => Ok(hits),
        Err(e) => {
            tracing::debug!(error = %e, "FTS search failed, falling back to LIKE sweep");
            like_search(conn, target, query, limit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;

    #[test]
    fn test_sanitize_fts_wraps_words_in_quotes() {
        assert_eq!(sanitize_fts("hello world"), "\"hello\" \"world\"");
    }

    #[test]
    fn test_sanitize_fts_escapes_internal_quotes() {
        assert_eq!(sanitize_fts("say \"hi\""), "\"say\" \"\"\"hi\"\"\"");
    }

    #[test]
    fn test_sanitize_fts_defeats_operator_injection() {
        let sanitized = sanitize_fts("foo OR bar");
        assert_eq!(sanitized, "\"foo\" \"OR\" \"bar\"");
    }

    #[test]
    fn test_sanitize_empty_query() {
        assert_eq!(sanitize_fts("   "), "");
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn.execute("INSERT INTO projects (canonical_path, source_kind) VALUES ('/p', 'assistant-a')", [])
            .unwrap();
        let project_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO conversations (external_id, project_id, source_kind, first_at, last_at, created_at, updated_at) \
             VALUES ('c1', ?, 'assistant-a', 0, 0, 0, 0)",
            [project_id],
        )
        .unwrap();
        let conversation_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO messages (external_id, conversation_id, role, content, timestamp) VALUES ('m1', ?, 'user', 'hello sqlite world', 0)",
            rusqlite::params![conversation_id],
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_fts_search_finds_inserted_message() {
        let conn = setup();
        let hits = fts_search(&conn, SearchTarget::Messages, "sqlite", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("sqlite"));
    }

    #[test]
    fn test_like_search_finds_inserted_message() {
        let conn = setup();
        let hits = like_search(&conn, SearchTarget::Messages, "sqlite", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_search_with_fallback_never_errors_on_garbage_input() {
        let conn = setup();
        let result = search_with_fallback(&conn, SearchTarget::Messages, "\"unterminated OR garbage (((", 10);
        assert!(result.is_ok());
    }
}
