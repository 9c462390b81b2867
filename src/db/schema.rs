// src/db/schema.rs
// Schema migrations, versioned via schema_version. Vector virtual tables are created
// lazily by VectorStore (dimension isn't known until the embedding provider is chosen),
// everything else lives here.

use rusqlite::{Connection, OptionalExtension};

const CURRENT_VERSION: i64 = 1;

/// Columns that must be present for a pre-existing `projects`/`conversations` table to
/// be considered schema-compatible with this version. If they're missing, the store is
/// treated as incompatible legacy data and its non-system tables are dropped.
const COMPATIBILITY_COLUMNS: &[(&str, &str)] = &[
    ("projects", "source_kind"),
    ("conversations", "external_id"),
    ("conversations", "message_count"),
];

pub fn run_all_migrations(conn: &Connection) -> rusqlite::Result<()> {
    ensure_schema_version_table(conn)?;

    if has_incompatible_legacy_schema(conn)? {
        tracing::warn!("incompatible legacy schema detected, dropping and recreating tables");
        drop_all_non_system_tables(conn)?;
    }

    let applied = current_schema_version(conn)?;
    if applied < CURRENT_VERSION {
        let tx = conn.unchecked_transaction()?;
        apply_v1(&tx)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?, strftime('%s','now') * 1000, ?)",
            rusqlite::params![1, "initial schema"],
        )?;
        tx.commit()?;
    }

    Ok(())
}

fn ensure_schema_version_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT NOT NULL,
            checksum TEXT
        );",
    )
}

fn current_schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|v| v.is_some())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn has_incompatible_legacy_schema(conn: &Connection) -> rusqlite::Result<bool> {
    if current_schema_version(conn)? > 0 {
        return Ok(false);
    }
    for (table, column) in COMPATIBILITY_COLUMNS {
        if table_exists(conn, table)? && !column_exists(conn, table, column)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn drop_all_non_system_tables(conn: &Connection) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type IN ('table','view') \
         AND name NOT LIKE 'sqlite_%' AND name != 'schema_version'",
    )?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);
    for name in names {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{name}\";"))?;
    }
    Ok(())
}

fn apply_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY,
            canonical_path TEXT NOT NULL UNIQUE,
            source_kind TEXT NOT NULL,
            name TEXT
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            source_kind TEXT NOT NULL,
            first_at INTEGER NOT NULL,
            last_at INTEGER NOT NULL,
            message_count INTEGER NOT NULL DEFAULT 0,
            branch TEXT,
            version TEXT,
            metadata TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_project ON conversations(project_id);

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            parent_external_id TEXT,
            kind TEXT NOT NULL DEFAULT 'text',
            role TEXT NOT NULL,
            content TEXT,
            timestamp INTEGER NOT NULL,
            is_sidechain INTEGER NOT NULL DEFAULT 0,
            agent_id TEXT,
            request_id TEXT,
            branch TEXT,
            cwd TEXT,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

        CREATE TABLE IF NOT EXISTS tool_uses (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            tool_name TEXT NOT NULL,
            input_json TEXT,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_uses_message ON tool_uses(message_id);

        CREATE TABLE IF NOT EXISTS tool_results (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            tool_use_external_id TEXT,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            content TEXT,
            stdout TEXT,
            stderr TEXT,
            is_error INTEGER NOT NULL DEFAULT 0,
            is_image INTEGER NOT NULL DEFAULT 0,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_results_message ON tool_results(message_id);
        CREATE INDEX IF NOT EXISTS idx_tool_results_is_error ON tool_results(is_error);

        CREATE TABLE IF NOT EXISTS thinking_blocks (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_thinking_message ON thinking_blocks(message_id);

        CREATE TABLE IF NOT EXISTS file_edits (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            file_path TEXT NOT NULL,
            snapshot_timestamp INTEGER NOT NULL,
            backup_version TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_file_edits_conversation ON file_edits(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_file_edits_path ON file_edits(file_path);

        CREATE TABLE IF NOT EXISTS decisions (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            text TEXT NOT NULL,
            rationale TEXT,
            alternatives TEXT,
            rejected_reasons TEXT,
            context TEXT,
            related_files TEXT,
            related_commits TEXT,
            confidence REAL NOT NULL DEFAULT 0.0,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_decisions_conversation ON decisions(conversation_id);

        CREATE TABLE IF NOT EXISTS mistakes (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            what_went_wrong TEXT NOT NULL,
            correction TEXT,
            user_correction_message TEXT,
            files_affected TEXT,
            severity REAL NOT NULL DEFAULT 0.0,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_mistakes_conversation ON mistakes(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_mistakes_kind ON mistakes(kind);

        CREATE TABLE IF NOT EXISTS requirements (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            description TEXT NOT NULL,
            rationale TEXT,
            affects_components TEXT,
            confidence REAL NOT NULL DEFAULT 0.0,
            timestamp INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS validations (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            description TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0.0,
            timestamp INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS git_commits (
            id INTEGER PRIMARY KEY,
            hash TEXT NOT NULL UNIQUE,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            message TEXT NOT NULL,
            author TEXT,
            timestamp INTEGER NOT NULL,
            branch TEXT,
            files_changed TEXT,
            conversation_external_id TEXT,
            related_message_external_id TEXT,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_git_commits_project ON git_commits(project_id);

        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            total INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            content TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_message ON chunks(message_id);

        -- Dense BLOB embedding tables (canonical copy, always written).
        CREATE TABLE IF NOT EXISTS message_embeddings (
            message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            content TEXT,
            embedding BLOB NOT NULL,
            model_name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS decision_embeddings (
            decision_id INTEGER PRIMARY KEY REFERENCES decisions(id) ON DELETE CASCADE,
            embedding BLOB NOT NULL,
            model_name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS mistake_embeddings (
            mistake_id INTEGER PRIMARY KEY REFERENCES mistakes(id) ON DELETE CASCADE,
            embedding BLOB NOT NULL,
            model_name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS chunk_embeddings (
            chunk_id INTEGER PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            content TEXT,
            embedding BLOB NOT NULL,
            model_name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chunk_embeddings_message ON chunk_embeddings(message_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            content, content='messages', content_rowid='id'
        );
        CREATE TRIGGER IF NOT EXISTS messages_fts_ai AFTER INSERT ON messages BEGIN
            INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
        END;
        CREATE TRIGGER IF NOT EXISTS messages_fts_ad AFTER DELETE ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', old.id, old.content);
        END;
        CREATE TRIGGER IF NOT EXISTS messages_fts_au AFTER UPDATE ON messages BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, content) VALUES ('delete', old.id, old.content);
            INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
        END;

        CREATE VIRTUAL TABLE IF NOT EXISTS decisions_fts USING fts5(
            text, content='decisions', content_rowid='id'
        );
        CREATE TRIGGER IF NOT EXISTS decisions_fts_ai AFTER INSERT ON decisions BEGIN
            INSERT INTO decisions_fts(rowid, text) VALUES (new.id, new.text);
        END;
        CREATE TRIGGER IF NOT EXISTS decisions_fts_ad AFTER DELETE ON decisions BEGIN
            INSERT INTO decisions_fts(decisions_fts, rowid, text) VALUES ('delete', old.id, old.text);
        END;

        CREATE VIRTUAL TABLE IF NOT EXISTS mistakes_fts USING fts5(
            what_went_wrong, content='mistakes', content_rowid='id'
        );
        CREATE TRIGGER IF NOT EXISTS mistakes_fts_ai AFTER INSERT ON mistakes BEGIN
            INSERT INTO mistakes_fts(rowid, what_went_wrong) VALUES (new.id, new.what_went_wrong);
        END;
        CREATE TRIGGER IF NOT EXISTS mistakes_fts_ad AFTER DELETE ON mistakes BEGIN
            INSERT INTO mistakes_fts(mistakes_fts, rowid, what_went_wrong) VALUES ('delete', old.id, old.what_went_wrong);
        END;
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_and_migrate() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_create_core_tables() {
        let conn = open_and_migrate();
        for table in ["projects", "conversations", "messages", "decisions", "mistakes", "chunks"] {
            assert!(table_exists(&conn, table).unwrap(), "missing table {table}");
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = open_and_migrate();
        run_all_migrations(&conn).unwrap();
        assert_eq!(current_schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_fts_trigger_keeps_index_in_sync() {
        let conn = open_and_migrate();
        conn.execute(
            "INSERT INTO projects (canonical_path, source_kind) VALUES ('/p', 'assistant-a')",
            [],
        )
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
            "INSERT INTO messages (external_id, conversation_id, role, content, timestamp) \
             VALUES ('m1', ?, 'user', 'hello world', 0)",
            rusqlite::params![conversation_id],
        )
        .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages_fts WHERE messages_fts MATCH 'hello'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
