// src/global_index.rs
// GlobalIndex: a small separate store mapping project_path -> store registration data,
// per spec §4.10. Used by cross-project fan-out search to enumerate which per-project
// stores exist without opening each one speculatively. This store is tiny compared to a
// project's own database, so it is backed by a single mutex-guarded connection rather
// than the full deadpool pool the per-project stores use.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use mira_types::SourceKind;

use crate::config::{ChunkingConfig, RerankConfig};
use crate::db::store::StoreStats;
use crate::db::DatabasePool;
use crate::embed::EmbeddingClient;
use crate::error::Result;
use crate::search::{MessageHit, SearchFilter, SemanticSearch};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRegistration {
    pub project_path: String,
    pub source_kind: SourceKind,
    pub db_path: String,
    pub counts: RegisteredCounts,
    pub last_indexed: i64,
    pub indexed_folders: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RegisteredCounts {
    pub conversations: i64,
    pub messages: i64,
    pub decisions: i64,
    pub mistakes: i64,
}

impl From<&StoreStats> for RegisteredCounts {
    fn from(s: &StoreStats) -> Self {
        Self { conversations: s.conversations, messages: s.messages, decisions: s.decisions, mistakes: s.mistakes }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossProjectSearchResult {
    pub hits: Vec<(String, MessageHit)>,
    pub projects_searched: usize,
    pub projects_succeeded: usize,
    pub failed_projects: Vec<String>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS registered_projects (
    project_path TEXT PRIMARY KEY,
    source_kind TEXT NOT NULL,
    db_path TEXT NOT NULL,
    conversations INTEGER NOT NULL DEFAULT 0,
    messages INTEGER NOT NULL DEFAULT 0,
    decisions INTEGER NOT NULL DEFAULT 0,
    mistakes INTEGER NOT NULL DEFAULT 0,
    last_indexed INTEGER NOT NULL DEFAULT 0,
    indexed_folders TEXT NOT NULL DEFAULT '[]'
);
";

pub struct GlobalIndex {
    conn: Mutex<Connection>,
}

impl GlobalIndex {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub async fn last_indexed(&self, project_path: &str) -> i64 {
        let conn = self.conn.lock().expect("global index mutex poisoned");
        conn.query_row("SELECT last_indexed FROM registered_projects WHERE project_path = ?", [project_path], |row| row.get(0))
            .optional()
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    pub async fn register_project(
        &self,
        project_path: &str,
        source_kind: SourceKind,
        db_path: Option<String>,
        stats: &StoreStats,
        indexed_folders: &[String],
        now_ms: i64,
    ) -> Result<()> {
        let counts = RegisteredCounts::from(stats);
        let folders_json = serde_json::to_string(indexed_folders)?;
        let conn = self.conn.lock().expect("global index mutex poisoned");
        conn.execute(
            "INSERT INTO registered_projects
                (project_path, source_kind, db_path, conversations, messages, decisions, mistakes, last_indexed, indexed_folders)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(project_path) DO UPDATE SET
                source_kind = excluded.source_kind,
                db_path = excluded.db_path,
                conversations = excluded.conversations,
                messages = excluded.messages,
                decisions = excluded.decisions,
                mistakes = excluded.mistakes,
                last_indexed = excluded.last_indexed,
                indexed_folders = excluded.indexed_folders",
            params![
                project_path,
                source_kind.as_str(),
                db_path.unwrap_or_default(),
                counts.conversations,
                counts.messages,
                counts.decisions,
                counts.mistakes,
                now_ms,
                folders_json,
            ],
        )?;
        Ok(())
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectRegistration>> {
        let conn = self.conn.lock().expect("global index mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT project_path, source_kind, db_path, conversations, messages, decisions, mistakes, last_indexed, indexed_folders \
             FROM registered_projects ORDER BY project_path",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let source_kind_str: String = row.get(1)?;
                let folders_json: String = row.get(8)?;
                Ok(ProjectRegistration {
                    project_path: row.get(0)?,
                    source_kind: if source_kind_str == "assistant-b" { SourceKind::AssistantB } else { SourceKind::AssistantA },
                    db_path: row.get(2)?,
                    counts: RegisteredCounts {
                        conversations: row.get(3)?,
                        messages: row.get(4)?,
                        decisions: row.get(5)?,
                        mistakes: row.get(6)?,
                    },
                    last_indexed: row.get(7)?,
                    indexed_folders: serde_json::from_str(&folders_json).unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn project_by_path(&self, project_path: &str) -> Result<Option<ProjectRegistration>> {
        Ok(self.list_projects().await?.into_iter().find(|p| p.project_path == project_path))
    }

    /// Fan out a query across every registered project, each opened read-only so this
    /// never competes with that project's own indexing writer. Per-project failures
    /// (missing file, corrupt db) are collected, not fatal to the overall call.
    pub async fn search_all(
        &self,
        embedder: &EmbeddingClient,
        query: &str,
        limit: usize,
        chunking: &ChunkingConfig,
        rerank: &RerankConfig,
    ) -> Result<CrossProjectSearchResult> {
        let projects = self.list_projects().await?;
        let query_embedding = if embedder.is_available() { embedder.embed(query).await.ok() } else { None };

        let mut hits = Vec::new();
        let mut failed_projects = Vec::new();
        let mut projects_succeeded = 0usize;

        for project in &projects {
            if project.db_path.is_empty() {
                failed_projects.push(project.project_path.clone());
                continue;
            }
            match DatabasePool::open_read_only(Path::new(&project.db_path)).await {
                Ok(pool) => {
                    // The query embedding was already computed once above and is passed
                    // through as `precomputed_embedding`, so this per-project search
                    // never needs a live embedder of its own.
                    let search = SemanticSearch::new(Arc::new(pool), EmbeddingClient::disabled(), chunking, rerank);
                    match search.search_conversations(query, limit, &SearchFilter::default(), query_embedding.as_deref()).await {
                        Ok(project_hits) => {
                            projects_succeeded += 1;
                            hits.extend(project_hits.into_iter().map(|h| (project.project_path.clone(), h)));
                        }
                        Err(_) => failed_projects.push(project.project_path.clone()),
                    }
                }
                Err(_) => failed_projects.push(project.project_path.clone()),
            }
        }

        hits.sort_by(|a: &(String, MessageHit), b: &(String, MessageHit)| b.1.similarity.partial_cmp(&a.1.similarity).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);

        Ok(CrossProjectSearchResult { hits, projects_searched: projects.len(), projects_succeeded, failed_projects })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stats() -> StoreStats {
        StoreStats { projects: 1, conversations: 2, messages: 10, decisions: 1, mistakes: 0, requirements: 0, validations: 0, chunks: 0, git_commits: 0 }
    }

    #[tokio::test]
    async fn test_register_and_lookup_project() {
        let index = GlobalIndex::open_in_memory().unwrap();
        index
            .register_project("/p", SourceKind::AssistantA, Some("/p/.mira-memory/db.sqlite3".to_string()), &sample_stats(), &["/p/.claude".to_string()], 1000)
            .await
            .unwrap();

        let found = index.project_by_path("/p").await.unwrap().unwrap();
        assert_eq!(found.counts.messages, 10);
        assert_eq!(found.last_indexed, 1000);
    }

    #[tokio::test]
    async fn test_register_project_is_idempotent_upsert() {
        let index = GlobalIndex::open_in_memory().unwrap();
        index.register_project("/p", SourceKind::AssistantA, None, &sample_stats(), &[], 1000).await.unwrap();
        index.register_project("/p", SourceKind::AssistantA, None, &sample_stats(), &[], 2000).await.unwrap();

        let projects = index.list_projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].last_indexed, 2000);
    }

    #[tokio::test]
    async fn test_last_indexed_defaults_to_zero_for_unknown_project() {
        let index = GlobalIndex::open_in_memory().unwrap();
        assert_eq!(index.last_indexed("/unknown").await, 0);
    }
}
