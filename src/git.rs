// src/git.rs
// GitCommit ingestion seam: git history collection itself is an external collaborator's
// job (out of scope per the core's non-goals). This module is the one method the core
// exposes to that collaborator: hand it already-collected commit records, it persists
// them as upsert-by-hash rows and optionally links them to a conversation/message.

use std::sync::Arc;

use crate::db::store::{self, NewGitCommit};
use crate::db::DatabasePool;
use crate::error::Result;

/// A single commit record as collected by an external integrator (e.g. a `git log`
/// walker). `conversation_external_id`/`related_message_external_id` are best-effort
/// links supplied by that integrator, not resolved here.
#[derive(Debug, Clone)]
pub struct GitCommitRecord {
    pub hash: String,
    pub message: String,
    pub author: Option<String>,
    pub timestamp: i64,
    pub branch: Option<String>,
    pub files_changed: Vec<String>,
    pub conversation_external_id: Option<String>,
    pub related_message_external_id: Option<String>,
    pub metadata: Option<String>,
}

/// Persists a batch of collected commits for a project, skipping hashes already stored.
/// Returns the number of rows newly inserted.
pub async fn store_git_commits(pool: &Arc<DatabasePool>, project_id: i64, commits: Vec<GitCommitRecord>) -> Result<usize> {
    if commits.is_empty() {
        return Ok(0);
    }

    pool.run(move |conn| {
        let mut inserted = 0usize;
        for c in &commits {
            let files_changed = if c.files_changed.is_empty() { None } else { Some(serde_json::to_string(&c.files_changed)?) };
            let before = store::git_commits_for_project(conn, project_id)?.len();
            store::insert_git_commit_if_new(
                conn,
                &NewGitCommit {
                    hash: &c.hash,
                    project_id,
                    message: &c.message,
                    author: c.author.as_deref(),
                    timestamp: c.timestamp,
                    branch: c.branch.as_deref(),
                    files_changed: files_changed.as_deref(),
                    conversation_external_id: c.conversation_external_id.as_deref(),
                    related_message_external_id: c.related_message_external_id.as_deref(),
                    metadata: c.metadata.as_deref(),
                },
            )?;
            let after = store::git_commits_for_project(conn, project_id)?.len();
            if after > before {
                inserted += 1;
            }
        }
        Ok::<_, crate::error::MemoryError>(inserted)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mira_types::SourceKind;

    async fn setup_pool() -> (Arc<DatabasePool>, i64) {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let project_id = pool.run(|conn| store::upsert_project(conn, "/p", SourceKind::AssistantA, None)).await.unwrap();
        (pool, project_id)
    }

    fn sample_commit(hash: &str) -> GitCommitRecord {
        GitCommitRecord {
            hash: hash.to_string(),
            message: "fix bug".to_string(),
            author: Some("dev".to_string()),
            timestamp: 1000,
            branch: Some("main".to_string()),
            files_changed: vec!["src/lib.rs".to_string()],
            conversation_external_id: None,
            related_message_external_id: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_store_git_commits_inserts_new_rows() {
        let (pool, project_id) = setup_pool().await;
        let inserted = store_git_commits(&pool, project_id, vec![sample_commit("abc123")]).await.unwrap();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_store_git_commits_is_idempotent_on_hash() {
        let (pool, project_id) = setup_pool().await;
        store_git_commits(&pool, project_id, vec![sample_commit("abc123")]).await.unwrap();
        let second = store_git_commits(&pool, project_id, vec![sample_commit("abc123")]).await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_store_git_commits_empty_batch_is_noop() {
        let (pool, project_id) = setup_pool().await;
        let inserted = store_git_commits(&pool, project_id, vec![]).await.unwrap();
        assert_eq!(inserted, 0);
    }
}
