// src/orchestrator.rs
// IndexOrchestrator: drives one end-to-end indexing run (parse -> filter -> persist ->
// extract -> embed -> register) per transcript folder. Every write downstream is an
// upsert-by-external-id, so re-running this on an unchanged corpus is a no-op and
// re-running on an edited one updates in place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use mira_types::SourceKind;

use crate::config::{Config, McpExclusionMode};
use crate::db::store;
use crate::db::DatabasePool;
use crate::embed::EmbeddingClient;
use crate::error::{MemoryError, Result};
use crate::extract::{decision, mistake, requirement, validation};
use crate::global_index::GlobalIndex;
use crate::parser::{self, ParsedTranscript};
use crate::search::SemanticSearch;

use tracing::{info, warn};

/// A transcript folder to index, tagged with which source format it holds.
#[derive(Debug, Clone)]
pub struct TranscriptFolder {
    pub path: PathBuf,
    pub source_kind: SourceKind,
}

/// Result of one `index_project` call, matching the user-visible failure contract:
/// indexing itself either succeeds or returns `Err`, but embedding failure is reported
/// inline rather than failing the whole run.
#[derive(Debug, Clone)]
pub struct IndexResult {
    pub success: bool,
    pub stats: store::StoreStats,
    pub indexed_folders: Vec<String>,
    pub db_path: Option<String>,
    pub embeddings_generated: bool,
    pub embedding_error: Option<String>,
}

pub struct IndexOrchestrator {
    pool: Arc<DatabasePool>,
    search: SemanticSearch,
    config: Config,
}

impl IndexOrchestrator {
    pub fn new(pool: Arc<DatabasePool>, embedder: EmbeddingClient, config: Config) -> Self {
        let search = SemanticSearch::new(Arc::clone(&pool), embedder, &config.chunking, &config.rerank);
        Self { pool, search, config }
    }

    pub async fn index_project(
        &self,
        project_dir: &Path,
        transcript_folders: &[TranscriptFolder],
        global_index: &GlobalIndex,
    ) -> Result<IndexResult> {
        let canonical = canonicalize(project_dir)?;
        let canonical_str = canonical.to_string_lossy().to_string();
        let project_name = canonical.file_name().map(|n| n.to_string_lossy().to_string());

        let last_indexed = global_index.last_indexed(&canonical_str).await;
        let primary_source_kind = transcript_folders.first().map(|f| f.source_kind).unwrap_or_default();

        let project_id = self
            .pool
            .run({
                let canonical_str = canonical_str.clone();
                let project_name = project_name.clone();
                move |conn| store::upsert_project(conn, &canonical_str, primary_source_kind, project_name.as_deref())
            })
            .await?;

        let mut indexed_folders = Vec::new();
        for folder in transcript_folders {
            if !folder.path.exists() {
                continue;
            }
            let files = discover_transcript_files(&folder.path, last_indexed);
            if files.is_empty() {
                continue;
            }
            indexed_folders.push(folder.path.to_string_lossy().to_string());

            for file in files {
                let (mut transcript, _offset) = parser::parse_file(&file, folder.source_kind, 0)?;
                filter_mcp(
                    &mut transcript,
                    self.config.indexing.exclude_mcp_conversations,
                    &self.config.indexing.exclude_mcp_servers,
                );
                self.persist_transcript(project_id, &transcript).await?;
            }
        }

        let (embeddings_generated, embedding_error) = match self.run_embedding_indexing().await {
            Ok(()) => (true, None),
            Err(e) => {
                warn!(project = %canonical_str, error = %e, "embedding indexing failed, search will be FTS-only for this run");
                (false, Some(e.to_string()))
            }
        };

        let stats = self.pool.run(store::stats).await?;
        info!(project = %canonical_str, folders = indexed_folders.len(), messages = stats.messages, "index run complete");

        let now_ms = chrono::Utc::now().timestamp_millis();
        global_index
            .register_project(&canonical_str, primary_source_kind, self.pool.path().map(|p| p.to_string_lossy().to_string()), &stats, &indexed_folders, now_ms)
            .await?;

        Ok(IndexResult {
            success: true,
            stats,
            indexed_folders,
            db_path: self.pool.path().map(|p| p.to_string_lossy().to_string()),
            embeddings_generated,
            embedding_error,
        })
    }

    async fn run_embedding_indexing(&self) -> Result<()> {
        self.search.index_messages(true).await?;
        self.search.index_decisions(true).await?;
        self.search.index_mistakes(true).await?;
        Ok(())
    }

    /// Persist one parsed transcript file in a single transaction: conversation, messages,
    /// tool_uses/tool_results/thinking_blocks/file_edits, then the four extractors over
    /// each message's own content and over tool errors/uses.
    async fn persist_transcript(&self, project_id: i64, transcript: &ParsedTranscript) -> Result<()> {
        let transcript = transcript.clone();
        self.pool
            .run(move |conn| {
                let conversation_id = store::upsert_conversation(
                    conn,
                    &store::NewConversation {
                        external_id: &transcript.conversation_external_id,
                        project_id,
                        source_kind: transcript.source_kind,
                        first_at: transcript.first_at,
                        last_at: transcript.last_at,
                        branch: transcript.messages.first().and_then(|m| m.branch.as_deref()),
                        version: None,
                        metadata: transcript.conversation_metadata.as_deref(),
                    },
                )?;

                let mut message_ids: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
                for m in &transcript.messages {
                    let (id, was_new) = store::insert_message_if_new(
                        conn,
                        &store::NewMessage {
                            external_id: &m.external_id,
                            conversation_id,
                            parent_external_id: m.parent_external_id.as_deref(),
                            kind: &m.kind,
                            role: m.role.as_str(),
                            content: m.content.as_deref(),
                            timestamp: m.timestamp,
                            is_sidechain: m.is_sidechain,
                            agent_id: m.agent_id.as_deref(),
                            request_id: m.request_id.as_deref(),
                            branch: m.branch.as_deref(),
                            cwd: m.cwd.as_deref(),
                            metadata: m.metadata.as_deref(),
                        },
                    )?;
                    if was_new {
                        store::bump_conversation_message_count(conn, conversation_id)?;
                    }
                    message_ids.insert(m.external_id.clone(), id);

                    if let Some(content) = &m.content {
                        let is_user = m.role.normalized() == mira_types::Role::User;
                        for candidate in decision::extract(content, &m.external_id, is_user) {
                            store::insert_decision_if_new(
                                conn,
                                &store::NewDecision {
                                    external_id: &candidate.external_id,
                                    conversation_id,
                                    message_id: id,
                                    text: &candidate.text,
                                    rationale: candidate.rationale.as_deref(),
                                    alternatives: candidate.alternatives.as_deref(),
                                    rejected_reasons: candidate.rejected_reasons.as_deref(),
                                    context: None,
                                    related_files: None,
                                    related_commits: None,
                                    confidence: candidate.confidence,
                                    timestamp: m.timestamp,
                                },
                            )?;
                        }

                        if let Some(candidate) = mistake::from_content(content, &m.external_id, m.timestamp, is_user) {
                            store::insert_mistake_if_new(
                                conn,
                                &store::NewMistake {
                                    external_id: &candidate.external_id,
                                    conversation_id,
                                    message_id: id,
                                    kind: candidate.kind.as_str(),
                                    what_went_wrong: &candidate.what_went_wrong,
                                    correction: candidate.correction.as_deref(),
                                    user_correction_message: candidate.user_correction_message.as_deref(),
                                    files_affected: candidate.files_affected.as_deref(),
                                    severity: candidate.severity,
                                    timestamp: m.timestamp,
                                },
                            )?;
                        }

                        for candidate in requirement::extract(content, &m.external_id) {
                            store::insert_requirement_if_new(
                                conn,
                                &store::NewRequirement {
                                    external_id: &candidate.external_id,
                                    conversation_id,
                                    message_id: id,
                                    kind: &candidate.kind,
                                    description: &candidate.description,
                                    rationale: None,
                                    affects_components: None,
                                    confidence: candidate.confidence,
                                    timestamp: m.timestamp,
                                },
                            )?;
                        }

                        if let Some(candidate) = validation::from_content(content, &m.external_id) {
                            store::insert_validation_if_new(
                                conn,
                                &store::NewValidation {
                                    external_id: &candidate.external_id,
                                    conversation_id,
                                    message_id: id,
                                    description: &candidate.description,
                                    confidence: candidate.confidence,
                                    timestamp: m.timestamp,
                                },
                            )?;
                        }
                    }
                }

                for t in &transcript.tool_uses {
                    let Some(&message_id) = message_ids.get(&t.message_external_id) else { continue };
                    store::insert_tool_use_if_new(
                        conn,
                        &store::NewToolUse {
                            external_id: &t.external_id,
                            message_id,
                            tool_name: &t.tool_name,
                            input_json: t.input_json.as_deref(),
                            timestamp: t.timestamp,
                        },
                    )?;

                    if let Some(candidate) = validation::from_tool_use(&t.tool_name, t.input_json.as_deref(), &t.message_external_id) {
                        store::insert_validation_if_new(
                            conn,
                            &store::NewValidation {
                                external_id: &candidate.external_id,
                                conversation_id,
                                message_id,
                                description: &candidate.description,
                                confidence: candidate.confidence,
                                timestamp: t.timestamp,
                            },
                        )?;
                    }
                }

                for tr in &transcript.tool_results {
                    let Some(&message_id) = message_ids.get(&tr.message_external_id) else { continue };
                    store::insert_tool_result_if_new(
                        conn,
                        &store::NewToolResult {
                            external_id: &tr.external_id,
                            tool_use_external_id: tr.tool_use_external_id.as_deref(),
                            message_id,
                            content: tr.content.as_deref(),
                            stdout: tr.stdout.as_deref(),
                            stderr: tr.stderr.as_deref(),
                            is_error: tr.is_error,
                            is_image: tr.is_image,
                            timestamp: tr.timestamp,
                        },
                    )?;

                    if tr.is_error {
                        let prefix = tr.content.as_deref().or(tr.stderr.as_deref()).unwrap_or("tool error");
                        let candidate = mistake::from_tool_error(prefix, &tr.message_external_id, tr.timestamp);
                        store::insert_mistake_if_new(
                            conn,
                            &store::NewMistake {
                                external_id: &candidate.external_id,
                                conversation_id,
                                message_id,
                                kind: candidate.kind.as_str(),
                                what_went_wrong: &candidate.what_went_wrong,
                                correction: candidate.correction.as_deref(),
                                user_correction_message: candidate.user_correction_message.as_deref(),
                                files_affected: None,
                                severity: candidate.severity,
                                timestamp: tr.timestamp,
                            },
                        )?;
                    }
                }

                for th in &transcript.thinking_blocks {
                    let Some(&message_id) = message_ids.get(&th.message_external_id) else { continue };
                    store::insert_thinking_block_if_new(conn, &th.external_id, message_id, &th.content, th.timestamp)?;
                }

                for fe in &transcript.file_edits {
                    let Some(&message_id) = message_ids.get(&fe.message_external_id) else { continue };
                    store::insert_file_edit_if_new(
                        conn,
                        &store::NewFileEdit {
                            external_id: &fe.external_id,
                            message_id,
                            conversation_id,
                            file_path: &fe.file_path,
                            snapshot_timestamp: fe.snapshot_timestamp,
                            backup_version: fe.backup_version.as_deref(),
                        },
                    )?;
                }

                Ok::<_, MemoryError>(())
            })
            .await
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(MemoryError::from)
}

/// Walks a transcript folder for `.jsonl` files modified at or after `since_ms`
/// (epoch milliseconds). `since_ms <= 0` means index everything.
fn discover_transcript_files(folder: &Path, since_ms: i64) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|ext| ext.to_str()) == Some("jsonl"))
        .filter(|e| {
            if since_ms <= 0 {
                return true;
            }
            e.metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64 >= since_ms)
                .unwrap_or(true)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

/// Removes self-referential tool invocations per `exclude_mcp_conversations` /
/// `exclude_mcp_servers`. Conversations and file_edits are never touched — only
/// messages/tool_uses/tool_results/thinking_blocks carrying an excluded tool use.
fn filter_mcp(transcript: &mut ParsedTranscript, mode: McpExclusionMode, excluded_servers: &[String]) {
    if mode == McpExclusionMode::Off && excluded_servers.is_empty() {
        return;
    }

    let is_excluded_tool = |tool_name: &str| -> bool {
        let lower = tool_name.to_lowercase();
        let matches_mode = match mode {
            McpExclusionMode::Off => false,
            McpExclusionMode::SelfOnly => lower.contains("mira") || lower.contains("memory"),
            McpExclusionMode::AllMcp => lower.starts_with("mcp__") || lower.contains("mcp"),
        };
        matches_mode || excluded_servers.iter().any(|s| lower.contains(&s.to_lowercase()))
    };

    let excluded_tool_use_ids: HashSet<String> =
        transcript.tool_uses.iter().filter(|t| is_excluded_tool(&t.tool_name)).map(|t| t.external_id.clone()).collect();

    if excluded_tool_use_ids.is_empty() {
        return;
    }

    let excluded_message_ids: HashSet<String> = transcript
        .tool_uses
        .iter()
        .filter(|t| excluded_tool_use_ids.contains(&t.external_id))
        .map(|t| t.message_external_id.clone())
        .chain(
            transcript
                .tool_results
                .iter()
                .filter(|r| r.tool_use_external_id.as_ref().is_some_and(|id| excluded_tool_use_ids.contains(id)))
                .map(|r| r.message_external_id.clone()),
        )
        .collect();

    transcript.messages.retain(|m| !excluded_message_ids.contains(&m.external_id));
    transcript.tool_uses.retain(|t| !excluded_tool_use_ids.contains(&t.external_id));
    transcript
        .tool_results
        .retain(|r| !r.tool_use_external_id.as_ref().is_some_and(|id| excluded_tool_use_ids.contains(id)));
    transcript.thinking_blocks.retain(|t| !excluded_message_ids.contains(&t.message_external_id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ParsedMessage, ParsedToolUse};
    use mira_types::Role;

    fn sample_transcript() -> ParsedTranscript {
        ParsedTranscript {
            conversation_external_id: "conv1".to_string(),
            source_kind: SourceKind::AssistantA,
            messages: vec![
                ParsedMessage {
                    external_id: "m1".to_string(),
                    parent_external_id: None,
                    kind: "text".to_string(),
                    role: Role::Assistant,
                    content: Some("calling mcp tool".to_string()),
                    timestamp: 1,
                    is_sidechain: false,
                    agent_id: None,
                    request_id: None,
                    branch: None,
                    cwd: None,
                    metadata: None,
                },
                ParsedMessage {
                    external_id: "m2".to_string(),
                    parent_external_id: None,
                    kind: "text".to_string(),
                    role: Role::User,
                    content: Some("unrelated message".to_string()),
                    timestamp: 2,
                    is_sidechain: false,
                    agent_id: None,
                    request_id: None,
                    branch: None,
                    cwd: None,
                    metadata: None,
                },
            ],
            tool_uses: vec![ParsedToolUse {
                external_id: "tu1".to_string(),
                message_external_id: "m1".to_string(),
                tool_name: "mcp__mira-memory__search".to_string(),
                input_json: None,
                timestamp: 1,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_mcp_off_keeps_everything() {
        let mut t = sample_transcript();
        filter_mcp(&mut t, McpExclusionMode::Off, &[]);
        assert_eq!(t.messages.len(), 2);
        assert_eq!(t.tool_uses.len(), 1);
    }

    #[test]
    fn test_filter_mcp_self_only_removes_matching_tool_use() {
        let mut t = sample_transcript();
        filter_mcp(&mut t, McpExclusionMode::SelfOnly, &[]);
        assert_eq!(t.tool_uses.len(), 0);
        assert_eq!(t.messages.len(), 1);
        assert_eq!(t.messages[0].external_id, "m2");
    }

    #[test]
    fn test_filter_mcp_preserves_unrelated_message() {
        let mut t = sample_transcript();
        filter_mcp(&mut t, McpExclusionMode::AllMcp, &[]);
        assert!(t.messages.iter().any(|m| m.external_id == "m2"));
    }

    #[test]
    fn test_discover_transcript_files_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jsonl"), "{}").unwrap();
        std::fs::write(dir.path().join("b.txt"), "{}").unwrap();
        let files = discover_transcript_files(dir.path(), 0);
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("a.jsonl"));
    }
}
