// src/parser/mod.rs
// TranscriptParser: tolerant JSON-lines parsing into the normalized entity set.
//
// Each line is parsed independently; a malformed line is skipped and counted rather than
// aborting the whole file. Two source schemas are supported (assistant-a's native field
// names and assistant-b's), told apart by which fields are present on the top-level
// object — both are folded into the same normalized shape below.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use mira_types::Role;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct ParsedTranscript {
    pub conversation_external_id: String,
    pub source_kind: mira_types::SourceKind,
    pub messages: Vec<ParsedMessage>,
    pub tool_uses: Vec<ParsedToolUse>,
    pub tool_results: Vec<ParsedToolResult>,
    pub thinking_blocks: Vec<ParsedThinkingBlock>,
    pub file_edits: Vec<ParsedFileEdit>,
    pub first_at: i64,
    pub last_at: i64,
    pub parse_errors: usize,
    pub skipped_entries: usize,
    /// JSON-encoded merge of every `system` entry's unknown top-level keys (later entries
    /// win on key conflict), carried up for the caller to fold into the conversation's
    /// own metadata column.
    pub conversation_metadata: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub external_id: String,
    pub parent_external_id: Option<String>,
    pub kind: String,
    pub role: Role,
    pub content: Option<String>,
    pub timestamp: i64,
    pub is_sidechain: bool,
    pub agent_id: Option<String>,
    pub request_id: Option<String>,
    pub branch: Option<String>,
    pub cwd: Option<String>,
    /// JSON object of this entry's unmodeled keys (an explicit `metadata` key plus any
    /// other unrecognized top-level field), or `None` if the entry carried none.
    pub metadata: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedToolUse {
    pub external_id: String,
    pub message_external_id: String,
    pub tool_name: String,
    pub input_json: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct ParsedToolResult {
    pub external_id: String,
    pub tool_use_external_id: Option<String>,
    pub message_external_id: String,
    pub content: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub is_error: bool,
    pub is_image: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct ParsedThinkingBlock {
    pub external_id: String,
    pub message_external_id: String,
    pub content: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct ParsedFileEdit {
    pub external_id: String,
    pub message_external_id: String,
    pub file_path: String,
    pub snapshot_timestamp: i64,
    pub backup_version: Option<String>,
}

/// Entry-type tag dispatch. Anything not recognized falls back to `Unknown` and is
/// counted rather than stored — new transcript producers add entry kinds over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryType {
    User,
    Assistant,
    Progress,
    System,
    QueueOperation,
    FileHistorySnapshot,
    SavedHookContext,
    Summary,
    Unknown,
}

impl EntryType {
    fn parse(s: &str) -> Self {
        match s {
            "user" => EntryType::User,
            "assistant" | "model" => EntryType::Assistant,
            "progress" => EntryType::Progress,
            "system" => EntryType::System,
            "queue_operation" | "queue-operation" | "queueOperation" => EntryType::QueueOperation,
            "file_history_snapshot" | "file-history-snapshot" | "fileHistorySnapshot" => EntryType::FileHistorySnapshot,
            "saved_hook_context" | "savedHookContext" => EntryType::SavedHookContext,
            "summary" => EntryType::Summary,
            _ => EntryType::Unknown,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawContentBlock {
    #[serde(rename = "type")]
    block_type: Option<String>,
    text: Option<String>,
    thinking: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
    tool_use_id: Option<String>,
    #[serde(rename = "toolUseId")]
    tool_use_id_camel: Option<String>,
    content: Option<serde_json::Value>,
    #[serde(rename = "is_error")]
    is_error: Option<bool>,
    #[serde(rename = "isError")]
    is_error_camel: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawContentBlock>),
}

#[derive(Debug, Deserialize, Default)]
struct RawMessage {
    role: Option<String>,
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize, Default)]
struct RawFileSnapshotEntry {
    #[serde(alias = "filePath", alias = "path")]
    file_path: String,
    #[serde(alias = "backupVersion")]
    backup_version: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEntry {
    #[serde(rename = "type")]
    entry_type: Option<String>,
    uuid: Option<String>,
    #[serde(alias = "parentUuid")]
    parent_uuid: Option<String>,
    timestamp: Option<serde_json::Value>,
    message: Option<RawMessage>,
    #[serde(alias = "isSidechain")]
    is_sidechain: Option<bool>,
    #[serde(alias = "agentId")]
    agent_id: Option<String>,
    #[serde(alias = "requestId")]
    request_id: Option<String>,
    #[serde(alias = "gitBranch")]
    git_branch: Option<String>,
    cwd: Option<String>,
    summary: Option<String>,
    #[serde(alias = "snapshotFiles", alias = "files")]
    snapshot_files: Option<Vec<RawFileSnapshotEntry>>,
    metadata: Option<serde_json::Value>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Merges an entry's explicit `metadata` object with any other top-level keys the
/// struct above doesn't model, so nothing is silently dropped. Returns a JSON-encoded
/// object, or `None` when the entry carried nothing unmodeled.
fn entry_metadata(entry: &RawEntry) -> Option<String> {
    let mut merged = entry.extra.clone();
    if let Some(serde_json::Value::Object(explicit)) = &entry.metadata {
        for (k, v) in explicit {
            merged.insert(k.clone(), v.clone());
        }
    } else if let Some(other) = &entry.metadata {
        merged.insert("metadata".to_string(), other.clone());
    }
    if merged.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(merged).to_string())
    }
}

fn parse_role(s: Option<&str>) -> Role {
    match s {
        Some("user") => Role::User,
        Some("assistant") | Some("model") => Role::Assistant,
        Some("system") => Role::System,
        _ => Role::User,
    }
    .normalized()
}

fn parse_timestamp(v: Option<&serde_json::Value>, fallback: i64) -> i64 {
    match v {
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(fallback),
        Some(serde_json::Value::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(fallback),
        _ => fallback,
    }
}

/// Deterministic id derived from (source path, line number, an embedded seed when
/// present). Stable across re-parses of an unchanged file.
fn derive_external_id(path: &str, line_number: usize, seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(line_number.to_le_bytes());
    hasher.update(b":");
    hasher.update(seed.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn flatten_content(raw: &RawContent) -> (Option<String>, Vec<RawContentBlock>) {
    match raw {
        RawContent::Text(s) => (Some(s.clone()), Vec::new()),
        RawContent::Blocks(blocks) => {
            let mut texts = Vec::new();
            for b in blocks {
                if b.block_type.as_deref() == Some("text") {
                    if let Some(t) = &b.text {
                        texts.push(t.clone());
                    }
                }
            }
            let joined = if texts.is_empty() { None } else { Some(texts.join("\n")) };
            // owned copies needed since we can't move out of `blocks` (borrowed from `raw`)
            let owned: Vec<RawContentBlock> = blocks
                .iter()
                .map(|b| RawContentBlock {
                    block_type: b.block_type.clone(),
                    text: b.text.clone(),
                    thinking: b.thinking.clone(),
                    id: b.id.clone(),
                    name: b.name.clone(),
                    input: b.input.clone(),
                    tool_use_id: b.tool_use_id.clone(),
                    tool_use_id_camel: b.tool_use_id_camel.clone(),
                    content: b.content.clone(),
                    is_error: b.is_error,
                    is_error_camel: b.is_error_camel,
                })
                .collect();
            (joined, owned)
        }
    }
}

/// Folds one `system` entry's metadata into the conversation-level accumulator,
/// later keys winning over earlier ones on conflict.
fn merge_conversation_metadata(acc: &mut Option<String>, extra: &str) {
    let Ok(serde_json::Value::Object(new_fields)) = serde_json::from_str::<serde_json::Value>(extra) else { return };
    let mut merged = match acc.as_deref().map(serde_json::from_str::<serde_json::Value>) {
        Some(Ok(serde_json::Value::Object(existing))) => existing,
        _ => serde_json::Map::new(),
    };
    for (k, v) in new_fields {
        merged.insert(k, v);
    }
    *acc = Some(serde_json::Value::Object(merged).to_string());
}

fn stringify_block_content(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Parse a single transcript file starting at `start_offset` bytes. Returns the parsed
/// entities and the byte offset to resume from on the next incremental pass.
pub fn parse_file(
    path: &Path,
    source_kind: mira_types::SourceKind,
    start_offset: u64,
) -> Result<(ParsedTranscript, u64)> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(start_offset))?;
    let mut reader = BufReader::new(file);

    let path_str = path.to_string_lossy().to_string();
    let mut transcript = ParsedTranscript {
        conversation_external_id: derive_external_id(&path_str, 0, "conversation"),
        source_kind,
        ..Default::default()
    };

    let mut bytes_consumed = start_offset;
    let mut line_number = 0usize;
    let mut last_message_external_id: Option<String> = None;
    let mut last_tool_use_external_id: Option<String> = None;
    let mut fallback_timestamp: i64 = 0;

    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        bytes_consumed += read as u64;
        line_number += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let entry: RawEntry = match serde_json::from_str(trimmed) {
            Ok(e) => e,
            Err(_) => {
                transcript.parse_errors += 1;
                continue;
            }
        };

        let entry_type = EntryType::parse(entry.entry_type.as_deref().unwrap_or(""));
        let timestamp = parse_timestamp(entry.timestamp.as_ref(), fallback_timestamp);
        fallback_timestamp = timestamp;

        match entry_type {
            EntryType::User | EntryType::Assistant | EntryType::Summary => {
                let raw_message = entry.message.unwrap_or_default();
                let role = if entry_type == EntryType::Summary {
                    Role::System
                } else {
                    parse_role(raw_message.role.as_deref())
                };

                let (content_text, blocks) = match raw_message.content.as_ref() {
                    Some(raw) => flatten_content(raw),
                    None => (entry.summary.clone(), Vec::new()),
                };

                let seed = entry.uuid.clone().unwrap_or_else(|| content_text.clone().unwrap_or_default());
                let external_id = entry.uuid.clone().unwrap_or_else(|| derive_external_id(&path_str, line_number, &seed));

                transcript.messages.push(ParsedMessage {
                    external_id: external_id.clone(),
                    parent_external_id: entry.parent_uuid.clone(),
                    kind: if entry_type == EntryType::Summary { "summary".to_string() } else { "text".to_string() },
                    role,
                    content: content_text,
                    timestamp,
                    is_sidechain: entry.is_sidechain.unwrap_or(false),
                    agent_id: entry.agent_id.clone(),
                    request_id: entry.request_id.clone(),
                    branch: entry.git_branch.clone(),
                    cwd: entry.cwd.clone(),
                    metadata: entry_metadata(&entry),
                });

                if transcript.first_at == 0 || timestamp < transcript.first_at {
                    transcript.first_at = timestamp;
                }
                if timestamp > transcript.last_at {
                    transcript.last_at = timestamp;
                }

                for block in &blocks {
                    match block.block_type.as_deref() {
                        Some("tool_use") => {
                            let tool_external_id = block
                                .id
                                .clone()
                                .unwrap_or_else(|| derive_external_id(&path_str, line_number, "tool_use"));
                            transcript.tool_uses.push(ParsedToolUse {
                                external_id: tool_external_id.clone(),
                                message_external_id: external_id.clone(),
                                tool_name: block.name.clone().unwrap_or_else(|| "unknown".to_string()),
                                input_json: block.input.as_ref().map(|v| v.to_string()),
                                timestamp,
                            });
                            last_tool_use_external_id = Some(tool_external_id);
                        }
                        Some("tool_result") => {
                            let referenced_use = block
                                .tool_use_id
                                .clone()
                                .or_else(|| block.tool_use_id_camel.clone())
                                .or_else(|| last_tool_use_external_id.clone());
                            let content_str = block.content.as_ref().and_then(stringify_block_content);
                            let is_error = block.is_error.or(block.is_error_camel).unwrap_or(false);
                            let stderr = if is_error { content_str.clone() } else { None };
                            transcript.tool_results.push(ParsedToolResult {
                                external_id: derive_external_id(&path_str, line_number, "tool_result"),
                                tool_use_external_id: referenced_use,
                                message_external_id: external_id.clone(),
                                content: content_str,
                                stdout: None,
                                stderr,
                                is_error,
                                is_image: false,
                                timestamp,
                            });
                        }
                        Some("thinking") => {
                            if let Some(thought) = &block.thinking {
                                transcript.thinking_blocks.push(ParsedThinkingBlock {
                                    external_id: derive_external_id(&path_str, line_number, "thinking"),
                                    message_external_id: external_id.clone(),
                                    content: thought.clone(),
                                    timestamp,
                                });
                            }
                        }
                        _ => {}
                    }
                }

                last_message_external_id = Some(external_id);
            }
            EntryType::FileHistorySnapshot => {
                if let (Some(files), Some(msg_id)) = (&entry.snapshot_files, &last_message_external_id) {
                    for f in files {
                        transcript.file_edits.push(ParsedFileEdit {
                            external_id: derive_external_id(&path_str, line_number, &f.file_path),
                            message_external_id: msg_id.clone(),
                            file_path: f.file_path.clone(),
                            snapshot_timestamp: timestamp,
                            backup_version: f.backup_version.clone(),
                        });
                    }
                } else {
                    transcript.skipped_entries += 1;
                }
            }
            EntryType::System => {
                if let Some(extra) = entry_metadata(&entry) {
                    merge_conversation_metadata(&mut transcript.conversation_metadata, &extra);
                }
                transcript.skipped_entries += 1;
            }
            EntryType::Progress | EntryType::QueueOperation | EntryType::SavedHookContext => {
                transcript.skipped_entries += 1;
            }
            EntryType::Unknown => {
                transcript.skipped_entries += 1;
            }
        }
    }

    Ok((transcript, bytes_consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_parses_simple_user_and_assistant_messages() {
        let f = write_temp(&[
            r#"{"type":"user","uuid":"u1","timestamp":1000,"message":{"role":"user","content":"hello"}}"#,
            r#"{"type":"assistant","uuid":"a1","parentUuid":"u1","timestamp":2000,"message":{"role":"assistant","content":"hi there"}}"#,
        ]);
        let (t, offset) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        assert_eq!(t.messages.len(), 2);
        assert_eq!(t.messages[0].content.as_deref(), Some("hello"));
        assert_eq!(t.messages[1].parent_external_id.as_deref(), Some("u1"));
        assert_eq!(t.parse_errors, 0);
        assert!(offset > 0);
    }

    #[test]
    fn test_malformed_line_is_skipped_not_fatal() {
        let f = write_temp(&[
            r#"{"type":"user","uuid":"u1","timestamp":1000,"message":{"role":"user","content":"hello"}}"#,
            "this is not json at all {{{",
            r#"{"type":"user","uuid":"u2","timestamp":1001,"message":{"role":"user","content":"world"}}"#,
        ]);
        let (t, _) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        assert_eq!(t.messages.len(), 2);
        assert_eq!(t.parse_errors, 1);
    }

    #[test]
    fn test_tool_use_and_result_blocks_extracted() {
        let f = write_temp(&[
            r#"{"type":"assistant","uuid":"a1","timestamp":1,"message":{"role":"assistant","content":[{"type":"text","text":"running"},{"type":"tool_use","id":"tu1","name":"bash","input":{"cmd":"ls"}}]}}"#,
            r#"{"type":"user","uuid":"u2","timestamp":2,"message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"tu1","content":"file.txt","is_error":false}]}}"#,
        ]);
        let (t, _) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        assert_eq!(t.tool_uses.len(), 1);
        assert_eq!(t.tool_uses[0].tool_name, "bash");
        assert_eq!(t.tool_results.len(), 1);
        assert_eq!(t.tool_results[0].tool_use_external_id.as_deref(), Some("tu1"));
        assert!(!t.tool_results[0].is_error);
    }

    #[test]
    fn test_model_role_normalizes_to_assistant() {
        let f = write_temp(&[
            r#"{"type":"assistant","uuid":"a1","timestamp":1,"message":{"role":"model","content":"hi"}}"#,
        ]);
        let (t, _) = parse_file(f.path(), mira_types::SourceKind::AssistantB, 0).unwrap();
        assert_eq!(t.messages[0].role, Role::Assistant);
    }

    #[test]
    fn test_reparse_from_same_file_is_deterministic() {
        let f = write_temp(&[
            r#"{"type":"user","timestamp":1,"message":{"role":"user","content":"no uuid here"}}"#,
        ]);
        let (t1, _) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        let (t2, _) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        assert_eq!(t1.messages[0].external_id, t2.messages[0].external_id);
    }

    #[test]
    fn test_incremental_offset_skips_already_consumed_lines() {
        let f = write_temp(&[
            r#"{"type":"user","uuid":"u1","timestamp":1,"message":{"role":"user","content":"first"}}"#,
            r#"{"type":"user","uuid":"u2","timestamp":2,"message":{"role":"user","content":"second"}}"#,
        ]);
        let (first_pass, offset) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        assert_eq!(first_pass.messages.len(), 2);

        let (second_pass, _) = parse_file(f.path(), mira_types::SourceKind::AssistantA, offset).unwrap();
        assert_eq!(second_pass.messages.len(), 0);
    }

    #[test]
    fn test_unknown_top_level_keys_preserved_in_message_metadata() {
        let f = write_temp(&[
            r#"{"type":"user","uuid":"u1","timestamp":1,"message":{"role":"user","content":"hi"},"metadata":{"sessionId":"s1"},"customField":"x"}"#,
        ]);
        let (t, _) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        let metadata = t.messages[0].metadata.as_ref().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(metadata).unwrap();
        assert_eq!(parsed["sessionId"], "s1");
        assert_eq!(parsed["customField"], "x");
    }

    #[test]
    fn test_system_entry_metadata_folds_into_conversation_metadata() {
        let f = write_temp(&[
            r#"{"type":"system","timestamp":1,"cwdSnapshot":"/tmp/proj"}"#,
            r#"{"type":"user","uuid":"u1","timestamp":2,"message":{"role":"user","content":"hi"}}"#,
        ]);
        let (t, _) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        let metadata = t.conversation_metadata.as_ref().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(metadata).unwrap();
        assert_eq!(parsed["cwdSnapshot"], "/tmp/proj");
    }

    #[test]
    fn test_entry_with_no_unknown_keys_has_no_metadata() {
        let f = write_temp(&[
            r#"{"type":"user","uuid":"u1","timestamp":1,"message":{"role":"user","content":"hi"}}"#,
        ]);
        let (t, _) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        assert!(t.messages[0].metadata.is_none());
    }

    #[test]
    fn test_unknown_entry_types_are_skipped_not_errors() {
        let f = write_temp(&[
            r#"{"type":"progress","timestamp":1}"#,
            r#"{"type":"queue_operation","timestamp":1}"#,
            r#"{"type":"some_future_entry_kind","timestamp":1}"#,
        ]);
        let (t, _) = parse_file(f.path(), mira_types::SourceKind::AssistantA, 0).unwrap();
        assert_eq!(t.messages.len(), 0);
        assert_eq!(t.parse_errors, 0);
        assert_eq!(t.skipped_entries, 3);
    }
}
