// src/extract/mistake.rs
// MistakeExtractor: emits a record for every failing tool result, for assistant
// messages discussing an error, and for user corrections of the prior assistant turn.
// Kind is resolved by a priority-ordered pattern table; severity is additive.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use mira_types::MistakeKind;

static WRONG_APPROACH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(wrong approach|that won'?t work|bad idea|doesn'?t work)\b").unwrap());
static SYNTAX_ERROR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(syntax error|parse error|unexpected token)\b").unwrap());
static MISUNDERSTANDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(misunderstood|misread|i was wrong about)\b").unwrap());
static LOGIC_ERROR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(off by one|wrong logic|incorrect (result|output|calculation))\b").unwrap());
static USER_CORRECTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*(no,|actually,|that'?s (wrong|incorrect),)").unwrap());
static FILE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([\w./-]+\.(?:rs|ts|tsx|js|jsx|mjs|py|go|java|kt|rb|c|cc|cpp|h|hpp|json|toml|yaml|yml|sql|sh|md))\b(?::\d+)?").unwrap()
});

fn base_weight(kind: MistakeKind) -> f64 {
    match kind {
        MistakeKind::LogicError => 0.9,
        MistakeKind::SyntaxError => 0.7,
        MistakeKind::WrongApproach => 0.6,
        MistakeKind::Misunderstanding => 0.5,
        MistakeKind::ToolError => 0.4,
    }
}

const CORRECTION_BONUS: f64 = 0.15;
const USER_CORRECTION_BONUS: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct MistakeCandidate {
    pub external_id: String,
    pub kind: MistakeKind,
    pub what_went_wrong: String,
    pub correction: Option<String>,
    pub user_correction_message: Option<String>,
    pub files_affected: Option<String>,
    pub severity: f64,
}

fn derive_id(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"mistake:");
    hasher.update(seed.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Pulls source-looking file paths (`src/app.ts`, `foo/bar.py:42`, ...) out of error
/// text, deduplicated and in order of first appearance. Returns a JSON array string
/// suitable for the `files_affected` column, or `None` if nothing looked like a path.
fn files_affected_field(text: &str) -> Option<String> {
    let mut seen = std::collections::HashSet::new();
    let paths: Vec<String> = FILE_PATH
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|p| seen.insert(p.clone()))
        .collect();
    if paths.is_empty() { None } else { Some(serde_json::json!(paths).to_string()) }
}

/// Priority-ordered detection: the first matching pattern wins the kind assignment.
fn infer_kind(text: &str) -> Option<MistakeKind> {
    if WRONG_APPROACH.is_match(text) {
        Some(MistakeKind::WrongApproach)
    } else if SYNTAX_ERROR.is_match(text) {
        Some(MistakeKind::SyntaxError)
    } else if MISUNDERSTANDING.is_match(text) {
        Some(MistakeKind::Misunderstanding)
    } else if LOGIC_ERROR.is_match(text) {
        Some(MistakeKind::LogicError)
    } else {
        None
    }
}

/// From a failing tool result. `timestamp`/ids are attached by the caller.
pub fn from_tool_error(content_prefix: &str, message_external_id: &str, timestamp: i64) -> MistakeCandidate {
    MistakeCandidate {
        external_id: derive_id(&format!("{message_external_id}:tool_error:{content_prefix}:{timestamp}")),
        kind: MistakeKind::ToolError,
        what_went_wrong: content_prefix.to_string(),
        correction: None,
        user_correction_message: None,
        files_affected: files_affected_field(content_prefix),
        severity: base_weight(MistakeKind::ToolError),
    }
}

/// From assistant content discussing an error/mistake, or a user correction of the
/// prior assistant turn.
pub fn from_content(content: &str, message_external_id: &str, timestamp: i64, is_user_correction: bool) -> Option<MistakeCandidate> {
    if is_user_correction {
        if !USER_CORRECTION.is_match(content) {
            return None;
        }
        let what = content.trim().to_string();
        return Some(MistakeCandidate {
            external_id: derive_id(&format!("{message_external_id}:user_correction:{}:{timestamp}", prefix(&what))),
            kind: MistakeKind::Misunderstanding,
            what_went_wrong: what.clone(),
            correction: None,
            user_correction_message: Some(what.clone()),
            files_affected: files_affected_field(&what),
            severity: base_weight(MistakeKind::Misunderstanding) + USER_CORRECTION_BONUS,
        });
    }

    let kind = infer_kind(content)?;
    let has_correction = content.to_lowercase().contains("instead") || content.to_lowercase().contains("fixed by");
    let severity = base_weight(kind) + if has_correction { CORRECTION_BONUS } else { 0.0 };

    Some(MistakeCandidate {
        external_id: derive_id(&format!("{message_external_id}:{:?}:{}:{timestamp}", kind, prefix(content))),
        kind,
        what_went_wrong: content.trim().to_string(),
        correction: if has_correction { Some(content.trim().to_string()) } else { None },
        user_correction_message: None,
        files_affected: files_affected_field(content),
        severity,
    })
}

fn prefix(s: &str) -> &str {
    let end = s.char_indices().nth(64).map(|(i, _)| i).unwrap_or(s.len());
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_always_yields_candidate() {
        let c = from_tool_error("command exited with status 1", "m1", 100);
        assert_eq!(c.kind, MistakeKind::ToolError);
    }

    #[test]
    fn test_logic_error_outranks_nothing_but_is_detected() {
        let c = from_content("That produced an off by one error in the loop bound.", "m1", 0, false).unwrap();
        assert_eq!(c.kind, MistakeKind::LogicError);
    }

    #[test]
    fn test_wrong_approach_has_priority_over_syntax_mentions_elsewhere() {
        let text = "That won't work, and also there was a syntax error earlier.";
        let c = from_content(text, "m1", 0, false).unwrap();
        assert_eq!(c.kind, MistakeKind::WrongApproach);
    }

    #[test]
    fn test_correction_bonus_increases_severity() {
        let without = from_content("There was a syntax error in the file.", "m1", 0, false).unwrap();
        let with = from_content("There was a syntax error in the file, fixed by adding a semicolon instead.", "m1", 0, false).unwrap();
        assert!(with.severity > without.severity);
    }

    #[test]
    fn test_user_correction_detected() {
        let c = from_content("No, that's not right, the function signature is wrong.", "m1", 0, true).unwrap();
        assert_eq!(c.kind, MistakeKind::Misunderstanding);
        assert!(c.user_correction_message.is_some());
    }

    #[test]
    fn test_no_pattern_match_returns_none() {
        assert!(from_content("Everything looks fine here.", "m1", 0, false).is_none());
    }

    #[test]
    fn test_tool_error_extracts_affected_file_path() {
        let c = from_tool_error("TypeError: Cannot read property 'x' of undefined at src/app.ts:42", "m1", 100);
        let files: Vec<String> = serde_json::from_str(c.files_affected.as_ref().unwrap()).unwrap();
        assert!(files.iter().any(|f| f == "src/app.ts"));
    }

    #[test]
    fn test_content_without_file_path_has_no_files_affected() {
        let c = from_content("That produced an off by one error in the loop bound.", "m1", 0, false).unwrap();
        assert!(c.files_affected.is_none());
    }

    #[test]
    fn test_severity_ordering_is_total() {
        let logic = base_weight(MistakeKind::LogicError);
        let syntax = base_weight(MistakeKind::SyntaxError);
        let wrong = base_weight(MistakeKind::WrongApproach);
        let misunderstanding = base_weight(MistakeKind::Misunderstanding);
        let tool = base_weight(MistakeKind::ToolError);
        assert!(logic > syntax);
        assert!(syntax > wrong);
        assert!(wrong > misunderstanding);
        assert!(misunderstanding > tool);
    }
}
