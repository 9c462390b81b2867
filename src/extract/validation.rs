// src/extract/validation.rs
// ValidationExtractor: detects verification actions observed in tool_uses/tool_results
// (test runs, type checks, lint passes) and in assistant content describing them.

use sha2::{Digest, Sha256};

use super::validator::ExtractionValidator;

const MIN_CONFIDENCE: f64 = 0.30;

const TEST_TOOL_NAMES: &[&str] = &["bash", "shell", "run_tests", "pytest", "cargo_test"];
const TEST_COMMAND_MARKERS: &[&str] = &["cargo test", "npm test", "pytest", "go test", "cargo check", "cargo clippy"];

#[derive(Debug, Clone)]
pub struct ValidationCandidate {
    pub external_id: String,
    pub description: String,
    pub confidence: f64,
}

fn derive_id(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"validation:");
    hasher.update(seed.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// From a tool invocation: `tool_name` + `input_json` are inspected for test/lint/build markers.
pub fn from_tool_use(tool_name: &str, input_json: Option<&str>, message_external_id: &str) -> Option<ValidationCandidate> {
    let input = input_json.unwrap_or("");
    let is_test_tool = TEST_TOOL_NAMES.iter().any(|t| tool_name.eq_ignore_ascii_case(t));
    let has_marker = TEST_COMMAND_MARKERS.iter().any(|m| input.contains(m));

    if !is_test_tool && !has_marker {
        return None;
    }

    let description = format!("ran verification via {tool_name}: {}", input.chars().take(120).collect::<String>());
    let validator = ExtractionValidator::with_min_confidence(MIN_CONFIDENCE);
    let confidence = validator.score(&description, true);
    if !validator.passes(confidence) {
        return None;
    }

    Some(ValidationCandidate {
        external_id: derive_id(&format!("{message_external_id}:{tool_name}:{input}")),
        description,
        confidence,
    })
}

/// From assistant content narrating that verification happened ("tests pass", "verified that...").
pub fn from_content(content: &str, message_external_id: &str) -> Option<ValidationCandidate> {
    let lower = content.to_lowercase();
    let narrates_verification = ["tests pass", "all tests passed", "verified that", "confirmed that", "build succeeds"]
        .iter()
        .any(|p| lower.contains(p));
    if !narrates_verification {
        return None;
    }

    let validator = ExtractionValidator::with_min_confidence(MIN_CONFIDENCE);
    let confidence = validator.score(content, true);
    if !validator.passes(confidence) {
        return None;
    }

    Some(ValidationCandidate {
        external_id: derive_id(&format!("{message_external_id}:{}", content.chars().take(64).collect::<String>())),
        description: content.trim().to_string(),
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_tool_name_detected() {
        let c = from_tool_use("bash", Some("cargo test --all"), "m1");
        assert!(c.is_some());
    }

    #[test]
    fn test_unrelated_tool_use_skipped() {
        let c = from_tool_use("read_file", Some("{\"path\": \"foo.rs\"}"), "m1");
        assert!(c.is_none());
    }

    #[test]
    fn test_content_narration_detected() {
        let c = from_content("I ran the suite and all tests passed without any failures.", "m1");
        assert!(c.is_some());
    }

    #[test]
    fn test_unrelated_content_skipped() {
        assert!(from_content("Let's move on to the next feature.", "m1").is_none());
    }
}
