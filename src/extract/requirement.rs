// src/extract/requirement.rs
// RequirementsExtractor: detects requirement statements in assistant/user content.
// Shares the validator pipeline with DecisionExtractor but at a lower confidence floor
// since requirement language is looser than decision language.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use super::validator::ExtractionValidator;

static REQUIREMENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(must|should|needs? to|is required to|has to) [\w ,'/-]{5,120}").unwrap()
});

const MIN_CONFIDENCE: f64 = 0.30;

#[derive(Debug, Clone)]
pub struct RequirementCandidate {
    pub external_id: String,
    pub kind: String,
    pub description: String,
    pub confidence: f64,
}

fn derive_id(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"requirement:");
    hasher.update(seed.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn extract(content: &str, message_external_id: &str) -> Vec<RequirementCandidate> {
    let validator = ExtractionValidator::with_min_confidence(MIN_CONFIDENCE);
    let mut out = Vec::new();

    for m in REQUIREMENT_PATTERN.find_iter(content) {
        let description = m.as_str().trim().trim_end_matches(',').to_string();
        let confidence = validator.score(&description, true);
        if validator.passes(confidence) {
            out.push(RequirementCandidate {
                external_id: derive_id(&format!("{message_external_id}:{description}")),
                kind: "functional".to_string(),
                description,
                confidence,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_must_pattern_extracted() {
        let content = "The login flow must redirect unauthenticated users to the sign-in page.";
        let found = extract(content, "m1");
        assert_eq!(found.len(), 1);
        assert!(found[0].description.to_lowercase().starts_with("must"));
    }

    #[test]
    fn test_no_requirement_language_yields_nothing() {
        assert!(extract("Everything is working as expected today.", "m1").is_empty());
    }

    #[test]
    fn test_stable_ids() {
        let content = "The export must complete within five seconds on average.";
        let a = extract(content, "m1");
        let b = extract(content, "m1");
        assert_eq!(a[0].external_id, b[0].external_id);
    }
}
