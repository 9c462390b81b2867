// src/extract/decision.rs
// DecisionExtractor: pattern-matches assistant content (and optionally thinking
// blocks) for decision language, scores candidates with ExtractionValidator, and
// discards anything below threshold.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

use super::validator::{ExtractionValidator, ValidatorConfig};

static DECIDED_TO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwe(?:'ll| will)? decid(?:ed|ing) to\b").unwrap());
static CHOSE_OVER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bchose ([\w./-]+(?: [\w./-]+){0,4}?) over ([\w./-]+(?: [\w./-]+){0,4}?)\b").unwrap());
static USE_INSTEAD_OF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:using|used|uses|use) ([\w./-]+(?: [\w./-]+){0,4}?) instead of ([\w./-]+(?: [\w./-]+){0,4}?)\b").unwrap()
});
static USER_CORRECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(no,|actually,|that'?s wrong,)").unwrap());
static BECAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bbecause\s+(.+?)(?:[.\n]|$)").unwrap());

#[derive(Debug, Clone)]
pub struct DecisionCandidate {
    pub external_id: String,
    pub text: String,
    pub alternatives: Option<String>,
    pub rejected_reasons: Option<String>,
    pub rationale: Option<String>,
    pub confidence: f64,
}

/// Pulls a `because ...` clause out of a candidate sentence, if present.
fn extract_rationale(sentence: &str) -> Option<String> {
    BECAUSE.captures(sentence).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string()).filter(|s| !s.is_empty())
}

/// Tries `chose X over Y` then `use X instead of Y` against a single sentence.
fn extract_alternatives(sentence: &str) -> Option<(String, String)> {
    if let Some(caps) = CHOSE_OVER.captures(sentence) {
        return Some((caps.get(1)?.as_str().to_string(), caps.get(2)?.as_str().to_string()));
    }
    if let Some(caps) = USE_INSTEAD_OF.captures(sentence) {
        return Some((caps.get(1)?.as_str().to_string(), caps.get(2)?.as_str().to_string()));
    }
    None
}

fn derive_id(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"decision:");
    hasher.update(seed.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn sentence_containing<'a>(content: &'a str, needle_start: usize) -> &'a str {
    let before = content[..needle_start].rfind(['.', '\n']).map(|p| p + 1).unwrap_or(0);
    let after = content[needle_start..]
        .find(['.', '\n'])
        .map(|p| needle_start + p + 1)
        .unwrap_or(content.len());
    content[before..after].trim()
}

/// Extract decision candidates from a message's assistant (or thinking-block) content.
/// `message_external_id` seeds deterministic ids so re-extraction over an unchanged
/// message yields the same candidates.
pub fn extract(content: &str, message_external_id: &str, is_user_role: bool) -> Vec<DecisionCandidate> {
    let validator = ExtractionValidator::new(ValidatorConfig::default());
    let mut candidates = Vec::new();

    if is_user_role {
        if let Some(m) = USER_CORRECTION.find(content) {
            let sentence = sentence_containing(content, m.start());
            let confidence = validator.score(sentence, true);
            if validator.passes(confidence) {
                let (alternatives, rejected_reasons) = alternatives_fields(sentence);
                candidates.push(DecisionCandidate {
                    external_id: derive_id(&format!("{message_external_id}:correction:{sentence}")),
                    text: sentence.to_string(),
                    alternatives,
                    rejected_reasons,
                    rationale: extract_rationale(sentence),
                    confidence,
                });
            }
        }
        return candidates;
    }

    // Every trigger pattern contributes a candidate *sentence*, not a candidate
    // directly; sentences are deduplicated so "decided to use X instead of Y because
    // Z" produces exactly one decision carrying alternatives, rejection, and rationale
    // together instead of one decision per matching pattern.
    let mut trigger_starts: Vec<usize> = Vec::new();
    if let Some(m) = DECIDED_TO.find(content) {
        trigger_starts.push(m.start());
    }
    for caps in CHOSE_OVER.captures_iter(content) {
        trigger_starts.push(caps.get(0).unwrap().start());
    }
    for caps in USE_INSTEAD_OF.captures_iter(content) {
        trigger_starts.push(caps.get(0).unwrap().start());
    }

    let mut seen_sentences = std::collections::HashSet::new();
    for start in trigger_starts {
        let sentence = sentence_containing(content, start);
        if !seen_sentences.insert(sentence.to_string()) {
            continue;
        }
        let confidence = validator.score(sentence, true);
        if !validator.passes(confidence) {
            continue;
        }
        let (alternatives, rejected_reasons) = alternatives_fields(sentence);
        candidates.push(DecisionCandidate {
            external_id: derive_id(&format!("{message_external_id}:decision:{sentence}")),
            text: sentence.to_string(),
            alternatives,
            rejected_reasons,
            rationale: extract_rationale(sentence),
            confidence,
        });
    }

    candidates
}

/// `alternatives` holds the options considered and rejected (not the one chosen);
/// `rejected_reasons` maps each rejected alternative to why it lost out.
fn alternatives_fields(sentence: &str) -> (Option<String>, Option<String>) {
    match extract_alternatives(sentence) {
        Some((chosen, rejected)) => (
            Some(serde_json::json!([rejected]).to_string()),
            Some(serde_json::json!({rejected: format!("rejected in favor of {chosen}")}).to_string()),
        ),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decided_to_pattern_extracted() {
        let content = "After looking at the tradeoffs, we decided to use SQLite for local storage.";
        let found = extract(content, "m1", false);
        assert_eq!(found.len(), 1);
        assert!(found[0].text.contains("decided to use SQLite"));
    }

    #[test]
    fn test_chose_over_captures_alternatives() {
        let content = "We chose Postgres over MySQL for better JSON support in this service.";
        let found = extract(content, "m1", false);
        assert_eq!(found.len(), 1);
        assert!(found[0].alternatives.as_ref().unwrap().contains("MySQL"));
        assert!(found[0].rejected_reasons.as_ref().unwrap().contains("MySQL"));
    }

    #[test]
    fn test_user_correction_pattern_only_applies_to_user_role() {
        let content = "No, that approach won't work because it breaks existing callers.";
        let as_user = extract(content, "m1", true);
        let as_assistant = extract(content, "m1", false);
        assert_eq!(as_user.len(), 1);
        assert_eq!(as_assistant.len(), 0);
    }

    #[test]
    fn test_stable_ids_across_reextraction() {
        let content = "We decided to use SQLite for local storage going forward.";
        let first = extract(content, "m1", false);
        let second = extract(content, "m1", false);
        assert_eq!(first[0].external_id, second[0].external_id);
    }

    #[test]
    fn test_no_pattern_yields_no_candidates() {
        let content = "Here is some ordinary assistant text with no decision language in it.";
        assert!(extract(content, "m1", false).is_empty());
    }

    #[test]
    fn test_decided_instead_of_because_yields_one_decision_with_all_fields() {
        let content = "We decided to use PostgreSQL instead of MongoDB because it has better JSON support.";
        let found = extract(content, "m1", false);
        assert_eq!(found.len(), 1);
        assert!(found[0].text.contains("PostgreSQL"));
        assert!(found[0].alternatives.as_ref().unwrap().contains("MongoDB"));
        assert!(found[0].rationale.as_ref().unwrap().contains("JSON support"));
    }
}
