// src/extract/validator.rs
// Shared confidence-scoring pipeline used by all four extractors. Pure functions plus
// a handful of tunable constants, in the style of the ranking module's scoring idiom.

const ACTIONABLE_KEYWORDS: &[&str] = &[
    "use", "using", "implement", "switch", "add", "remove", "refactor", "replace",
    "adopt", "migrate", "introduce", "drop", "enable", "disable",
];

const NOISE_PHRASES: &[&str] = &[
    "let me know if",
    "i'll continue",
    "as an ai",
    "i hope this helps",
    "feel free to",
];

const SESSION_SUMMARY_PHRASES: &[&str] = &["in this session", "to summarize", "session summary", "here's a summary"];

const LENGTH_SCORE: f64 = 0.30;
const KEYWORD_SCORE: f64 = 0.25;
const STRUCTURE_SCORE: f64 = 0.20;
const SOURCE_SCORE: f64 = 0.15;
const NOISE_PENALTY: f64 = 0.50;
const SESSION_SUMMARY_PENALTY: f64 = 0.30;

#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    pub min_length: usize,
    pub min_confidence: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { min_length: 20, min_confidence: 0.45 }
    }
}

pub struct ExtractionValidator {
    cfg: ValidatorConfig,
}

impl ExtractionValidator {
    pub fn new(cfg: ValidatorConfig) -> Self {
        Self { cfg }
    }

    /// Score a candidate extraction, combining independent signal boosts and noise
    /// penalties, clamped to `[0.0, 1.0]`.
    pub fn score(&self, text: &str, has_source: bool) -> f64 {
        let lower = text.to_lowercase();
        let mut score = 0.0;

        if text.chars().count() >= self.cfg.min_length {
            score += LENGTH_SCORE;
        }
        if ACTIONABLE_KEYWORDS.iter().any(|k| lower.contains(k)) {
            score += KEYWORD_SCORE;
        }
        if text.split_whitespace().count() >= 4 {
            score += STRUCTURE_SCORE;
        }
        if has_source {
            score += SOURCE_SCORE;
        }
        if NOISE_PHRASES.iter().any(|p| lower.contains(p)) {
            score -= NOISE_PENALTY;
        }
        if SESSION_SUMMARY_PHRASES.iter().any(|p| lower.contains(p)) {
            score -= SESSION_SUMMARY_PENALTY;
        }

        score.clamp(0.0, 1.0)
    }

    pub fn passes(&self, confidence: f64) -> bool {
        confidence >= self.cfg.min_confidence
    }

    pub fn with_min_confidence(min_confidence: f64) -> Self {
        Self::new(ValidatorConfig { min_confidence, ..ValidatorConfig::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_scores_low() {
        let v = ExtractionValidator::new(ValidatorConfig::default());
        assert!(v.score("ok", false) < 0.3);
    }

    #[test]
    fn test_actionable_decision_scores_high() {
        let v = ExtractionValidator::new(ValidatorConfig::default());
        let score = v.score("We decided to use Postgres instead of SQLite for this service.", true);
        assert!(score >= 0.45, "score was {score}");
    }

    #[test]
    fn test_noise_phrase_penalized() {
        let v = ExtractionValidator::new(ValidatorConfig::default());
        let score = v.score(
            "Let me know if you have any questions about using Postgres instead.",
            true,
        );
        let score_clean = v.score("We decided to use Postgres instead of MySQL for the primary store.", true);
        assert!(score < score_clean);
    }

    #[test]
    fn test_session_summary_penalized() {
        let v = ExtractionValidator::new(ValidatorConfig::default());
        let score = v.score("To summarize, we decided to use Postgres for the main database layer.", true);
        assert!(!v.passes(score) || score < 0.6);
    }
}
