// src/search/snippet.rs
// SnippetGenerator: picks a window centered on the best-matching token span and
// returns at most `max_len` characters, preserving whole words at the boundaries.

const DEFAULT_MAX_LEN: usize = 240;

pub fn generate_snippet(content: &str, query: &str, max_len: usize) -> String {
    let max_len = if max_len == 0 { DEFAULT_MAX_LEN } else { max_len };
    let total_chars = content.chars().count();
    if total_chars <= max_len {
        return content.to_string();
    }

    let best_word = query.split_whitespace().next().unwrap_or("");
    let match_char_pos = if best_word.is_empty() {
        None
    } else {
        find_char_position(content, best_word)
    };

    let center = match_char_pos.unwrap_or(0);
    let half = max_len / 2;
    let start = center.saturating_sub(half);
    let end = (start + max_len).min(total_chars);
    let start = end.saturating_sub(max_len).max(0);

    let chars: Vec<char> = content.chars().collect();
    let mut slice_start = start;
    let mut slice_end = end;

    // Extend left to the previous word boundary, then trim right to the last one
    // inside the window, so we never cut a word in half.
    while slice_start > 0 && !chars[slice_start - 1].is_whitespace() {
        slice_start -= 1;
    }
    while slice_end < chars.len() && !chars[slice_end].is_whitespace() {
        slice_end += 1;
    }
    if slice_end - slice_start > max_len * 2 {
        slice_end = (slice_start + max_len).min(chars.len());
    }

    let mut snippet: String = chars[slice_start..slice_end].iter().collect();
    if slice_start > 0 {
        snippet = format!("...{snippet}");
    }
    if slice_end < chars.len() {
        snippet = format!("{snippet}...");
    }
    snippet
}

fn find_char_position(content: &str, needle: &str) -> Option<usize> {
    let lower_content = content.to_lowercase();
    let lower_needle = needle.to_lowercase();
    let byte_pos = lower_content.find(&lower_needle)?;
    Some(content[..byte_pos].chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_content_returned_unchanged() {
        let content = "short content";
        assert_eq!(generate_snippet(content, "short", 240), content);
    }

    #[test]
    fn test_long_content_truncated_around_match() {
        let filler = "word ".repeat(200);
        let content = format!("{filler}needle{filler}");
        let snippet = generate_snippet(&content, "needle", 60);
        assert!(snippet.contains("needle"));
        assert!(snippet.chars().count() <= 70); // window + ellipses
    }

    #[test]
    fn test_never_splits_word_at_boundaries() {
        let filler = "alpha beta gamma delta epsilon zeta eta theta iota kappa ".repeat(10);
        let content = format!("{filler}TARGETWORD{filler}");
        let snippet = generate_snippet(&content, "TARGETWORD", 50);
        let trimmed = snippet.trim_start_matches("...").trim_end_matches("...");
        for word in trimmed.split_whitespace() {
            assert!(content.contains(word), "snippet contained a word not in the source: {word}");
        }
    }
}
