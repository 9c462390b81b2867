// src/chunk.rs
// Chunker: token-aware text segmentation used when a message exceeds the configured
// target chunk size before embedding. Token counts are approximated as
// characters / CHARS_PER_TOKEN, which is cheap and good enough for sizing decisions —
// exact tokenization is the embedding provider's concern, not ours.

use crate::config::ChunkStrategy;

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub chunks: Vec<Chunk>,
    pub was_chunked: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkerOptions {
    pub strategy: ChunkStrategy,
    /// Target chunk size, in approximate tokens.
    pub chunk_size: usize,
    /// Overlap fraction (0.0-1.0) between adjacent windows/chunks.
    pub overlap: f32,
    /// Inputs at or below this many approximate tokens are never split.
    pub min_chunk_size: usize,
}

fn estimate_tokens(s: &str) -> usize {
    s.chars().count() / CHARS_PER_TOKEN.max(1)
}

fn single_chunk(text: &str) -> ChunkResult {
    ChunkResult {
        chunks: vec![Chunk {
            index: 0,
            total: 1,
            start_offset: 0,
            end_offset: text.chars().count(),
            content: text.to_string(),
        }],
        was_chunked: false,
    }
}

pub fn chunk_text(text: &str, opts: &ChunkerOptions) -> ChunkResult {
    if text.is_empty() {
        return single_chunk(text);
    }

    match opts.strategy {
        ChunkStrategy::Disabled => single_chunk(text),
        ChunkStrategy::Sentence => chunk_by_sentence(text, opts),
        ChunkStrategy::SlidingWindow => chunk_by_sliding_window(text, opts),
    }
}

/// Splits `text` into sentence-ish units, treating fenced code blocks (delimited by
/// matching ``` lines) as a single atomic unit so code is never split mid-block.
fn split_units(text: &str) -> Vec<&str> {
    let mut units = Vec::new();
    let bytes = text.as_bytes();
    let mut unit_start = 0usize;
    let mut i = 0usize;
    let mut in_fence = false;

    while i < bytes.len() {
        if text[i..].starts_with("```") {
            if in_fence {
                // Close the fence at the end of this line.
                let rest = &text[i..];
                let line_end = rest.find('\n').map(|p| i + p + 1).unwrap_or(text.len());
                units.push(text[unit_start..line_end].trim_end_matches('\n'));
                unit_start = line_end;
                i = line_end;
                in_fence = false;
                continue;
            } else {
                in_fence = true;
                i += 3;
                continue;
            }
        }
        if !in_fence && matches!(bytes[i], b'.' | b'!' | b'?') {
            let next_is_boundary = bytes.get(i + 1).map(|b| *b == b' ' || *b == b'\n').unwrap_or(true);
            if next_is_boundary {
                let end = i + 1;
                let unit = text[unit_start..end].trim();
                if !unit.is_empty() {
                    units.push(unit);
                }
                unit_start = end;
            }
        }
        i += 1;
    }
    if unit_start < text.len() {
        let tail = text[unit_start..].trim();
        if !tail.is_empty() {
            units.push(tail);
        }
    }
    if units.is_empty() {
        units.push(text);
    }
    units
}

fn chunk_by_sentence(text: &str, opts: &ChunkerOptions) -> ChunkResult {
    if estimate_tokens(text) <= opts.min_chunk_size {
        return single_chunk(text);
    }

    let units = split_units(text);
    let overlap_tokens = (opts.chunk_size as f32 * opts.overlap.clamp(0.0, 0.9)) as usize;

    let mut raw_chunks: Vec<(usize, usize)> = Vec::new(); // byte offset ranges into `text`
    let mut cursor = 0usize;
    let mut current_start: Option<usize> = None;
    let mut current_tokens = 0usize;

    for unit in &units {
        let unit_start = match text[cursor..].find(unit) {
            Some(p) => cursor + p,
            None => cursor,
        };
        let unit_end = unit_start + unit.len();
        cursor = unit_end;

        if current_start.is_none() {
            current_start = Some(unit_start);
        }
        current_tokens += estimate_tokens(unit);

        if current_tokens >= opts.chunk_size {
            raw_chunks.push((current_start.unwrap(), unit_end));
            current_start = None;
            current_tokens = 0;
        }
    }
    if let Some(start) = current_start {
        raw_chunks.push((start, cursor));
    }

    if raw_chunks.len() <= 1 {
        return single_chunk(text);
    }

    let total = raw_chunks.len();
    let chunks = raw_chunks
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| {
            let start = start.saturating_sub(if index > 0 { overlap_tokens * CHARS_PER_TOKEN } else { 0 });
            let start = find_char_boundary(text, start);
            let end = find_char_boundary(text, end.min(text.len()));
            Chunk {
                index,
                total,
                start_offset: text[..start].chars().count(),
                end_offset: text[..end].chars().count(),
                content: text[start..end].to_string(),
            }
        })
        .collect();

    ChunkResult { chunks, was_chunked: true }
}

fn chunk_by_sliding_window(text: &str, opts: &ChunkerOptions) -> ChunkResult {
    let window_chars = (opts.chunk_size * CHARS_PER_TOKEN).max(1);
    let total_chars = text.chars().count();
    if total_chars <= window_chars || estimate_tokens(text) <= opts.min_chunk_size {
        return single_chunk(text);
    }

    let overlap_chars = ((window_chars as f32) * opts.overlap.clamp(0.0, 0.9)) as usize;
    let step = window_chars.saturating_sub(overlap_chars).max(1);

    let char_indices: Vec<usize> = text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len())).collect();

    let mut windows = Vec::new();
    let mut start_char = 0usize;
    while start_char < total_chars {
        let end_char = (start_char + window_chars).min(total_chars);
        let start_byte = char_indices[start_char];
        let end_byte = char_indices[end_char];
        windows.push((start_char, end_char, text[start_byte..end_byte].to_string()));
        if end_char == total_chars {
            break;
        }
        start_char += step;
    }

    let total = windows.len();
    let chunks = windows
        .into_iter()
        .enumerate()
        .map(|(index, (start_offset, end_offset, content))| Chunk {
            index,
            total,
            start_offset,
            end_offset,
            content,
        })
        .collect();

    ChunkResult { chunks, was_chunked: total > 1 }
}

fn find_char_boundary(text: &str, mut byte_idx: usize) -> usize {
    byte_idx = byte_idx.min(text.len());
    while byte_idx > 0 && !text.is_char_boundary(byte_idx) {
        byte_idx -= 1;
    }
    byte_idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(strategy: ChunkStrategy) -> ChunkerOptions {
        ChunkerOptions { strategy, chunk_size: 20, overlap: 0.2, min_chunk_size: 10 }
    }

    #[test]
    fn test_disabled_strategy_always_single_chunk() {
        let text = "a ".repeat(500);
        let result = chunk_text(&text, &opts(ChunkStrategy::Disabled));
        assert_eq!(result.chunks.len(), 1);
        assert!(!result.was_chunked);
        assert_eq!(result.chunks[0].content, text);
    }

    #[test]
    fn test_short_text_is_never_chunked() {
        let text = "short text.";
        let result = chunk_text(text, &opts(ChunkStrategy::Sentence));
        assert_eq!(result.chunks.len(), 1);
        assert!(!result.was_chunked);
    }

    #[test]
    fn test_sentence_strategy_splits_long_text() {
        let sentence = "This is a reasonably long sentence about nothing in particular. ";
        let text = sentence.repeat(20);
        let result = chunk_text(&text, &opts(ChunkStrategy::Sentence));
        assert!(result.was_chunked);
        assert!(result.chunks.len() > 1);
        for c in &result.chunks {
            assert!(c.start_offset < c.end_offset);
            assert!(c.end_offset <= text.chars().count());
        }
    }

    #[test]
    fn test_sentence_strategy_preserves_fenced_code_block() {
        let text = format!(
            "Some intro text here that is long enough to matter for chunking purposes overall. \
             ```\nfn main() {{ println!(\"hi\"); }}\n```\n\
             More trailing text that also needs to be long enough to push past the minimum size."
        );
        let result = chunk_text(&text, &opts(ChunkStrategy::Sentence));
        let joined: String = result.chunks.iter().map(|c| c.content.as_str()).collect::<Vec<_>>().join("");
        assert!(joined.contains("fn main()"));
    }

    #[test]
    fn test_sliding_window_offsets_monotonic_and_overlapping() {
        let text = "x".repeat(500);
        let result = chunk_text(&text, &opts(ChunkStrategy::SlidingWindow));
        assert!(result.was_chunked);
        for w in result.chunks.windows(2) {
            assert!(w[1].start_offset < w[0].end_offset, "adjacent windows should overlap");
            assert!(w[1].start_offset > w[0].start_offset);
        }
    }

    #[test]
    fn test_chunk_offsets_within_bounds() {
        let text = "word ".repeat(300);
        let result = chunk_text(&text, &opts(ChunkStrategy::SlidingWindow));
        let total_chars = text.chars().count();
        for c in &result.chunks {
            assert!(c.start_offset < c.end_offset);
            assert!(c.end_offset <= total_chars);
        }
    }
}
