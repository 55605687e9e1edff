//! Token-budgeted, overlapping line chunking.
//!
//! Files that fit the budget become a single chunk. Larger files are cut
//! greedily: lines are added from a cursor until the next line would exceed
//! the budget, then the cursor moves back by the overlap so that issues
//! straddling a seam are seen whole by at least one chunk.

use std::path::Path;
use std::sync::Arc;

use concord_core::Chunk;

use crate::tokenizer::Tokenizer;

/// Splits file content into [`Chunk`]s.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use std::sync::Arc;
/// use concord_chunk::chunker::Chunker;
/// use concord_chunk::tokenizer::HeuristicTokenizer;
///
/// let chunker = Chunker::new(Arc::new(HeuristicTokenizer::default()), 20_000, 10);
/// let chunks = chunker.chunk(Path::new("a.rs"), "fn main() {}\n");
/// assert_eq!(chunks.len(), 1);
/// assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 1));
/// ```
#[derive(Clone)]
pub struct Chunker {
    tokenizer: Arc<dyn Tokenizer>,
    token_budget: usize,
    overlap_lines: usize,
}

impl Chunker {
    /// Create a chunker. A zero budget is treated as one token.
    pub fn new(tokenizer: Arc<dyn Tokenizer>, token_budget: usize, overlap_lines: usize) -> Self {
        Self {
            tokenizer,
            token_budget: token_budget.max(1),
            overlap_lines,
        }
    }

    /// Cut `content` into ordered chunks covering every line.
    ///
    /// Line ranges are 1-based and inclusive. Consecutive chunks may overlap
    /// but never leave a gap. Empty content yields no chunks.
    pub fn chunk(&self, file_path: &Path, content: &str) -> Vec<Chunk> {
        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        if total == 0 {
            return Vec::new();
        }

        let whole = self.tokenizer.count_tokens(content);
        if whole.is_some_and(|t| t <= self.token_budget) {
            return vec![make_chunk(file_path, &lines, 0, total, 0)];
        }

        let costs: Vec<usize> = lines.iter().map(|l| self.line_cost(l)).collect();
        let mut chunks = Vec::new();
        let mut cursor = 0;

        loop {
            let mut end = cursor;
            let mut used = 0usize;
            while end < total {
                let cost = costs[end];
                if end > cursor && used.saturating_add(cost) > self.token_budget {
                    break;
                }
                used = used.saturating_add(cost);
                end += 1;
                if used > self.token_budget {
                    // oversized line, emitted alone
                    break;
                }
            }

            chunks.push(make_chunk(file_path, &lines, cursor, end, chunks.len()));
            if end >= total {
                break;
            }

            let next = end.saturating_sub(self.overlap_lines);
            cursor = if next > cursor { next } else { cursor + 1 };
        }

        tracing::debug!(
            path = %file_path.display(),
            lines = total,
            chunks = chunks.len(),
            budget = self.token_budget,
            "split file into chunks"
        );
        chunks
    }

    /// Tokens for one line plus its newline; unmeasurable lines are oversized.
    fn line_cost(&self, line: &str) -> usize {
        self.tokenizer
            .count_tokens(line)
            .map_or(usize::MAX, |t| t.saturating_add(1))
    }
}

fn make_chunk(file_path: &Path, lines: &[&str], start: usize, end: usize, index: usize) -> Chunk {
    Chunk {
        content: lines[start..end].join("\n"),
        start_line: start as u32 + 1,
        end_line: end as u32,
        index,
        file_path: file_path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::HeuristicTokenizer;

    struct Unmeasurable;

    impl Tokenizer for Unmeasurable {
        fn count_tokens(&self, _text: &str) -> Option<usize> {
            None
        }
    }

    /// One token per line of text, regardless of length.
    struct PerLine;

    impl Tokenizer for PerLine {
        fn count_tokens(&self, text: &str) -> Option<usize> {
            Some(text.lines().count().max(1))
        }
    }

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("line {i:04} of the file")).collect::<Vec<_>>().join("\n")
    }

    fn assert_covers(chunks: &[Chunk], total: u32) {
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks.last().unwrap().end_line, total);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line <= pair[0].end_line + 1, "gap between {pair:?}");
            assert!(pair[1].start_line > pair[0].start_line, "no progress in {pair:?}");
        }
        for (i, c) in chunks.iter().enumerate() {
            assert!(c.start_line <= c.end_line);
            assert_eq!(c.index, i);
            assert_eq!(c.content.lines().count() as u32, c.line_count());
        }
    }

    #[test]
    fn small_file_is_one_chunk() {
        let chunker = Chunker::new(Arc::new(HeuristicTokenizer::default()), 20_000, 10);
        let chunks = chunker.chunk(Path::new("a.rs"), &numbered(35));
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 35));
        assert_eq!(chunks[0].file_path, Path::new("a.rs"));
    }

    #[test]
    fn empty_content_has_no_chunks() {
        let chunker = Chunker::new(Arc::new(HeuristicTokenizer::default()), 100, 2);
        assert!(chunker.chunk(Path::new("e.rs"), "").is_empty());
    }

    #[test]
    fn trailing_newline_does_not_add_a_line() {
        let chunker = Chunker::new(Arc::new(PerLine), 100, 0);
        let chunks = chunker.chunk(Path::new("a.rs"), "a\nb\n");
        assert_eq!(chunks[0].end_line, 2);
    }

    #[test]
    fn split_respects_budget_and_overlap() {
        // PerLine cost is 2 per line (one token + newline), budget 10 → 5 lines
        let chunker = Chunker::new(Arc::new(PerLine), 10, 2);
        let chunks = chunker.chunk(Path::new("a.rs"), &numbered(12));
        let ranges: Vec<_> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(1, 5), (4, 8), (7, 11), (10, 12)]);
        assert!(chunks[1].content.starts_with("line 0004"));
    }

    #[test]
    fn coverage_holds_for_many_budgets_and_overlaps() {
        let content = numbered(97);
        for budget in [1, 2, 3, 7, 20, 64, 150, 700] {
            for overlap in [0, 1, 3, 10, 200] {
                let chunker =
                    Chunker::new(Arc::new(HeuristicTokenizer::default()), budget, overlap);
                let chunks = chunker.chunk(Path::new("f.rs"), &content);
                assert_covers(&chunks, 97);
            }
        }
    }

    #[test]
    fn overlap_larger_than_chunk_still_terminates() {
        let chunker = Chunker::new(Arc::new(PerLine), 4, 50);
        let chunks = chunker.chunk(Path::new("a.rs"), &numbered(6));
        assert_covers(&chunks, 6);
        assert!(chunks.len() <= 6);
    }

    #[test]
    fn unmeasurable_content_falls_back_to_single_lines() {
        let chunker = Chunker::new(Arc::new(Unmeasurable), 1_000, 3);
        let chunks = chunker.chunk(Path::new("bin.dat"), "a\nb\nc");
        let ranges: Vec<_> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn oversized_line_gets_its_own_chunk() {
        let long = "x".repeat(400);
        let content = format!("a\n{long}\nb");
        let chunker = Chunker::new(Arc::new(HeuristicTokenizer::default()), 10, 0);
        let chunks = chunker.chunk(Path::new("a.rs"), &content);
        let ranges: Vec<_> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(ranges, vec![(1, 1), (2, 2), (3, 3)]);
    }
}
