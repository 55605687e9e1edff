/// Counts tokens in a string. Only used to size chunks.
///
/// Returning `None` marks the text as unmeasurable; the chunker treats such
/// text as larger than any budget.
pub trait Tokenizer: Send + Sync {
    /// Number of tokens in `text`, or `None` if it cannot be measured.
    fn count_tokens(&self, text: &str) -> Option<usize>;
}

/// Character-ratio token estimate (about four characters per token).
///
/// Text containing NUL bytes is treated as binary and reported unmeasurable.
///
/// # Examples
///
/// ```
/// use concord_chunk::tokenizer::{HeuristicTokenizer, Tokenizer};
///
/// let t = HeuristicTokenizer::default();
/// assert_eq!(t.count_tokens("abcdefgh"), Some(2));
/// assert_eq!(t.count_tokens("abcde"), Some(2));
/// assert_eq!(t.count_tokens("\0binary"), None);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct HeuristicTokenizer {
    chars_per_token: usize,
}

impl HeuristicTokenizer {
    /// Create an estimator with a custom ratio (clamped to at least 1).
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn count_tokens(&self, text: &str) -> Option<usize> {
        if text.contains('\0') {
            return None;
        }
        Some(text.chars().count().div_ceil(self.chars_per_token))
    }
}
