//! Token-bounded chunking of source files.
//!
//! A [`tokenizer::Tokenizer`] measures text; the [`chunker::Chunker`] uses it
//! to cut files into overlapping, line-numbered [`concord_core::Chunk`]s that
//! each fit one LLM request.

pub mod chunker;
pub mod tokenizer;

pub use chunker::Chunker;
pub use tokenizer::{HeuristicTokenizer, Tokenizer};
