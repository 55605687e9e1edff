//! The Concord review engine.
//!
//! Files are cut into chunks, each chunk is sent to the LLM several times,
//! attempts vote on their findings, and the surviving findings are merged
//! across chunk seams into one [`concord_core::FileResult`] per file. A
//! bounded scheduler fans this out over a batch while the progress store
//! checkpoints every finished file so an interrupted batch can be resumed.
//!
//! - [`llm`]: gateway trait and OpenAI-compatible client
//! - [`prompt`]: prompt construction and tolerant response parsing
//! - [`validate`]: deterministic line-count checks
//! - [`attempt`]: repeated, individually bounded LLM calls per chunk
//! - [`consensus`]: voting across attempts
//! - [`merge`]: cross-chunk merging
//! - [`orchestrator`]: the per-file state machine
//! - [`scheduler`]: bounded concurrency over files
//! - [`state`]: durable check progress
//! - [`runner`]: start and resume checks end to end

pub mod attempt;
pub mod consensus;
pub mod llm;
pub mod merge;
pub mod orchestrator;
pub mod progress;
pub mod prompt;
pub mod provider;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod validate;

pub use llm::{LlmClient, LlmGateway};
pub use orchestrator::{Collaborators, FileChecker};
pub use progress::{ProgressEvent, ProgressSink};
pub use provider::{RuleProvider, RuleSet};
pub use runner::{CheckOutcome, CheckRunner};
pub use scheduler::{Scheduler, StopHandle};
pub use state::ProgressStore;
