//! Query side: segment queries, pruning policies and the concurrent
//! fan-out over transposition candidates.

pub mod orchestrator;
pub mod pruning;
pub mod results;
pub mod segments;

use thiserror::Error;

use crate::audio::DecodeError;
use crate::chroma::{CodecError, ExtractError};
use crate::index::IndexError;

pub use orchestrator::{QueryOrchestrator, QueryParams, QuerySource};
pub use pruning::{DocumentFrequencyPruning, NoPruning, QueryPruningStrategy};
pub use results::{PipelineFailure, QueryResults};
pub use segments::{SegmentQueryBuilder, WeightedQuery, WeightedTerm};

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Chroma extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("Chroma parse error: {0}")]
    Codec(#[from] CodecError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Invalid query parameters: {0}")]
    InvalidParams(String),
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Could not start the query runtime: {0}")]
    Runtime(std::io::Error),
}
