//! Error types for vargrid.

use crate::tree::{NodeId, RootId};
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, VargridError>;

/// All errors surfaced by the sampling engine.
///
/// Sampling failures (`SampleTimeout`, `Provider`) are fatal to the run that
/// observes them: a stalled branch cannot be dropped silently because its
/// ancestry may still be consulted by pending siblings, so the scheduler
/// aborts instead of salvaging partial results.
#[derive(Debug, Error)]
pub enum VargridError {
    /// A region's value did not resolve within the configured bound.
    #[error("sample for {key} did not resolve within {waited_ms}ms ({queued} regions still queued)")]
    SampleTimeout {
        key: String,
        waited_ms: u64,
        queued: usize,
    },

    /// The remote provider failed. No per-kind recovery is attempted here;
    /// the failure is opaque and handled exactly like a timeout.
    #[error("sampling provider failed: {0}")]
    Provider(String),

    /// More than one persisted root covers the requested points. The engine
    /// does not know how to merge previously independent trees; the caller
    /// must disambiguate.
    #[error("{count} persisted roots cover the requested points")]
    AmbiguousRoot { count: usize },

    /// No points of interest were supplied and an exhaustive run was not
    /// requested via `keep_unused`.
    #[error("no points of interest were supplied and keep_unused was not set")]
    NoPointsOfInterest,

    /// A polygon could not be turned into a region.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("unknown root: {0}")]
    UnknownRoot(RootId),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The one-time root value patch was attempted twice.
    #[error("root {0} already has a value")]
    RootValueAlreadySet(RootId),

    /// A persistence pass could not resolve any remaining parent links.
    #[error("ancestry cannot be resolved for {unresolved} nodes (first missing parent key: {missing_key})")]
    CorruptAncestry {
        unresolved: usize,
        missing_key: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A scheduler task was cancelled or panicked.
    #[error("scheduler task failed: {0}")]
    TaskFailed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}
