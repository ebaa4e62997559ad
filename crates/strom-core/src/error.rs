//! Error type for coordination store operations.

use snafu::Snafu;

use crate::types::EntryId;

/// Errors surfaced by a coordination store backend.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The store could not be reached or timed out. Transient; callers
    /// decide the retry policy.
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The named stream does not exist.
    #[snafu(display("stream '{stream}' not found"))]
    StreamNotFound {
        /// Stream name.
        stream: String,
    },

    /// The named consumer group does not exist on the stream.
    #[snafu(display("consumer group '{group}' not found on stream '{stream}'"))]
    GroupNotFound {
        /// Stream name.
        stream: String,
        /// Group name.
        group: String,
    },

    /// An entry could not be interpreted by the store.
    #[snafu(display("malformed entry {id} in stream '{stream}': {reason}"))]
    MalformedEntry {
        /// Stream name.
        stream: String,
        /// Entry id.
        id: EntryId,
        /// What went wrong.
        reason: String,
    },
}

impl StoreError {
    /// Whether retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}
