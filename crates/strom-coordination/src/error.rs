use snafu::Snafu;
use strom_core::StoreError;

/// Errors surfaced by the coordination primitives.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoordinationError {
    /// `acquire` was called while this instance already holds the lock.
    #[snafu(display("lock '{key}' is already held by this instance"))]
    AlreadyOwned { key: String },

    /// The queue initialization lock could not be obtained within its budget.
    #[snafu(display("could not obtain initialization lock for queue '{queue}'"))]
    InitializationLock { queue: String },

    /// A job payload could not be serialized or a stored record decoded.
    #[snafu(display("job serialization failed: {source}"))]
    Serialization { source: serde_json::Error },

    /// The underlying coordination store failed.
    #[snafu(display("coordination store error: {source}"))]
    Storage { source: StoreError },
}

impl From<StoreError> for CoordinationError {
    fn from(source: StoreError) -> Self {
        Self::Storage { source }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}
