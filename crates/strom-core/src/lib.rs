//! Coordination store capability surface.
//!
//! The ingestion runtime coordinates competing worker processes purely
//! through a shared store offering two primitive families:
//!
//! - [`LeaseStore`] — key/holder leases with expiry and atomic
//!   compare-and-set semantics (backs the distributed lock).
//! - [`StreamStore`] — append-only ordered logs with competing-consumer
//!   groups, acknowledgement and redelivery tracking (backs the durable
//!   queue).
//!
//! The runtime never mandates a wire format; any backend providing
//! exactly-once-per-call atomicity for these operations works. See
//! `strom-testing` for a deterministic in-process implementation.

mod error;
mod store;
mod types;

pub use error::StoreError;
pub use store::CoordinationStore;
pub use store::LeaseAcquire;
pub use store::LeaseStore;
pub use store::StreamStore;
pub use types::ConsumerInfo;
pub use types::EntryId;
pub use types::PendingEntry;
pub use types::StreamEntry;
pub use types::now_unix_ms;
