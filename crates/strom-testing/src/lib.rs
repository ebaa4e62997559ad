//! Deterministic in-process implementations of the coordination store
//! traits, for unit and integration tests.
//!
//! [`MemoryCoordinationStore`] is thread-safe and implements both
//! [`LeaseStore`] and [`StreamStore`] with predictable behavior.
//! [`UnreliableStore`] wraps any store and injects transient failures for
//! error-path tests.

mod memory;
mod unreliable;

pub use memory::MemoryCoordinationStore;
pub use unreliable::UnreliableStore;
