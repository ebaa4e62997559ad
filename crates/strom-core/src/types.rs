//! Shared types for the coordination store surface.

use serde::Deserialize;
use serde::Serialize;

/// Identifier assigned by a stream to an appended entry.
///
/// Ids are opaque to callers but strictly ordered: an entry appended later
/// always carries a greater id. Retrying a job reassigns its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned id.
    pub id: EntryId,
    /// Opaque serialized value.
    pub value: String,
}

/// A delivered-but-unacknowledged entry in a consumer group's PEL.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Entry id.
    pub id: EntryId,
    /// Consumer the entry was delivered to.
    pub consumer: String,
    /// Milliseconds since last delivery.
    pub idle_ms: u64,
    /// Total delivery count for this entry.
    pub delivery_count: u32,
}

/// Per-consumer state within a consumer group.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    /// Consumer name.
    pub name: String,
    /// Number of entries delivered to this consumer but not yet acknowledged.
    pub pending: u64,
    /// Milliseconds since the consumer last read from the group.
    pub idle_ms: u64,
}

/// Current Unix timestamp in milliseconds.
///
/// Falls back to 0 if system time is before the epoch instead of panicking.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_ids_order_by_assignment() {
        assert!(EntryId(1) < EntryId(2));
        assert_eq!(EntryId(7).to_string(), "7");
    }

    #[test]
    fn now_is_past_epoch() {
        assert!(now_unix_ms() > 1_600_000_000_000);
    }
}
