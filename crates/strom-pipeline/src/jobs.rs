//! Job payloads flowing between the pipeline stages.

use serde::Deserialize;
use serde::Serialize;

use crate::entry::CatalogEntry;

/// Enqueued by the catalog watcher when a newer catalog appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJob {
    /// Publication timestamp of the catalog to import, unix seconds.
    pub catalog_timestamp: u64,
}

/// A chunk of fetched entries headed for the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveBatch {
    pub entries: Vec<CatalogEntry>,
}

/// Ids of persisted entries waiting to be indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBatch {
    pub ids: Vec<String>,
}
