//! External collaborators of the pipeline.
//!
//! The catalog parser, the document store and the search backend are
//! replaceable glue; the stages only depend on these traits.

use async_trait::async_trait;

use crate::entry::CatalogEntry;

/// Where catalog data comes from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Timestamp of the newest catalog the source currently advertises,
    /// unix seconds.
    async fn latest_timestamp(&self) -> anyhow::Result<u64>;

    /// Fetch all entries of the catalog published at `timestamp`.
    async fn fetch(&self, timestamp: u64) -> anyhow::Result<Vec<CatalogEntry>>;
}

/// Persistent entry storage.
#[async_trait]
pub trait EntryRepository: Send + Sync {
    /// Upsert entries by id.
    async fn save(&self, entries: &[CatalogEntry]) -> anyhow::Result<()>;

    /// Load entries by id; unknown ids are skipped.
    async fn load(&self, ids: &[String]) -> anyhow::Result<Vec<CatalogEntry>>;
}

/// Search backend fed by the indexer stage.
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn index(&self, entries: &[CatalogEntry]) -> anyhow::Result<()>;
}
