//! Catalog ingestion pipeline on top of `strom-coordination`.
//!
//! The pipeline is a chain of durable queues: the [`CatalogWatcher`]
//! notices a fresh catalog and enqueues an [`ImportJob`]; the
//! [`Importer`] fetches the catalog and enqueues entry chunks; the
//! [`Saver`] persists chunks and forwards entry ids; the [`Indexer`]
//! feeds the search backend. Every hand-off is a queue, so any stage can
//! crash mid-job and the retry sweep redelivers its work to a peer.
//!
//! Parsing, storage and search are behind the [`collaborators`] traits;
//! this crate specifies the contract, not the glue.

pub mod collaborators;
mod entry;
mod jobs;
mod stages;
mod watcher;

pub use collaborators::CatalogSource;
pub use collaborators::EntryRepository;
pub use collaborators::SearchIndexer;
pub use entry::CatalogEntry;
pub use entry::Media;
pub use entry::VideoQuality;
pub use jobs::ImportJob;
pub use jobs::IndexBatch;
pub use jobs::SaveBatch;
pub use stages::Importer;
pub use stages::Indexer;
pub use stages::Saver;
pub use watcher::CatalogWatcher;
