//! Catalog entry model.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Namespace for deriving entry ids; fixed so every process derives the
/// same id for the same logical entry.
const ENTRY_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x1c, 0x1c, 0x9a, 0x1f, 0x0e, 0x4d, 0x1b, 0x8a, 0x52, 0x0f, 0x3d, 0x6e, 0x44, 0x91, 0x27,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoQuality {
    Low,
    Medium,
    High,
    UltraHigh,
}

/// A media reference attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Media {
    Video {
        url: String,
        quality: VideoQuality,
        size: Option<u64>,
    },
    Audio {
        url: String,
        size: Option<u64>,
    },
    Subtitle {
        url: String,
    },
}

/// One metadata record scraped from the external media catalog.
///
/// The id is derived from the descriptive fields, so re-importing the
/// same catalog produces the same ids and saving is naturally
/// deduplicating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub channel: String,
    pub topic: String,
    pub title: String,
    /// Publication time, unix seconds.
    pub timestamp: u64,
    pub duration_secs: Option<u64>,
    pub description: Option<String>,
    pub website: Option<String>,
    pub media: Vec<Media>,
}

impl CatalogEntry {
    /// Build an entry, deriving its id from the identifying fields.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: impl Into<String>,
        topic: impl Into<String>,
        title: impl Into<String>,
        timestamp: u64,
        duration_secs: Option<u64>,
        description: Option<String>,
        website: Option<String>,
        media: Vec<Media>,
    ) -> Self {
        let channel = channel.into();
        let topic = topic.into();
        let title = title.into();
        let id = derive_id(&channel, &topic, &title, timestamp, duration_secs);
        Self {
            id,
            channel,
            topic,
            title,
            timestamp,
            duration_secs,
            description,
            website,
            media,
        }
    }
}

/// Deterministic id over the fields that identify an entry. Media urls
/// are deliberately excluded: mirrors rotate, the entry stays the same.
fn derive_id(
    channel: &str,
    topic: &str,
    title: &str,
    timestamp: u64,
    duration_secs: Option<u64>,
) -> String {
    let key = format!(
        "{channel}\u{1f}{topic}\u{1f}{title}\u{1f}{timestamp}\u{1f}{}",
        duration_secs.unwrap_or(0),
    );
    Uuid::new_v5(&ENTRY_ID_NAMESPACE, key.as_bytes()).to_string()
}
