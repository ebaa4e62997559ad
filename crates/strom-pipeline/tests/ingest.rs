//! End-to-end ingestion: watcher -> importer -> saver -> indexer over an
//! in-memory coordination store and in-memory collaborators.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use strom_coordination::CoordinationProvider;
use strom_coordination::QueueConfig;
use strom_pipeline::CatalogEntry;
use strom_pipeline::CatalogSource;
use strom_pipeline::CatalogWatcher;
use strom_pipeline::EntryRepository;
use strom_pipeline::ImportJob;
use strom_pipeline::Importer;
use strom_pipeline::Indexer;
use strom_pipeline::IndexBatch;
use strom_pipeline::Media;
use strom_pipeline::SaveBatch;
use strom_pipeline::Saver;
use strom_pipeline::SearchIndexer;
use strom_pipeline::VideoQuality;
use strom_testing::MemoryCoordinationStore;

struct StaticSource {
    timestamp: AtomicU64,
    entries: Mutex<Vec<CatalogEntry>>,
}

impl StaticSource {
    fn new(timestamp: u64, entries: Vec<CatalogEntry>) -> Arc<Self> {
        Arc::new(Self {
            timestamp: AtomicU64::new(timestamp),
            entries: Mutex::new(entries),
        })
    }

    fn publish(&self, timestamp: u64, entries: Vec<CatalogEntry>) {
        *self.entries.lock().unwrap() = entries;
        self.timestamp.store(timestamp, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogSource for StaticSource {
    async fn latest_timestamp(&self) -> anyhow::Result<u64> {
        Ok(self.timestamp.load(Ordering::SeqCst))
    }

    async fn fetch(&self, _timestamp: u64) -> anyhow::Result<Vec<CatalogEntry>> {
        Ok(self.entries.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct MemoryRepository {
    entries: Mutex<HashMap<String, CatalogEntry>>,
    save_failures: AtomicU32,
}

impl MemoryRepository {
    fn fail_next_saves(&self, count: u32) {
        self.save_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntryRepository for MemoryRepository {
    async fn save(&self, entries: &[CatalogEntry]) -> anyhow::Result<()> {
        if self
            .save_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("repository temporarily unavailable");
        }
        let mut map = self.entries.lock().unwrap();
        for entry in entries {
            map.insert(entry.id.clone(), entry.clone());
        }
        Ok(())
    }

    async fn load(&self, ids: &[String]) -> anyhow::Result<Vec<CatalogEntry>> {
        let map = self.entries.lock().unwrap();
        Ok(ids.iter().filter_map(|id| map.get(id).cloned()).collect())
    }
}

#[derive(Default)]
struct MemoryIndex {
    indexed: Mutex<HashSet<String>>,
}

#[async_trait]
impl SearchIndexer for MemoryIndex {
    async fn index(&self, entries: &[CatalogEntry]) -> anyhow::Result<()> {
        let mut indexed = self.indexed.lock().unwrap();
        for entry in entries {
            indexed.insert(entry.id.clone());
        }
        Ok(())
    }
}

fn catalog(prefix: &str, count: usize) -> Vec<CatalogEntry> {
    (0..count)
        .map(|n| {
            CatalogEntry::new(
                "arte",
                "nature",
                format!("{prefix}-{n}"),
                1_700_000_000 + n as u64,
                Some(1_800),
                Some("a film".to_string()),
                None,
                vec![Media::Video {
                    url: format!("https://example.org/{prefix}-{n}.mp4"),
                    quality: VideoQuality::High,
                    size: Some(1_000_000),
                }],
            )
        })
        .collect()
}

async fn wait_for_indexed(index: &MemoryIndex, expected: usize, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if index.indexed.lock().unwrap().len() >= expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} of {expected} entries indexed in time",
            index.indexed.lock().unwrap().len(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn catalog_flows_from_source_to_index() {
    let store = MemoryCoordinationStore::new();
    let provider = CoordinationProvider::new(Arc::clone(&store));

    let first = catalog("first", 5);
    let source = StaticSource::new(100, first.clone());
    let repository = Arc::new(MemoryRepository::default());
    let index = Arc::new(MemoryIndex::default());

    let fast_retry = QueueConfig {
        retry_after_ms: 500,
        max_retries: 3,
    };
    let import_queue = provider.queue::<ImportJob>("imports", fast_retry.clone());
    let save_queue = provider.queue::<SaveBatch>("saves", fast_retry.clone());
    let index_queue = provider.queue::<IndexBatch>("indexes", fast_retry);
    import_queue.initialize().await.unwrap();
    save_queue.initialize().await.unwrap();
    index_queue.initialize().await.unwrap();

    let importer = Importer::new(
        source.clone() as Arc<dyn CatalogSource>,
        Arc::clone(&import_queue),
        Arc::clone(&save_queue),
        2,
    );
    let saver = Saver::new(
        repository.clone() as Arc<dyn EntryRepository>,
        Arc::clone(&save_queue),
        Arc::clone(&index_queue),
    );
    let indexer = Indexer::new(
        repository.clone() as Arc<dyn EntryRepository>,
        index.clone() as Arc<dyn SearchIndexer>,
        Arc::clone(&index_queue),
    );
    let stage_tasks = vec![
        tokio::spawn(async move { importer.run().await }),
        tokio::spawn(async move { saver.run().await }),
        tokio::spawn(async move { indexer.run().await }),
    ];

    let watcher = CatalogWatcher::new(
        Arc::clone(&store),
        source.clone() as Arc<dyn CatalogSource>,
        Arc::clone(&import_queue),
    );
    let controller = watcher.run(Duration::from_millis(200), Duration::from_millis(50));

    wait_for_indexed(&index, 5, Duration::from_secs(15)).await;
    let expected: HashSet<String> = first.iter().map(|entry| entry.id.clone()).collect();
    assert_eq!(*index.indexed.lock().unwrap(), expected);

    // A newer catalog with one extra entry triggers a fresh import; the
    // overlap is harmless because ids are content-derived.
    let mut second = first.clone();
    second.extend(catalog("second", 1));
    source.publish(200, second);
    wait_for_indexed(&index, 6, Duration::from_secs(15)).await;

    controller.stop().await;
    provider.dispose().await;
    for task in stage_tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stage did not stop after disposal")
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_save_is_retried_until_indexed() {
    let store = MemoryCoordinationStore::new();
    let provider = CoordinationProvider::new(Arc::clone(&store));

    let repository = Arc::new(MemoryRepository::default());
    let index = Arc::new(MemoryIndex::default());

    let fast_retry = QueueConfig {
        retry_after_ms: 300,
        max_retries: 5,
    };
    let save_queue = provider.queue::<SaveBatch>("flaky-saves", fast_retry.clone());
    let index_queue = provider.queue::<IndexBatch>("flaky-indexes", fast_retry);
    save_queue.initialize().await.unwrap();
    index_queue.initialize().await.unwrap();

    let saver = Saver::new(
        repository.clone() as Arc<dyn EntryRepository>,
        Arc::clone(&save_queue),
        Arc::clone(&index_queue),
    );
    let indexer = Indexer::new(
        repository.clone() as Arc<dyn EntryRepository>,
        index.clone() as Arc<dyn SearchIndexer>,
        Arc::clone(&index_queue),
    );
    let stage_tasks = vec![
        tokio::spawn(async move { saver.run().await }),
        tokio::spawn(async move { indexer.run().await }),
    ];

    // The first two save attempts fail; the unacknowledged chunk must be
    // redelivered until it sticks.
    repository.fail_next_saves(2);
    save_queue
        .enqueue(SaveBatch {
            entries: catalog("retry", 3),
        })
        .await
        .unwrap();

    wait_for_indexed(&index, 3, Duration::from_secs(15)).await;

    provider.dispose().await;
    for task in stage_tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stage did not stop after disposal")
            .unwrap();
    }
}
