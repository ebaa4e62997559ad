//! Distributed coordination runtime for the ingestion pipeline.
//!
//! Multiple worker processes cooperate purely through a shared
//! coordination store (see `strom-core`). This crate provides the three
//! primitives every pipeline stage is built on:
//!
//! - [`DistributedLock`] — named, leased mutual exclusion. At most one
//!   valid holder per name; a crashed holder's lease expires on its own.
//! - [`DistributedLoop`] — leader-elected periodic task runner. Exactly
//!   one process across the fleet runs the iteration function per tick.
//! - [`DurableQueue`] — competing-consumer job queue with at-least-once
//!   delivery, overdue-job retry sweeping and idle-consumer eviction.
//!
//! [`CoordinationProvider`] is the factory owning per-process instances
//! and their teardown order.
//!
//! # Example
//!
//! ```ignore
//! let provider = CoordinationProvider::new(store);
//! let queue = provider.queue::<ImportJob>("imports", QueueConfig::default());
//! queue.initialize().await?;
//!
//! queue.enqueue(ImportJob { catalog_timestamp }).await?;
//!
//! let mut consumer = queue.batch_consumer(50);
//! while let Some(batch) = consumer.next_batch().await {
//!     process(&batch).await?;
//!     queue.acknowledge(&batch).await?;
//! }
//! ```

mod distributed_loop;
mod error;
mod lock;
mod provider;
mod queue;

pub use distributed_loop::DistributedLoop;
pub use distributed_loop::LoopController;
pub use distributed_loop::LoopHandle;
pub use error::CoordinationError;
pub use lock::DistributedLock;
pub use lock::LockConfig;
pub use provider::CoordinationProvider;
pub use provider::Disposable;
pub use queue::BatchConsumer;
pub use queue::DurableQueue;
pub use queue::Job;
pub use queue::JobConsumer;
pub use queue::QueueConfig;
