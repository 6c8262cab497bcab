//! humble-vault - a local mirror of a Humble Bundle library.
//!
//! The library indexes purchases (and optionally the Humble Trove) into a
//! SQLite asset store, classifies every file into a fixed category
//! vocabulary, and downloads pending files with a bounded worker pool.
//! Long-running work is owned by the [`Coordinator`], which publishes live
//! progress on an [`EventBus`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use humble_vault::{AppConfig, AppContext, Coordinator, DownloadRequest, SyncRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> humble_vault::Result<()> {
//! let ctx = Arc::new(AppContext::open(AppConfig::load()?)?);
//! let coordinator = Coordinator::new(ctx);
//! let cancel = CancellationToken::new();
//!
//! // Index every known purchase, then fetch whatever is missing on disk.
//! let indexed = coordinator.sync(&SyncRequest::default(), &cancel).await?;
//! let stats = coordinator
//!     .download(&DownloadRequest::default(), None, &cancel)
//!     .await?;
//! println!("{indexed} assets, {} downloaded", stats.downloaded);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod ai;
pub mod cache;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod error;
pub mod events;
pub mod fs;
pub mod indexer;
pub mod model;
pub mod stats;
pub mod store;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "server")]
pub mod server;

// Re-export main types for convenience
pub use ai::OpenWebUiClient;
pub use cache::{CacheEntry, SkipCache};
pub use catalog::{CatalogApi, HumbleClient};
pub use classify::{CATEGORIES, CategorySuggester, Classification, Classifier};
pub use config::{AppConfig, DownloadConfig, FilterConfig};
pub use coordinator::{AppContext, Coordinator, DownloadRequest, JobKind, JobStatus, SyncRequest};
pub use download::{DownloadObserver, Downloader, NoProgress, Outcome, Target};
pub use error::{Error, FailureReason, Result};
pub use events::{Event, EventBus, Subscriber};
pub use fs::{FileSystem, TokioFileSystem};
pub use indexer::Indexer;
pub use model::{Asset, AssetQuery, SortOrder};
pub use stats::{FileStats, PassStats};
pub use store::AssetStore;
