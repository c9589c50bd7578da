//! Market-data snapshots and the outbound-call plumbing behind them.
//!
//! - `snapshot`: opaque field map handed to every source unchanged
//! - `traits`: the `SnapshotFeed` collaborator boundary
//! - `http`: JSON endpoint feed with retry
//! - `simulated`: seeded synthetic feed for dry runs
//! - `retry`: exponential backoff executor

pub mod http;
pub mod retry;
pub mod simulated;
pub mod snapshot;
pub mod traits;

pub use http::{FeedError, HttpSnapshotFeed};
pub use retry::{RetryError, RetryExecutor, RetryPolicy, Transient};
pub use simulated::SimulatedFeed;
pub use snapshot::Snapshot;
pub use traits::SnapshotFeed;

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::{FeedConfig, FeedKind};

/// Build the configured feed.
pub fn build_feed(config: &FeedConfig, retry: &RetryPolicy) -> Result<Box<dyn SnapshotFeed>> {
    match config.kind {
        FeedKind::Simulated => Ok(Box::new(SimulatedFeed::new(config.seed))),
        FeedKind::Http => {
            let url = config
                .url
                .as_deref()
                .context("feed.url is required for the http feed")?;
            let feed = HttpSnapshotFeed::new(
                url,
                Duration::from_millis(config.request_timeout_ms),
                retry.clone(),
            )?;
            Ok(Box::new(feed))
        }
    }
}
