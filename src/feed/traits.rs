//! Boundary trait for the market-data collaborator.

use async_trait::async_trait;

use super::Snapshot;

/// Produces one snapshot per orchestrator cycle.
///
/// Implementations own any network access and retry handling; the
/// orchestrator bounds each call with the cycle deadline and treats any
/// error as a skipped cycle.
#[async_trait]
pub trait SnapshotFeed: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Fetch the current snapshot.
    async fn fetch(&self) -> anyhow::Result<Snapshot>;
}
