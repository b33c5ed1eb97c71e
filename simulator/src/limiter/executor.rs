use async_trait::async_trait;

use super::CreateError;

/// Define the behavior of one unit of creation work.
///
/// Implementations are expected to fabricate a fresh resource with a
/// collision resistant name and submit it; they never retry, surfacing every
/// failure as a [`CreateError`]. A single producer serializes its own calls,
/// but implementations must tolerate being invoked from separate ticks.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short stable name used in logs and diagnostics.
    fn identifier(&self) -> &'static str;

    /// Perform one creation.
    async fn execute(&self) -> Result<(), CreateError>;
}
