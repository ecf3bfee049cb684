//! Thread pools, cancellation, deferred writes and cooperative suspension for Strata.
//!
//! Indexing passes run on the caller's thread; the pools here back the source prefetch
//! workers and deferred attribute writes.

mod deferred;
mod scheduler;
mod suspend;

pub use deferred::DeferredWriter;
pub use scheduler::{build_pool, BlockingPool, Scheduler, SchedulerConfig};
pub use suspend::SuspendSignal;
pub use tokio_util::sync::CancellationToken;

/// Returned from cancellation checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

impl Cancelled {
    pub fn check(token: &CancellationToken) -> Result<(), Cancelled> {
        if token.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
