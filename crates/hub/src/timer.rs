//! Timer abstraction for session auto-stop.
//!
//! Production code uses [`TokioScheduler`]. Tests drive a virtual clock
//! through `ManualScheduler` instead of sleeping.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

pub type TimerTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Scheduler: Send + Sync {
    /// Current instant on this scheduler's clock.
    fn now(&self) -> Instant;

    /// Run `task` once `delay` has elapsed unless the returned token is
    /// cancelled (or dropped) first.
    fn after(&self, delay: Duration, task: TimerTask) -> CancelToken;
}

/// Cancels a pending timer. Cancelling is synchronous; a timer that has
/// already fired runs its task to completion.
pub struct CancelToken {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelToken {
    fn new(tx: oneshot::Sender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Tokio-backed scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn after(&self, delay: Duration, task: TimerTask) -> CancelToken {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task.await,
                _ = rx => {}
            }
        });
        CancelToken::new(tx)
    }
}

// ---------------------------------------------------------------------------
// Virtual clock (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use manual::ManualScheduler;


// ===========================================================================
// Tests
// ===========================================================================
