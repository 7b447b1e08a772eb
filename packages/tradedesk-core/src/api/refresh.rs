//! Single-flight session refresh.
//!
//! The first caller to need a refresh becomes the leader and runs it. Callers
//! arriving while it is in flight park a oneshot receiver in the pending queue
//! and are released with the leader's outcome. The state lock is never held
//! across an await.

use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::{Error, Result};

type Waiter = oneshot::Sender<Result<()>>;

#[derive(Debug, Default)]
struct RefreshState {
    in_progress: bool,
    pending: Vec<Waiter>,
}

/// Coordinates session refreshes so at most one is in flight at a time.
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    episodes: AtomicU64,
    generation: AtomicU64,
}

enum Ticket<'a> {
    Leader(LeaderGuard<'a>),
    Waiter(oneshot::Receiver<Result<()>>),
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.lock().in_progress
    }

    /// Number of callers parked behind the in-flight refresh.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of refreshes started so far.
    pub fn episodes(&self) -> u64 {
        self.episodes.load(Ordering::Relaxed)
    }

    /// Number of refreshes that succeeded so far.
    ///
    /// A request that read an older generation before it was sent went out
    /// with stale credentials and can be replayed without a new refresh.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Run `refresh`, or wait for the one already in flight.
    ///
    /// `refresh` is only invoked by the leader, so any side effect it performs
    /// happens once per episode. Waiters receive `Ok(())` or
    /// [`Error::RefreshFailed`] carrying the leader's error.
    pub async fn run<F, Fut>(&self, refresh: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match self.join() {
            Ticket::Waiter(receiver) => receiver.await.unwrap_or(Err(Error::RefreshCancelled)),
            Ticket::Leader(guard) => {
                let outcome = refresh().await;
                guard.settle(outcome)
            }
        }
    }

    fn join(&self) -> Ticket<'_> {
        let mut state = self.lock();
        if state.in_progress {
            let (sender, receiver) = oneshot::channel();
            state.pending.push(sender);
            tracing::debug!("Refresh in flight, parking request ({} waiting)", state.pending.len());
            return Ticket::Waiter(receiver);
        }

        state.in_progress = true;
        self.episodes.fetch_add(1, Ordering::Relaxed);
        Ticket::Leader(LeaderGuard {
            coordinator: self,
            settled: false,
        })
    }

    fn finish(&self) -> Vec<Waiter> {
        let mut state = self.lock();
        state.in_progress = false;
        mem::take(&mut state.pending)
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held by the leader while its refresh runs.
///
/// Dropping it unsettled (the leader's future was cancelled) clears the
/// in-progress flag; parked waiters then see [`Error::RefreshCancelled`].
struct LeaderGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl LeaderGuard<'_> {
    fn settle(mut self, outcome: Result<()>) -> Result<()> {
        self.settled = true;
        if outcome.is_ok() {
            self.coordinator.generation.fetch_add(1, Ordering::SeqCst);
        }
        let waiters = self.coordinator.finish();

        match outcome {
            Ok(()) => {
                tracing::debug!("Refresh succeeded, releasing {} parked requests", waiters.len());
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                Ok(())
            }
            Err(err) => {
                tracing::debug!("Refresh failed, rejecting {} parked requests", waiters.len());
                let shared = Arc::new(err);
                for waiter in waiters {
                    let _ = waiter.send(Err(Error::RefreshFailed(shared.clone())));
                }
                Err(Error::RefreshFailed(shared))
            }
        }
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let waiters = self.coordinator.finish();
        tracing::warn!(
            "Session refresh abandoned, {} parked requests released with an error",
            waiters.len()
        );
    }
}
