//! Rate limiting for UI-facing work.
//!
//! Two small tools with explicit contracts, independent of any UI
//! lifecycle: [`Debouncer`] delays the *start* of work and collapses bursts
//! of re-arms into the last one; [`Throttle`] gates high-frequency values,
//! always retaining the most recent one so a final flush can never lose it.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Defers an action, cancelling the pending one on every re-arm.
#[derive(Debug, Default)]
pub struct Debouncer {
    handle: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `action` to run after `delay`. A previously armed action
    /// that has not fired yet is dropped first.
    pub fn arm<F>(&mut self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
    }

    /// Drops the pending action, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Passes through at most one value per interval, buffering the latest.
///
/// [`offer`](Self::offer) returns the value when the gate is open;
/// [`take_pending`](Self::take_pending) must be drained at end-of-stream so
/// the final value is never dropped.
#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            pending: None,
        }
    }

    /// Offers a fresh value; returns it when enough time has passed since
    /// the last emission, otherwise buffers it in place of any older
    /// pending value.
    pub fn offer(&mut self, value: T) -> Option<T> {
        let now = Instant::now();
        match self.last_emit {
            Some(previous) if now.duration_since(previous) < self.interval => {
                self.pending = Some(value);
                None
            }
            _ => {
                self.last_emit = Some(now);
                self.pending = None;
                Some(value)
            }
        }
    }

    /// The most recent value withheld by the gate, if any.
    pub fn take_pending(&mut self) -> Option<T> {
        self.pending.take()
    }
}
