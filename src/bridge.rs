//! Worker-thread bridge
//!
//! Runs blocking (or async) work off the game thread and hands the outcome
//! back through the scheduler inbox, so the consumer always runs on the game
//! thread with full access to the world.
//!
//! Work units enforce their own [`Deadline`]. The bridge never interrupts a
//! blocking unit; it only guarantees that exactly one terminal result reaches
//! the consumer, including when the unit panics.

use std::any::Any;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::timer::{RemoteScheduler, TimerScheduler};

/// Point in time after which a work unit should give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            expires: Instant::now() + budget,
        }
    }

    pub fn expires(&self) -> Instant {
        self.expires
    }

    pub fn remaining(&self) -> Duration {
        self.expires.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    /// `Err(Timeout)` once the deadline has passed. Convenient inside polling loops.
    pub fn check(&self) -> Result<(), WorkError> {
        if self.expired() {
            Err(WorkError::Timeout)
        } else {
            Ok(())
        }
    }
}

/// Terminal failure of a work unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    #[error("deadline exceeded")]
    Timeout,

    #[error("work failed: {0}")]
    Failed(String),

    #[error("work panicked: {0}")]
    Panicked(String),

    #[error("work cancelled by runtime shutdown")]
    Cancelled,
}

pub type WorkResult<T> = Result<T, WorkError>;

/// Spawns work on a tokio runtime and routes results into a scheduler of `C`.
pub struct WorkerBridge<C> {
    runtime: Handle,
    remote: RemoteScheduler<C>,
}

impl<C> Clone for WorkerBridge<C> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            remote: self.remote.clone(),
        }
    }
}

impl<C: 'static> WorkerBridge<C> {
    pub fn new(runtime: Handle, remote: RemoteScheduler<C>) -> Self {
        Self { runtime, remote }
    }

    /// Run blocking `work` on the blocking pool.
    ///
    /// `consume` is scheduled with zero delay on the owning scheduler once the
    /// work returns, fails, or panics.
    pub fn run<T, W, F>(&self, label: &'static str, budget: Duration, work: W, consume: F)
    where
        T: Send + 'static,
        W: FnOnce(Deadline) -> WorkResult<T> + Send + 'static,
        F: FnOnce(&mut C, &mut TimerScheduler<C>, WorkResult<T>) + Send + 'static,
    {
        let deadline = Deadline::after(budget);
        tracing::debug!("[bridge] {} started (budget {:?})", label, budget);
        let join = self.runtime.spawn_blocking(move || work(deadline));
        self.deliver(label, join, consume);
    }

    /// Run an async unit of work.
    ///
    /// Futures are cancellable, so the bridge also cuts them off at the
    /// deadline and reports `Timeout`.
    pub fn run_async<T, W, Fut, F>(&self, label: &'static str, budget: Duration, work: W, consume: F)
    where
        T: Send + 'static,
        W: FnOnce(Deadline) -> Fut + Send + 'static,
        Fut: Future<Output = WorkResult<T>> + Send + 'static,
        F: FnOnce(&mut C, &mut TimerScheduler<C>, WorkResult<T>) + Send + 'static,
    {
        let deadline = Deadline::after(budget);
        tracing::debug!("[bridge] {} started async (budget {:?})", label, budget);
        let join = self.runtime.spawn(async move {
            let until = tokio::time::Instant::from_std(deadline.expires());
            match tokio::time::timeout_at(until, work(deadline)).await {
                Ok(result) => result,
                Err(_) => Err(WorkError::Timeout),
            }
        });
        self.deliver(label, join, consume);
    }

    fn deliver<T, F>(&self, label: &'static str, join: JoinHandle<WorkResult<T>>, consume: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut C, &mut TimerScheduler<C>, WorkResult<T>) + Send + 'static,
    {
        let remote = self.remote.clone();
        self.runtime.spawn(async move {
            let result = match join.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(WorkError::Panicked(panic_message(e.into_panic()))),
                Err(_) => Err(WorkError::Cancelled),
            };

            match &result {
                Ok(_) => tracing::debug!("[bridge] {} finished", label),
                Err(e) => tracing::debug!("[bridge] {} ended: {}", label, e),
            }

            let scheduled = remote.schedule(Duration::ZERO, move |ctx, timers| {
                consume(ctx, timers, result)
            });
            if scheduled.is_err() {
                tracing::debug!("[bridge] {} result dropped, scheduler gone", label);
            }
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
