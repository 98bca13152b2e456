//! How a [`Backoff`](crate::Backoff) waits out its cool-down.
//!
//! Production code sleeps on the tokio timer. Tests swap in a [`TrackingSleeper`] to see which
//! cool-downs were requested without spending the time.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, cool_down: Duration) -> BoxFuture<'static, ()>;
}

/// Sleeps on the tokio timer, so paused test time applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, cool_down: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(cool_down).boxed()
    }
}

/// Records each requested cool-down and resolves at once.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    cool_downs: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested cool-downs, oldest first.
    pub fn calls(&self) -> Vec<Duration> {
        self.cool_downs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn total(&self) -> Duration {
        self.calls().into_iter().sum()
    }

    pub fn clear(&self) {
        self.cool_downs.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, cool_down: Duration) -> BoxFuture<'static, ()> {
        self.cool_downs.lock().unwrap_or_else(PoisonError::into_inner).push(cool_down);
        futures::future::ready(()).boxed()
    }
}
