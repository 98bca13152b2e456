//! Wait lists for requests that could not be admitted yet.

use crate::queued_request::QueuedRequest;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Ordered wait list of one scope bundle.
pub trait Queueing: Send + fmt::Debug {
    /// Append.
    fn add(&mut self, request: Arc<QueuedRequest>);
    /// Prepend: a request re-queued on the rule it just failed on keeps its place.
    fn add_again(&mut self, request: Arc<QueuedRequest>);
    /// Pop the front entry.
    fn next(&mut self) -> Option<Arc<QueuedRequest>>;
    fn number_waiting(&self) -> usize;
    /// Drop an aborted request wherever it sits.
    fn remove(&mut self, id: u64) -> bool;
}

#[derive(Debug, Default)]
pub struct Fifo {
    deque: VecDeque<Arc<QueuedRequest>>,
}

impl Fifo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Queueing for Fifo {
    fn add(&mut self, request: Arc<QueuedRequest>) {
        self.deque.push_back(request);
    }

    fn add_again(&mut self, request: Arc<QueuedRequest>) {
        self.deque.push_front(request);
    }

    fn next(&mut self) -> Option<Arc<QueuedRequest>> {
        self.deque.pop_front()
    }

    fn number_waiting(&self) -> usize {
        self.deque.len()
    }

    fn remove(&mut self, id: u64) -> bool {
        match self.deque.iter().position(|r| r.id() == id) {
            Some(index) => self.deque.remove(index).is_some(),
            None => false,
        }
    }
}
