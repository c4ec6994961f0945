use std::cmp;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use crate::error::{ErrorAggregator, ItemFailure, Panicked};

/// Receives released output values.
pub trait Sink<R>: Sync {
    fn emit(&self, index: usize, value: R);
}

/// Receives the outcome of every processed index; `None` marks an index
/// that produced no output (filtered out or failed).
pub trait Collector<R>: Sync {
    fn accept(&self, index: usize, value: Option<R>);
}

/// Materializes released values in release order.
pub struct Buffer<R> {
    values: Mutex<Vec<R>>,
}

impl<R> Buffer<R> {
    pub fn new() -> Buffer<R> {
        Buffer { values: Mutex::new(Vec::new()) }
    }

    pub fn into_vec(self) -> Vec<R> {
        self.values.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R> Default for Buffer<R> {
    fn default() -> Buffer<R> {
        Buffer::new()
    }
}

impl<R> Sink<R> for Buffer<R> where R: Send {
    fn emit(&self, _index: usize, value: R) {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).push(value);
    }
}

/// Hands every released value to a user action. A panicking action is
/// recorded as a failure of the index it was called for.
pub struct ForEach<'e, F> {
    action: F,
    errors: &'e ErrorAggregator,
}

impl<'e, F> ForEach<'e, F> {
    pub fn new(action: F, errors: &'e ErrorAggregator) -> ForEach<'e, F> {
        ForEach { action, errors }
    }
}

impl<F, R> Sink<R> for ForEach<'_, F> where F: Fn(R) + Sync {
    fn emit(&self, index: usize, value: R) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.action)(value))) {
            self.errors.push(ItemFailure::new(index, Box::new(Panicked::from_payload(payload))));
        }
    }
}

/// Releases values immediately, on the thread that produced them.
pub struct Unordered<S> {
    sink: S,
}

impl<S> Unordered<S> {
    pub fn new(sink: S) -> Unordered<S> {
        Unordered { sink }
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S, R> Collector<R> for Unordered<S> where S: Sink<R> {
    fn accept(&self, index: usize, value: Option<R>) {
        if let Some(value) = value {
            self.sink.emit(index, value);
        }
    }
}

struct Pending<R> {
    index: usize,
    value: Option<R>,
}

impl<R> Eq for Pending<R> { }

impl<R> PartialEq for Pending<R> {
    fn eq(&self, other: &Self) -> bool {
        self.index.eq(&other.index)
    }
}

// reversed: the heap top is the lowest index
impl<R> Ord for Pending<R> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other.index.cmp(&self.index)
    }
}

impl<R> PartialOrd for Pending<R> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Reorder<R> {
    next: usize,
    pending: BinaryHeap<Pending<R>>,
}

/// Buffers out-of-order completions and releases values strictly by
/// increasing index. Index `n + 1` is never released before index `n`.
pub struct Ordered<S, R> {
    sink: S,
    state: Mutex<Reorder<R>>,
}

impl<S, R> Ordered<S, R> {
    pub fn new(sink: S) -> Ordered<S, R> {
        Ordered {
            sink,
            state: Mutex::new(Reorder { next: 0, pending: BinaryHeap::new() }),
        }
    }

    /// Number of completions waiting for a predecessor.
    pub fn buffered(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).pending.len()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S, R> Collector<R> for Ordered<S, R> where S: Sink<R>, R: Send {
    fn accept(&self, index: usize, value: Option<R>) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        state.pending.push(Pending { index, value });
        while state.pending.peek().map_or(false, |top| top.index == state.next) {
            if let Some(Pending { index, value }) = state.pending.pop() {
                state.next += 1;
                if let Some(value) = value {
                    self.sink.emit(index, value);
                }
            }
        }
    }
}
