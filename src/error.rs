use std::any::Any;
use std::error::Error;
use std::io;
use std::mem;
use std::slice;
use std::sync::{Mutex, PoisonError};
use std::vec;
use thiserror::Error;
use crate::cancel::CancelReason;

/// Boxed failure raised by a user function for one item.
pub type Cause = Box<dyn Error + Send + Sync + 'static>;

/// A user function panicked while processing an item.
#[derive(Debug, Error)]
#[error("panicked: {message}")]
pub struct Panicked {
    pub message: String,
}

impl Panicked {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Panicked {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => message.to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        };
        Panicked { message }
    }
}

/// Failure of the operation chain on the item at `index`.
#[derive(Debug, Error)]
#[error("item #{index} failed: {cause}")]
pub struct ItemFailure {
    pub index: usize,
    #[source]
    pub cause: Cause,
}

impl ItemFailure {
    pub fn new(index: usize, cause: Cause) -> ItemFailure {
        ItemFailure { index, cause }
    }

    pub fn is_panic(&self) -> bool {
        self.cause.is::<Panicked>()
    }
}

/// Every item failure of one execution, sorted by index. Never empty.
#[derive(Debug, Error)]
#[error("{} item(s) failed", .failures.len())]
pub struct AggregateError {
    failures: Vec<ItemFailure>,
}

impl AggregateError {
    pub fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, ItemFailure> {
        self.failures.iter()
    }

    pub fn into_failures(self) -> Vec<ItemFailure> {
        self.failures
    }
}

impl IntoIterator for AggregateError {
    type Item = ItemFailure;
    type IntoIter = vec::IntoIter<ItemFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}

impl<'e> IntoIterator for &'e AggregateError {
    type Item = &'e ItemFailure;
    type IntoIter = slice::Iter<'e, ItemFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.iter()
    }
}

/// Terminal failure of a query execution.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    /// The signal fired before every item was processed. Item failures
    /// recorded before that point are kept in `failures`.
    #[error("query cancelled ({reason}) after {completed} of {total} items")]
    Cancelled {
        reason: CancelReason,
        completed: usize,
        total: usize,
        failures: Vec<ItemFailure>,
    },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker thread #{0} died outside of item processing")]
    WorkerLost(usize),
}

impl QueryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled { .. })
    }

    pub fn as_aggregate(&self) -> Option<&AggregateError> {
        match self {
            QueryError::Aggregate(aggregate) => Some(aggregate),
            _ => None,
        }
    }
}

/// Lock-protected accumulator shared by all workers of one execution.
#[derive(Default)]
pub struct ErrorAggregator {
    failures: Mutex<Vec<ItemFailure>>,
}

impl ErrorAggregator {
    pub fn new() -> ErrorAggregator {
        ErrorAggregator::default()
    }

    pub fn push(&self, failure: ItemFailure) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).push(failure);
    }

    pub fn len(&self) -> usize {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<ItemFailure> {
        let mut failures = mem::take(&mut *self.failures.lock().unwrap_or_else(PoisonError::into_inner));
        failures.sort_by_key(|failure| failure.index);
        failures
    }

    pub fn into_failures(self) -> Vec<ItemFailure> {
        let mut failures = self.failures.into_inner().unwrap_or_else(PoisonError::into_inner);
        failures.sort_by_key(|failure| failure.index);
        failures
    }

    pub fn into_error(self) -> Option<AggregateError> {
        let failures = self.into_failures();
        if failures.is_empty() {
            None
        } else {
            Some(AggregateError { failures })
        }
    }
}
