use std::fmt;
use std::iter::FusedIterator;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use std::vec;
use log::{debug, warn};
use crate::cancel::{CancelReason, CancellationSignal};
use crate::collect::{Buffer, Collector, ForEach, Ordered, Unordered};
use crate::error::{Cause, ErrorAggregator, QueryError};
use crate::par::{Job, Outcome, Stage, WorkerPool};
use crate::partition::{partition, ChunkQueue, PartitionPolicy};

/// Whether output must follow source order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OrderingMode {
    Ordered,
    #[default]
    Unordered,
}

/// Kind of a step in the operation chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Map,
    TryMap,
    Filter,
}

/// Execution knobs carried by every [`Query`] value.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub ordering: OrderingMode,
    /// Defaults to the number of logical CPUs.
    pub workers: Option<usize>,
    pub partition: PartitionPolicy,
    pub cancellation: Option<CancellationSignal>,
    /// Arms a cancel timer for the duration of each execution.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn workers_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get)
    }
}

/// Immutable description of a parallel query over a borrowed slice.
///
/// Every builder call returns a new, independent value, so a base query can
/// be reused for several variants. Nothing runs until a terminal operation
/// ([`for_each`](Query::for_each), [`to_vec`](Query::to_vec) or iterating a
/// [`Sequence`]); each terminal operation executes the whole pipeline anew.
pub struct Query<'a, T, R> {
    source: &'a [T],
    stage: Arc<Stage<'a, T, R>>,
    steps: Vec<StepKind>,
    options: QueryOptions,
}

impl<'a, T, R> Clone for Query<'a, T, R> {
    fn clone(&self) -> Self {
        Query {
            source: self.source,
            stage: Arc::clone(&self.stage),
            steps: self.steps.clone(),
            options: self.options.clone(),
        }
    }
}

impl<'a, T, R> fmt::Debug for Query<'a, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("len", &self.source.len())
            .field("steps", &self.steps)
            .field("options", &self.options)
            .finish()
    }
}

impl<'a, T> Query<'a, T, &'a T> where T: Sync + 'a {
    pub fn new(source: &'a [T]) -> Query<'a, T, &'a T> {
        Query {
            source,
            stage: Arc::new(|item: &'a T| Outcome::Value(item)),
            steps: Vec::new(),
            options: QueryOptions::default(),
        }
    }
}

/// Entry point for running queries over a slice in parallel.
pub trait AsParallel {
    type Item: Sync;

    fn as_parallel(&self) -> Query<'_, Self::Item, &Self::Item>;
}

impl<T> AsParallel for [T] where T: Sync {
    type Item = T;

    fn as_parallel(&self) -> Query<'_, T, &T> {
        Query::new(self)
    }
}

impl<'a, T, R> Query<'a, T, R> where T: Sync + 'a, R: Send + 'a {
    fn extend<U, F>(&self, kind: StepKind, step: F) -> Query<'a, T, U>
        where F: Fn(Outcome<R>) -> Outcome<U> + Send + Sync + 'a, U: 'a
    {
        let prev = Arc::clone(&self.stage);
        let mut steps = self.steps.clone();
        steps.push(kind);
        Query {
            source: self.source,
            stage: Arc::new(move |item: &'a T| step(prev(item))),
            steps,
            options: self.options.clone(),
        }
    }

    fn with_options<F>(&self, update: F) -> Query<'a, T, R> where F: FnOnce(&mut QueryOptions) {
        let mut query = self.clone();
        update(&mut query.options);
        query
    }

    pub fn map<U, F>(&self, f: F) -> Query<'a, T, U> where F: Fn(R) -> U + Send + Sync + 'a, U: Send + 'a {
        self.extend(StepKind::Map, move |outcome| outcome.map(&f))
    }

    /// Like [`map`](Query::map), but an `Err` is recorded as a failure of
    /// the item instead of producing a value.
    pub fn try_map<U, E, F>(&self, f: F) -> Query<'a, T, U>
        where F: Fn(R) -> Result<U, E> + Send + Sync + 'a, U: Send + 'a, E: Into<Cause>
    {
        self.extend(StepKind::TryMap, move |outcome| outcome.and_then(|value| match f(value) {
            Ok(value) => Outcome::Value(value),
            Err(e) => Outcome::Failed(e.into()),
        }))
    }

    pub fn filter<P>(&self, predicate: P) -> Query<'a, T, R> where P: Fn(&R) -> bool + Send + Sync + 'a {
        self.extend(StepKind::Filter, move |outcome| outcome.and_then(|value| {
            if predicate(&value) { Outcome::Value(value) } else { Outcome::Filtered }
        }))
    }

    pub fn as_ordered(&self) -> Query<'a, T, R> {
        self.with_options(|options| options.ordering = OrderingMode::Ordered)
    }

    pub fn as_unordered(&self) -> Query<'a, T, R> {
        self.with_options(|options| options.ordering = OrderingMode::Unordered)
    }

    pub fn with_cancellation(&self, signal: CancellationSignal) -> Query<'a, T, R> {
        self.with_options(|options| options.cancellation = Some(signal))
    }

    pub fn with_timeout(&self, timeout: Duration) -> Query<'a, T, R> {
        self.with_options(|options| options.timeout = Some(timeout))
    }

    /// Zero workers is accepted and makes every execution produce nothing.
    pub fn with_workers(&self, workers: usize) -> Query<'a, T, R> {
        self.with_options(|options| options.workers = Some(workers))
    }

    pub fn with_partition(&self, policy: PartitionPolicy) -> Query<'a, T, R> {
        self.with_options(|options| options.partition = policy)
    }

    pub fn with_chunk_size(&self, size: usize) -> Query<'a, T, R> {
        self.with_partition(PartitionPolicy::Fixed(size))
    }

    pub fn steps(&self) -> &[StepKind] {
        &self.steps
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn ordering(&self) -> OrderingMode {
        self.options.ordering
    }

    /// Runs `action` on every output value. Unordered queries call it from
    /// the worker that produced the value; ordered queries call it in source
    /// order.
    pub fn for_each<F>(&self, action: F) -> Result<(), QueryError> where F: Fn(R) + Sync {
        let errors = ErrorAggregator::new();
        let sink = ForEach::new(action, &errors);
        match self.options.ordering {
            OrderingMode::Unordered =>
                self.execute(&Unordered::new(sink), &errors),
            OrderingMode::Ordered =>
                self.execute(&Ordered::new(sink), &errors),
        }?;
        finish(errors)
    }

    pub fn to_vec(&self) -> Result<Vec<R>, QueryError> {
        let errors = ErrorAggregator::new();
        let values = match self.options.ordering {
            OrderingMode::Unordered => {
                let collector = Unordered::new(Buffer::new());
                self.execute(&collector, &errors)?;
                collector.into_sink().into_vec()
            },
            OrderingMode::Ordered => {
                let collector = Ordered::new(Buffer::new());
                self.execute(&collector, &errors)?;
                collector.into_sink().into_vec()
            },
        };
        finish(errors)?;
        Ok(values)
    }

    pub fn to_sequence(&self) -> Sequence<'a, T, R> {
        Sequence { state: State::Pending(self.clone()) }
    }

    pub fn to_ordered_sequence(&self) -> Sequence<'a, T, R> {
        self.as_ordered().to_sequence()
    }

    pub fn to_unordered_sequence(&self) -> Sequence<'a, T, R> {
        self.as_unordered().to_sequence()
    }

    fn execute<C>(&self, collector: &C, errors: &ErrorAggregator) -> Result<(), QueryError> where C: Collector<R> {
        let total = self.source.len();
        let workers = self.options.workers_count();
        if workers == 0 {
            warn!("query over {} items configured with zero workers, nothing to execute", total);
            return Ok(());
        }

        let chunks = partition(total, workers, self.options.partition);
        let pool = WorkerPool::new(workers.min(chunks.len()));
        debug!("executing {:?} query over {} items: {} workers, {} chunks, steps {:?}",
               self.options.ordering, total, pool.workers_count(), chunks.len(), self.steps);

        let signal = self.options.cancellation.clone().unwrap_or_default();
        let _timer = match self.options.timeout {
            Some(timeout) => Some(signal.cancel_after(timeout).map_err(QueryError::Spawn)?),
            None => None,
        };

        let job = Job {
            source: self.source,
            stage: &*self.stage,
            chunks: ChunkQueue::new(chunks),
            collector,
            errors,
            signal: &signal,
        };
        let report = pool.run(&job)?;

        if report.processed < total && signal.is_cancelled() {
            let reason = signal.reason().unwrap_or(CancelReason::Requested);
            debug!("query cancelled after {} of {} items ({})", report.processed, total, reason);
            return Err(QueryError::Cancelled {
                reason,
                completed: report.processed,
                total,
                failures: errors.take(),
            });
        }
        Ok(())
    }
}

fn finish(errors: ErrorAggregator) -> Result<(), QueryError> {
    match errors.into_error() {
        Some(aggregate) => {
            debug!("query failed: {}", aggregate);
            Err(QueryError::Aggregate(aggregate))
        },
        None =>
            Ok(()),
    }
}

enum State<'a, T, R> {
    Pending(Query<'a, T, R>),
    Draining(vec::IntoIter<R>),
    Done,
}

/// Lazy, one-shot view of a query's output.
///
/// The query runs on the first call to `next`. A failed execution yields a
/// single `Err` and no values. Once exhausted the sequence stays empty; run
/// the query again through a new terminal call to re-execute it.
pub struct Sequence<'a, T, R> {
    state: State<'a, T, R>,
}

impl<'a, T, R> Iterator for Sequence<'a, T, R> where T: Sync + 'a, R: Send + 'a {
    type Item = Result<R, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match mem::replace(&mut self.state, State::Done) {
                State::Pending(query) =>
                    match query.to_vec() {
                        Ok(values) =>
                            self.state = State::Draining(values.into_iter()),
                        Err(e) =>
                            return Some(Err(e)),
                    },
                State::Draining(mut values) => {
                    let value = values.next()?;
                    self.state = State::Draining(values);
                    return Some(Ok(value));
                },
                State::Done =>
                    return None,
            }
        }
    }
}

impl<'a, T, R> FusedIterator for Sequence<'a, T, R> where T: Sync + 'a, R: Send + 'a { }
