use std::thread;
use std::panic::{self, AssertUnwindSafe};
use log::trace;
use crate::cancel::CancellationSignal;
use crate::collect::Collector;
use crate::error::{Cause, ErrorAggregator, ItemFailure, Panicked, QueryError};
use crate::partition::ChunkQueue;

/// Result of running the operation chain on one item.
pub enum Outcome<R> {
    Value(R),
    Filtered,
    Failed(Cause),
}

impl<R> Outcome<R> {
    pub fn map<U, F>(self, f: F) -> Outcome<U> where F: FnOnce(R) -> U {
        match self {
            Outcome::Value(value) => Outcome::Value(f(value)),
            Outcome::Filtered => Outcome::Filtered,
            Outcome::Failed(cause) => Outcome::Failed(cause),
        }
    }

    pub fn and_then<U, F>(self, f: F) -> Outcome<U> where F: FnOnce(R) -> Outcome<U> {
        match self {
            Outcome::Value(value) => f(value),
            Outcome::Filtered => Outcome::Filtered,
            Outcome::Failed(cause) => Outcome::Failed(cause),
        }
    }
}

/// Composed operation chain, applied to one source item.
pub type Stage<'a, T, R> = dyn Fn(&'a T) -> Outcome<R> + Send + Sync + 'a;

/// Everything the workers of one execution share.
pub struct Job<'a, 'j, T, R, C> {
    pub source: &'a [T],
    pub stage: &'j Stage<'a, T, R>,
    pub chunks: ChunkQueue,
    pub collector: &'j C,
    pub errors: &'j ErrorAggregator,
    pub signal: &'j CancellationSignal,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// Items that went through the operation chain, whatever the outcome.
    pub processed: usize,
    pub chunks: usize,
    /// Set when the worker stopped because of the cancellation signal.
    pub stopped: bool,
}

impl Report {
    fn merge(&mut self, other: Report) {
        self.processed += other.processed;
        self.chunks += other.chunks;
        self.stopped |= other.stopped;
    }
}

/// Fixed-size set of worker threads, spawned for one execution and joined
/// before [`WorkerPool::run`] returns.
pub struct WorkerPool {
    workers_count: usize,
}

impl WorkerPool {
    pub fn new(workers_count: usize) -> WorkerPool {
        WorkerPool { workers_count }
    }

    pub fn workers_count(&self) -> usize {
        self.workers_count
    }

    pub fn run<'a, T, R, C>(&self, job: &Job<'a, '_, T, R, C>) -> Result<Report, QueryError>
        where T: Sync, R: Send, C: Collector<R>
    {
        thread::scope(|scope| {
            let mut slaves = Vec::with_capacity(self.workers_count);
            let mut spawn_error = None;
            for worker_id in 0 .. self.workers_count {
                let maybe_thread = thread::Builder::new()
                    .name(format!("par_query worker #{}", worker_id))
                    .spawn_scoped(scope, move || worker_loop(worker_id, job));
                match maybe_thread {
                    Ok(handle) =>
                        slaves.push((worker_id, handle)),
                    Err(e) => {
                        // already running workers drain the queue on their own
                        spawn_error = Some(e);
                        break;
                    },
                }
            }

            let mut total = Report::default();
            let mut lost = None;
            for (worker_id, handle) in slaves {
                match handle.join() {
                    Ok(report) =>
                        total.merge(report),
                    Err(_) =>
                        lost = Some(worker_id),
                }
            }

            if let Some(e) = spawn_error {
                return Err(QueryError::Spawn(e));
            }
            if let Some(worker_id) = lost {
                return Err(QueryError::WorkerLost(worker_id));
            }
            Ok(total)
        })
    }
}

fn worker_loop<'a, T, R, C>(worker_id: usize, job: &Job<'a, '_, T, R, C>) -> Report where C: Collector<R> {
    trace!("worker #{} started", worker_id);
    let source: &'a [T] = job.source;
    let mut report = Report::default();
    for chunk in job.chunks.pull() {
        for index in chunk.indices() {
            if job.signal.is_cancelled() {
                trace!("worker #{} stopped by cancellation at index {}", worker_id, index);
                report.stopped = true;
                return report;
            }

            let item = &source[index];
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (job.stage)(item)))
                .unwrap_or_else(|payload| Outcome::Failed(Box::new(Panicked::from_payload(payload))));
            match outcome {
                Outcome::Value(value) =>
                    job.collector.accept(index, Some(value)),
                Outcome::Filtered =>
                    job.collector.accept(index, None),
                Outcome::Failed(cause) => {
                    job.errors.push(ItemFailure::new(index, cause));
                    job.collector.accept(index, None);
                },
            }
            report.processed += 1;
        }
        report.chunks += 1;
    }
    trace!("worker #{} finished: {} items in {} chunks", worker_id, report.processed, report.chunks);
    report
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;
    use super::{Job, Outcome, Stage, WorkerPool};
    use crate::cancel::CancellationSignal;
    use crate::collect::{Buffer, Collector, Unordered};
    use crate::error::ErrorAggregator;
    use crate::partition::{partition, ChunkQueue, PartitionPolicy};

    struct Trace {
        seen: Mutex<Vec<(thread::ThreadId, usize)>>,
    }

    impl Collector<usize> for Trace {
        fn accept(&self, index: usize, _value: Option<usize>) {
            self.seen.lock().unwrap().push((thread::current().id(), index));
        }
    }

    fn job<'a, 'j, C>(source: &'a [usize], stage: &'j Stage<'a, usize, usize>, workers: usize, collector: &'j C,
                      errors: &'j ErrorAggregator, signal: &'j CancellationSignal) -> Job<'a, 'j, usize, usize, C>
    {
        Job {
            source,
            stage,
            chunks: ChunkQueue::new(partition(source.len(), workers, PartitionPolicy::Balanced)),
            collector,
            errors,
            signal,
        }
    }

    #[test]
    fn every_index_processed_once() {
        let source: Vec<usize> = (0 .. 1000).collect();
        let stage = |x: &usize| Outcome::Value(x * 2);
        let collector = Unordered::new(Buffer::new());
        let errors = ErrorAggregator::new();
        let signal = CancellationSignal::new();

        let report = WorkerPool::new(4)
            .run(&job(&source, &stage, 4, &collector, &errors, &signal))
            .unwrap();
        assert_eq!(report.processed, 1000);
        assert_eq!(report.chunks, 16);
        assert!(!report.stopped);

        let mut values = collector.into_sink().into_vec();
        values.sort();
        assert_eq!(values, (0 .. 1000).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn indices_increase_within_each_worker_chunk() {
        let source: Vec<usize> = (0 .. 500).collect();
        let stage = |x: &usize| Outcome::Value(*x);
        let collector = Trace { seen: Mutex::new(Vec::new()) };
        let errors = ErrorAggregator::new();
        let signal = CancellationSignal::new();
        let mut range_job = job(&source, &stage, 3, &collector, &errors, &signal);
        range_job.chunks = ChunkQueue::new(partition(source.len(), 3, PartitionPolicy::Range));

        WorkerPool::new(3).run(&range_job).unwrap();

        let seen = collector.seen.into_inner().unwrap();
        assert_eq!(seen.len(), 500);
        let threads: Vec<_> = seen.iter().map(|(id, _)| *id).collect();
        for id in threads {
            let indices: Vec<_> = seen.iter().filter(|(t, _)| *t == id).map(|(_, i)| *i).collect();
            assert!(indices.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn failures_do_not_stop_siblings() {
        let source: Vec<usize> = (0 .. 100).collect();
        let stage = |x: &usize| {
            if x % 10 == 0 {
                Outcome::Failed(format!("bad {}", x).into())
            } else if x % 10 == 5 {
                panic!("panicking on {}", x)
            } else {
                Outcome::Value(*x)
            }
        };
        let collector = Unordered::new(Buffer::new());
        let errors = ErrorAggregator::new();
        let signal = CancellationSignal::new();

        let report = WorkerPool::new(4)
            .run(&job(&source, &stage, 4, &collector, &errors, &signal))
            .unwrap();
        assert_eq!(report.processed, 100);
        assert_eq!(collector.into_sink().into_vec().len(), 80);

        let failures = errors.into_failures();
        assert_eq!(failures.len(), 20);
        assert_eq!(failures.iter().filter(|f| f.is_panic()).count(), 10);
    }

    #[test]
    fn cancelled_signal_stops_before_first_item() {
        let source: Vec<usize> = (0 .. 100).collect();
        let stage = |x: &usize| Outcome::Value(*x);
        let collector = Unordered::new(Buffer::new());
        let errors = ErrorAggregator::new();
        let signal = CancellationSignal::new();
        signal.cancel();

        let report = WorkerPool::new(2)
            .run(&job(&source, &stage, 2, &collector, &errors, &signal))
            .unwrap();
        assert_eq!(report.processed, 0);
        assert!(report.stopped);
        assert!(collector.into_sink().into_vec().is_empty());
    }

    #[test]
    fn outcome_combinators() {
        let filtered: Outcome<i32> = Outcome::Filtered;
        assert!(matches!(filtered.map(|x| x + 1), Outcome::Filtered));
        assert!(matches!(Outcome::Value(1).map(|x| x + 1), Outcome::Value(2)));
        assert!(matches!(Outcome::Value(1).and_then(|_| Outcome::<i32>::Filtered), Outcome::Filtered));
    }
}
