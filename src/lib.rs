//! Data-parallel queries over borrowed slices.
//!
//! A [`Query`] describes a chain of `map`/`try_map`/`filter` steps over a
//! slice. Terminal operations split the slice into chunks, run the chain on a
//! pool of scoped worker threads and merge the results either as they
//! complete or in source order. Item failures (errors and panics) never stop
//! sibling work; they are reported together as one [`AggregateError`] once
//! every chunk is done. A [`CancellationSignal`] is polled before each item
//! and, when it fires before all items were processed, the query fails with
//! [`QueryError::Cancelled`].
//!
//! ```
//! use par_query::AsParallel;
//!
//! let numbers = [1u64, 2, 3, 4, 5, 6, 7];
//! let factorials = numbers
//!     .as_parallel()
//!     .as_ordered()
//!     .map(|n| (1 ..= *n).product::<u64>())
//!     .to_vec()
//!     .unwrap();
//! assert_eq!(factorials, vec![1, 2, 6, 24, 120, 720, 5040]);
//! ```

pub mod cancel;
pub mod collect;
pub mod error;
pub mod par;
pub mod partition;
pub mod query;

pub use cancel::{CancelReason, CancelTimer, CancellationSignal};
pub use error::{AggregateError, Cause, ErrorAggregator, ItemFailure, Panicked, QueryError};
pub use partition::{Chunk, PartitionPolicy};
pub use query::{AsParallel, OrderingMode, Query, QueryOptions, Sequence, StepKind};
