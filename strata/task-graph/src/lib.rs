//! A small DAG task runtime: build a [TaskGraph] of fallible closures,
//! wire dependencies with `precedes`/`succeeds`, and run it on a
//! [TaskGraphExecutor] backed by a fixed worker pool. A task is admitted
//! to the pool once all of its predecessors have completed; the first
//! failure stops further admissions and is returned from
//! [TaskGraphExecutor::execute].
//!
//! Query operators may use this to parallelize across independent input
//! partitions. The storage core itself never depends on it.

mod executor;
mod graph;
mod task;

pub use executor::{TaskGraphExecutor, ThreadPool};
pub use graph::TaskGraph;
pub use task::{Task, TaskError, TaskStatus};

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error("Cannot execute task graph; the graph is cyclic (unsupported)")]
    CyclicGraph,
    #[error("Cannot add dependency; task {0} is not in this graph")]
    UnknownTask(u64),
    #[error("Task {name:?} failed: {source}")]
    TaskFailed { name: String, source: TaskError },
}
