//! Evaluation engine SDK.
//!
//! An [`Evaluator`] drives a task over a dataset under bounded concurrency,
//! fans metric computations out per item, keeps a crash-safe CSV checkpoint,
//! and streams NDJSON run events to the platform without ever blocking item
//! progress on the network.

mod adapter;
mod blocking;
mod checkpoint;
mod client;
mod config;
mod dataset;
mod evaluator;
mod metric;
mod progress;
mod results;
mod stream;

pub use adapter::{TaskAdapter, TaskInvocation, TaskOutput};
pub use blocking::BlockingMonitor;
pub use checkpoint::{
    load_checkpoint_state, CheckpointError, CheckpointRow, CheckpointState, CheckpointWriter,
};
pub use client::PlatformClient;
pub use config::EvalConfig;
pub use dataset::{Dataset, DatasetItem};
pub use evaluator::{EvalOutcome, EvalSummary, Evaluator, ItemFailure, ItemResult};
pub use metric::{Metric, MetricScore, MetricValue};
pub use progress::{
    ProgressObserver, ProgressSnapshot, ProgressTracker, SnapshotRow, SnapshotStats,
};
pub use results::write_results_file;
pub use stream::{EventStream, EventTransport, HttpTransport, RunEventSink};
