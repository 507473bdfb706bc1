//! Progress reporting. The runner emits one event per finished task, in completion order;
//! the console layer consumes them through a sink.

use crate::model::Combo;
use std::sync::Arc;

/// How many tasks of one (model, persona) combination are done.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub combo: Combo,
    pub done: usize,
    pub total: usize,
}

/// Called each time a task completes. Implementations may throttle.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
