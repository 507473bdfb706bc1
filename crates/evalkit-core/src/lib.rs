pub mod config;
pub mod conversation;
pub mod engine;
pub mod errors;
pub mod extract;
pub mod input;
pub mod judge;
pub mod metrics;
pub mod model;
pub mod providers;
pub mod report;
pub mod retry;
pub mod stats;
pub mod store;

pub use engine::{RunOptions, RunOutcome, Runner, StopFlag, TaskExecutor};
pub use model::{Combo, QuestionItem, ResultRecord};
pub use stats::{ScoringMode, Statistics};
