pub mod executor;
pub mod runner;
pub mod scheduler;

pub use executor::{TaskExecutor, TaskOutput};
pub use runner::{ArtifactReport, RunOptions, RunOutcome, Runner};
pub use scheduler::{fair_share, FairShare, StopFlag};
