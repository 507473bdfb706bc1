//! Process exit codes. Scripts and CI depend on these values.

pub const SUCCESS: i32 = 0;
/// At least one task failed, or an artifact could not be persisted.
pub const TASK_FAILED: i32 = 1;
/// Configuration, input or other fatal setup error.
pub const CONFIG_ERROR: i32 = 2;
/// The run was interrupted; buffered results were flushed.
pub const INTERRUPTED: i32 = 130;
