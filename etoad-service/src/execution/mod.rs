// Execution Module
// Protocol engine, per-job executor, registry and the buffers observers read

pub mod engine;
pub mod events;
pub mod job;
pub mod log;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod store;

#[cfg(test)]
pub(crate) mod fixtures;

// Re-export key types
pub use engine::{ProtocolEngine, RunOutcome};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use job::JobExecutor;
pub use log::{AppendLog, LogCursor};
pub use record::{ExecutionId, ExecutionInfo, ExecutionRecord, ExecutionStatus, IntermediatePayload};
pub use registry::{parse_execution_id, ExecutionRegistry, JobSummary};
pub use resolver::ParameterResolver;
pub use store::StepOutputStore;
