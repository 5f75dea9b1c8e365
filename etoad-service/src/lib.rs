// Etoad Service Library
// Protocol loading, step execution and remote job control for measurement workflows

pub mod capability;
pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod grpc;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult, StepError};

pub use config::{ConfigError, ServiceConfig};

pub use capability::{CapabilityError, Invocation, MeasurementCapability, PayloadSink, SimulatedCapability};

// Re-export protocol types
pub use protocol::{
    load_file, parse_str, FileProtocolLoader, ParseError, ParseErrorKind, ParseResult,
    ProtocolDefinition, ProtocolFormat, ProtocolLoader, StepSpec, StepStatus, TaskKind, Value,
};

pub use expression::{EvalError, Expression};

// Re-export execution types
pub use execution::{
    ExecutionEvent, ExecutionId, ExecutionInfo, ExecutionRecord, ExecutionRegistry,
    ExecutionStatus, IntermediatePayload, JobExecutor, ParameterResolver, ProtocolEngine,
    RunOutcome, StepOutputStore,
};

pub use server::EtoadService;
