// Execution Records
// Identifier, lifecycle status and the per-job record pollers read snapshots of

use crate::protocol::{StepResult, StepStatus};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque execution identifier (UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Full state of one execution, owned by its JobExecutor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub protocol_name: String,
    pub status: ExecutionStatus,
    /// One entry per protocol step, in protocol order
    pub steps: Vec<StepResult>,
    pub termination_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(id: ExecutionId, protocol_name: impl Into<String>, step_names: &[&str]) -> Self {
        Self {
            id,
            protocol_name: protocol_name.into(),
            status: ExecutionStatus::Queued,
            steps: step_names.iter().copied().map(StepResult::pending).collect(),
            termination_message: None,
            submitted_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Fraction of steps that reached a terminal status
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self.steps.iter().filter(|s| s.status.is_terminal()).count();
        done as f64 / self.steps.len() as f64
    }

    /// Index of the step that is running, or else the last step that finished
    pub fn current_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::Running)
            .or_else(|| self.steps.iter().rposition(|s| s.status.is_terminal()))
    }

    pub fn info(&self, message: Option<String>) -> ExecutionInfo {
        let step_index = self.current_step();
        ExecutionInfo {
            status: self.status,
            progress: self.progress(),
            step_index,
            step_name: step_index.map(|i| self.steps[i].step_name.clone()),
            message,
        }
    }
}

/// Element of the status stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub status: ExecutionStatus,
    /// Completed steps / total steps, in [0, 1]
    pub progress: f64,
    pub step_index: Option<usize>,
    pub step_name: Option<String>,
    pub message: Option<String>,
}

/// Element of the intermediate-results stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediatePayload {
    pub step_name: String,
    pub step_index: usize,
    pub status: String,
    pub payload: Bytes,
}
