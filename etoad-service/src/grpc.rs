// gRPC Wire Types
// Generated protobuf types and conversions from the execution model

use crate::execution::{ExecutionInfo, ExecutionStatus, IntermediatePayload, JobSummary};

pub mod proto {
    tonic::include_proto!("etoad");
}

impl From<ExecutionStatus> for proto::ExecutionStatus {
    fn from(s: ExecutionStatus) -> Self {
        match s {
            ExecutionStatus::Queued => proto::ExecutionStatus::Queued,
            ExecutionStatus::Running => proto::ExecutionStatus::Running,
            ExecutionStatus::Succeeded => proto::ExecutionStatus::Succeeded,
            ExecutionStatus::Failed => proto::ExecutionStatus::Failed,
            ExecutionStatus::Cancelled => proto::ExecutionStatus::Cancelled,
        }
    }
}

impl ExecutionStatus {
    /// Decode the wire enum; `None` for unspecified or unknown values
    pub fn from_wire(value: i32) -> Option<Self> {
        match proto::ExecutionStatus::try_from(value).ok()? {
            proto::ExecutionStatus::Unspecified => None,
            proto::ExecutionStatus::Queued => Some(ExecutionStatus::Queued),
            proto::ExecutionStatus::Running => Some(ExecutionStatus::Running),
            proto::ExecutionStatus::Succeeded => Some(ExecutionStatus::Succeeded),
            proto::ExecutionStatus::Failed => Some(ExecutionStatus::Failed),
            proto::ExecutionStatus::Cancelled => Some(ExecutionStatus::Cancelled),
        }
    }

    pub fn to_wire(self) -> i32 {
        proto::ExecutionStatus::from(self) as i32
    }
}

impl From<ExecutionInfo> for proto::ExecutionInfo {
    fn from(info: ExecutionInfo) -> Self {
        proto::ExecutionInfo {
            status: info.status.to_wire(),
            progress: info.progress,
            step_index: info.step_index.map(|i| i as u32),
            step_name: info.step_name,
            message: info.message,
        }
    }
}

impl From<IntermediatePayload> for proto::IntermediateResponse {
    fn from(p: IntermediatePayload) -> Self {
        proto::IntermediateResponse {
            status: p.status,
            payload: p.payload.to_vec(),
            step_name: p.step_name,
            step_index: p.step_index as u32,
        }
    }
}

impl From<JobSummary> for proto::JobSummary {
    fn from(s: JobSummary) -> Self {
        proto::JobSummary {
            execution_id: s.id.to_string(),
            protocol_name: s.protocol_name,
            status: s.status.to_wire(),
            submitted_at_unix: s.submitted_at.timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_values() {
        for status in [
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(ExecutionStatus::from_wire(status.to_wire()), Some(status));
        }
        assert_eq!(ExecutionStatus::from_wire(0), None);
        assert_eq!(ExecutionStatus::from_wire(42), None);
    }

    #[test]
    fn test_info_conversion() {
        let info = ExecutionInfo {
            status: ExecutionStatus::Running,
            progress: 0.5,
            step_index: Some(1),
            step_name: Some("CV".to_string()),
            message: None,
        };
        let wire = proto::ExecutionInfo::from(info);
        assert_eq!(wire.status, proto::ExecutionStatus::Running as i32);
        assert_eq!(wire.step_index, Some(1));
        assert_eq!(wire.step_name.as_deref(), Some("CV"));
    }
}
