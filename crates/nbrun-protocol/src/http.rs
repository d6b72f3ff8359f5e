//! HTTP request and response bodies.
//!
//! The status endpoint is a three-state protocol carried by the HTTP status
//! code: `202` still running, `300` awaiting input ([`PendingInputBody`]),
//! `200` terminal ([`ExecutionResult`]).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::message::MessageHeader;
use crate::output::{InputRequest, OutputEvent};

/// Caller-supplied correlation data, echoed back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<String>,
    #[serde(default)]
    pub record_timing: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExecuteBody {
    pub code: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AcceptedBody {
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PendingInputBody {
    pub parent_header: MessageHeader,
    pub input_request: InputRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InputBody {
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

/// Why a request ended in error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ErrorKind {
    /// The kernel channel closed while the request was outstanding.
    KernelDisconnected,
    /// The kernel itself replied with an error.
    KernelExecutionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// Terminal outcome of a request, success or failure alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub execution_count: Option<i64>,
    pub outputs: Vec<OutputEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Queued,
    Running,
    PendingInput,
    Completed,
    Errored,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Errored)
    }

    /// Holding the kernel's execution slot.
    pub fn is_active(self) -> bool {
        matches!(self, RequestState::Running | RequestState::PendingInput)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RequestSummary {
    pub uid: String,
    pub state: RequestState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct KernelInfo {
    pub id: String,
    pub name: String,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StartKernelBody {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthBody {
    pub ok: bool,
    pub version: String,
    pub kernels: usize,
}
