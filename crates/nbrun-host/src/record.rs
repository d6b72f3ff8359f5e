//! Request records: one per submitted execution.
//!
//! A record moves `QUEUED -> RUNNING -> (PENDING_INPUT <-> RUNNING)* ->
//! COMPLETED | ERRORED`. Terminal states are absorbing; every other transition
//! is rejected with [`StackError::InvalidState`] and leaves the record as is.

use std::fmt;
use std::time::{Duration, Instant};

use nbrun_protocol::{
    ErrorInfo, ErrorKind, ExecutionResult, ExecutionStatus, InputRequest, MessageHeader,
    OutputEvent, PendingInputBody, RequestMetadata, RequestState,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StackError;

/// Opaque handle naming one running kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelId(String);

impl KernelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KernelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for KernelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Process-unique request identifier; never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A prompt the kernel is blocked on, with the header the reply must echo.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInput {
    pub parent_header: MessageHeader,
    pub request: InputRequest,
}

impl PendingInput {
    pub fn to_body(&self) -> PendingInputBody {
        PendingInputBody {
            parent_header: self.parent_header.clone(),
            input_request: self.request.clone(),
        }
    }
}

/// Immutable copy of a record handed to pollers.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub kernel_id: KernelId,
    pub state: RequestState,
    pub metadata: RequestMetadata,
    pub outputs: Vec<OutputEvent>,
    pub pending_input: Option<PendingInput>,
    pub result: Option<ExecutionResult>,
}

#[derive(Debug)]
pub struct RequestRecord {
    id: RequestId,
    kernel_id: KernelId,
    code: String,
    metadata: RequestMetadata,
    state: RequestState,
    outputs: Vec<OutputEvent>,
    pending_input: Option<PendingInput>,
    result: Option<ExecutionResult>,
    finished_at: Option<Instant>,
}

impl RequestRecord {
    pub fn new(
        id: RequestId,
        kernel_id: KernelId,
        code: impl Into<String>,
        metadata: RequestMetadata,
    ) -> Self {
        Self {
            id,
            kernel_id,
            code: code.into(),
            metadata,
            state: RequestState::Queued,
            outputs: Vec::new(),
            pending_input: None,
            result: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.kernel_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn outputs(&self) -> &[OutputEvent] {
        &self.outputs
    }

    pub fn pending_input(&self) -> Option<&PendingInput> {
        self.pending_input.as_ref()
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        self.result.as_ref()
    }

    fn invalid(&self) -> StackError {
        StackError::InvalidState {
            id: self.id.clone(),
            state: self.state,
        }
    }

    /// `QUEUED -> RUNNING`.
    pub fn start(&mut self) -> Result<(), StackError> {
        if self.state != RequestState::Queued {
            return Err(self.invalid());
        }
        self.state = RequestState::Running;
        Ok(())
    }

    /// Append an output; allowed while the request holds the kernel.
    pub fn push_output(&mut self, output: OutputEvent) -> Result<(), StackError> {
        if !self.state.is_active() {
            return Err(self.invalid());
        }
        self.outputs.push(output);
        Ok(())
    }

    /// `RUNNING -> PENDING_INPUT`.
    pub fn await_input(&mut self, pending: PendingInput) -> Result<(), StackError> {
        if self.state != RequestState::Running {
            return Err(self.invalid());
        }
        self.pending_input = Some(pending);
        self.state = RequestState::PendingInput;
        Ok(())
    }

    /// `PENDING_INPUT -> RUNNING`, handing back the prompt that was answered.
    pub fn resume(&mut self) -> Result<PendingInput, StackError> {
        if self.state != RequestState::PendingInput {
            return Err(self.invalid());
        }
        let pending = self.pending_input.take().ok_or_else(|| self.invalid())?;
        self.state = RequestState::Running;
        Ok(pending)
    }

    /// Terminal transition driven by the kernel's reply.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        execution_count: Option<i64>,
        error: Option<ErrorInfo>,
    ) -> Result<&ExecutionResult, StackError> {
        if !self.state.is_active() {
            return Err(self.invalid());
        }
        let error = match status {
            ExecutionStatus::Ok => None,
            ExecutionStatus::Error => Some(error.unwrap_or_else(|| ErrorInfo {
                kind: ErrorKind::KernelExecutionError,
                message: error_summary(&self.outputs),
            })),
        };
        self.state = match status {
            ExecutionStatus::Ok => RequestState::Completed,
            ExecutionStatus::Error => RequestState::Errored,
        };
        self.pending_input = None;
        self.finished_at = Some(Instant::now());
        Ok(self.result.insert(ExecutionResult {
            status,
            execution_count,
            outputs: self.outputs.clone(),
            error,
        }))
    }

    /// Terminal failure synthesized by the host (not reported by the kernel).
    ///
    /// Allowed from `QUEUED` too, for requests whose kernel vanished before
    /// they were dispatched.
    pub fn fail(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<&ExecutionResult, StackError> {
        if self.state.is_terminal() {
            return Err(self.invalid());
        }
        self.state = RequestState::Errored;
        self.pending_input = None;
        self.finished_at = Some(Instant::now());
        Ok(self.result.insert(ExecutionResult {
            status: ExecutionStatus::Error,
            execution_count: None,
            outputs: self.outputs.clone(),
            error: Some(ErrorInfo {
                kind,
                message: message.into(),
            }),
        }))
    }

    /// Terminal for at least `ttl` as of `now`.
    pub fn expired(&self, now: Instant, ttl: Duration) -> bool {
        self.finished_at
            .is_some_and(|at| now.saturating_duration_since(at) >= ttl)
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            id: self.id.clone(),
            kernel_id: self.kernel_id.clone(),
            state: self.state,
            metadata: self.metadata.clone(),
            outputs: self.outputs.clone(),
            pending_input: self.pending_input.clone(),
            result: self.result.clone(),
        }
    }
}

/// `ename: evalue` of every error output, one per line.
pub fn error_summary(outputs: &[OutputEvent]) -> String {
    outputs
        .iter()
        .filter_map(|output| match output {
            OutputEvent::Error { ename, evalue, .. } => Some(format!("{ename}: {evalue}")),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
