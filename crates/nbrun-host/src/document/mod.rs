//! Shared-document sink.
//!
//! Requests whose metadata names a `document_id` and `cell_id` mirror their
//! lifecycle into that cell. Pushes are best effort: the execution stack logs
//! a failed push and carries on.

pub mod notebook;

use async_trait::async_trait;
use nbrun_protocol::{ExecutionStatus, OutputEvent, RequestMetadata};

pub use notebook::{CellExecutionState, CellKind, NotebookCell, NotebookStore};

use crate::error::SinkError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellTarget {
    pub document_id: String,
    pub cell_id: String,
}

impl CellTarget {
    pub fn new(document_id: impl Into<String>, cell_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            cell_id: cell_id.into(),
        }
    }

    /// The cell a request mirrors into, if its metadata names both ids.
    pub fn from_metadata(metadata: &RequestMetadata) -> Option<Self> {
        match (&metadata.document_id, &metadata.cell_id) {
            (Some(document_id), Some(cell_id)) => Some(Self::new(document_id, cell_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellEvent {
    ExecutionStarted { record_timing: bool, at: String },
    Output(OutputEvent),
    ClearOutput { wait: bool },
    ExecutionFinished {
        execution_count: Option<i64>,
        status: ExecutionStatus,
        record_timing: bool,
        at: String,
    },
}

#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn push(&self, target: &CellTarget, event: CellEvent) -> Result<(), SinkError>;
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl DocumentSink for NullSink {
    async fn push(&self, _target: &CellTarget, _event: CellEvent) -> Result<(), SinkError> {
        Ok(())
    }
}
