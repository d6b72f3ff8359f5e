//! Cell execution event log.
//!
//! Requests mirrored into a document cell emit `execution_start` and
//! `execution_end` events on the [`CELL_EXECUTION_TARGET`] tracing target so
//! subscribers can filter them apart from the host's diagnostic logs.

use nbrun_protocol::ExecutionResult;

use crate::document::CellTarget;
use crate::record::error_summary;

pub const CELL_EXECUTION_TARGET: &str = "nbrun::cell_execution";

pub fn execution_start(target: &CellTarget, timestamp: &str) {
    tracing::info!(
        target: CELL_EXECUTION_TARGET,
        event_type = "execution_start",
        document_id = %target.document_id,
        cell_id = %target.cell_id,
        timestamp,
    );
}

pub fn execution_end(target: &CellTarget, result: &ExecutionResult, timestamp: &str) {
    let kernel_error = error_summary(&result.outputs);
    tracing::info!(
        target: CELL_EXECUTION_TARGET,
        event_type = "execution_end",
        document_id = %target.document_id,
        cell_id = %target.cell_id,
        success = result.is_ok(),
        kernel_error = %kernel_error,
        timestamp,
    );
}
