//! In-memory notebook documents, the built-in [`DocumentSink`].

use std::collections::HashMap;

use async_trait::async_trait;
use nbrun_protocol::{ExecutionStatus, OutputEvent};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use super::{CellEvent, CellTarget, DocumentSink};
use crate::error::SinkError;

const EXECUTION_METADATA: &str = "execution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    #[default]
    Code,
    Markdown,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CellExecutionState {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NotebookCell {
    pub id: String,
    pub cell_type: CellKind,
    pub source: String,
    pub execution_count: Option<i64>,
    pub execution_state: CellExecutionState,
    #[schema(value_type = Object)]
    pub metadata: Map<String, Value>,
    pub outputs: Vec<OutputEvent>,
    /// Set by `clear_output(wait=true)`; outputs are cleared on the next one.
    #[serde(skip)]
    clear_pending: bool,
}

impl NotebookCell {
    pub fn new(id: impl Into<String>, cell_type: CellKind, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cell_type,
            source: source.into(),
            execution_count: None,
            execution_state: CellExecutionState::Idle,
            metadata: Map::new(),
            outputs: Vec::new(),
            clear_pending: false,
        }
    }

    pub fn code(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(id, CellKind::Code, source)
    }

    fn start(&mut self, record_timing: bool, at: &str) {
        self.outputs.clear();
        self.clear_pending = false;
        self.execution_count = None;
        self.execution_state = CellExecutionState::Running;
        self.metadata.remove(EXECUTION_METADATA);
        if record_timing {
            let mut timing = Map::new();
            timing.insert("shell.execute_reply.started".into(), at.into());
            // Read by the execute-time frontend extension.
            timing.insert("iopub.execute_input".into(), at.into());
            self.metadata
                .insert(EXECUTION_METADATA.into(), Value::Object(timing));
        }
    }

    fn finish(
        &mut self,
        execution_count: Option<i64>,
        status: ExecutionStatus,
        record_timing: bool,
        at: &str,
    ) {
        self.execution_count = execution_count;
        self.execution_state = CellExecutionState::Idle;
        if record_timing {
            let key = match status {
                ExecutionStatus::Ok => "shell.execute_reply",
                ExecutionStatus::Error => "execution_failed",
            };
            let timing = self
                .metadata
                .entry(EXECUTION_METADATA)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(timing) = timing {
                timing.insert(key.into(), at.into());
            }
        }
    }

    fn clear(&mut self, wait: bool) {
        if wait {
            self.clear_pending = true;
        } else {
            self.outputs.clear();
            self.clear_pending = false;
        }
    }

    fn append(&mut self, output: OutputEvent) {
        if std::mem::take(&mut self.clear_pending) {
            self.outputs.clear();
        }
        let OutputEvent::Stream { name, text } = output else {
            self.outputs.push(output);
            return;
        };
        match self.outputs.last_mut() {
            Some(OutputEvent::Stream {
                name: last_name,
                text: last_text,
            }) if *last_name == name => {
                last_text.push_str(&text);
                if last_text.contains(['\r', '\u{8}']) {
                    *last_text = normalize_terminal_text(last_text);
                }
            }
            _ => self.outputs.push(OutputEvent::Stream {
                name,
                text: normalize_terminal_text(&text),
            }),
        }
    }
}

/// Render `text` the way a terminal would display it.
///
/// A trailing carriage return is kept so the next chunk overwrites the line.
pub fn normalize_terminal_text(text: &str) -> String {
    match text.strip_suffix('\r') {
        Some(body) => {
            let mut normalized = handle_carriage_return(&handle_backspace(body));
            normalized.push('\r');
            normalized
        }
        None => handle_carriage_return(&handle_backspace(text)),
    }
}

/// Apply backspaces, which never cross a line boundary.
pub fn handle_backspace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\u{8}' {
            if !matches!(out.chars().last(), None | Some('\n') | Some('\r')) {
                out.pop();
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Apply carriage returns: each `\r` rewinds to the start of the line and
/// the following characters overwrite what is there.
pub fn handle_carriage_return(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let mut segments = line.split('\r');
            let mut current: Vec<char> = segments.next().unwrap_or_default().chars().collect();
            for segment in segments {
                for (i, c) in segment.chars().enumerate() {
                    match current.get_mut(i) {
                        Some(slot) => *slot = c,
                        None => current.push(c),
                    }
                }
            }
            current.into_iter().collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Documents keyed by id, each an ordered list of cells.
#[derive(Debug, Default)]
pub struct NotebookStore {
    documents: RwLock<HashMap<String, Vec<NotebookCell>>>,
}

impl NotebookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `cell`, replacing the cell with the same id. Creates the
    /// document when missing.
    pub fn upsert_cell(&self, document_id: &str, cell: NotebookCell) {
        let mut documents = self.documents.write();
        let cells = documents.entry(document_id.to_string()).or_default();
        match cells.iter_mut().find(|existing| existing.id == cell.id) {
            Some(existing) => *existing = cell,
            None => cells.push(cell),
        }
    }

    pub fn cell(&self, document_id: &str, cell_id: &str) -> Option<NotebookCell> {
        self.documents
            .read()
            .get(document_id)?
            .iter()
            .find(|cell| cell.id == cell_id)
            .cloned()
    }

    pub fn cells(&self, document_id: &str) -> Option<Vec<NotebookCell>> {
        self.documents.read().get(document_id).cloned()
    }

    fn with_code_cell<R>(
        &self,
        target: &CellTarget,
        f: impl FnOnce(&mut NotebookCell) -> R,
    ) -> Result<R, SinkError> {
        let mut documents = self.documents.write();
        let cells = documents
            .get_mut(&target.document_id)
            .ok_or_else(|| SinkError::UnknownDocument(target.document_id.clone()))?;
        let cell = cells
            .iter_mut()
            .find(|cell| cell.id == target.cell_id)
            .ok_or_else(|| SinkError::UnknownCell {
                document_id: target.document_id.clone(),
                cell_id: target.cell_id.clone(),
            })?;
        if cell.cell_type != CellKind::Code {
            return Err(SinkError::NotCodeCell {
                document_id: target.document_id.clone(),
                cell_id: target.cell_id.clone(),
            });
        }
        Ok(f(cell))
    }
}

#[async_trait]
impl DocumentSink for NotebookStore {
    async fn push(&self, target: &CellTarget, event: CellEvent) -> Result<(), SinkError> {
        self.with_code_cell(target, |cell| match event {
            CellEvent::ExecutionStarted { record_timing, at } => cell.start(record_timing, &at),
            CellEvent::Output(output) => cell.append(output),
            CellEvent::ClearOutput { wait } => cell.clear(wait),
            CellEvent::ExecutionFinished {
                execution_count,
                status,
                record_timing,
                at,
            } => cell.finish(execution_count, status, record_timing, &at),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store_with_cell() -> (NotebookStore, CellTarget) {
        let store = NotebookStore::new();
        store.upsert_cell("doc", NotebookCell::code("c1", "print(1)"));
        (store, CellTarget::new("doc", "c1"))
    }

    fn started(record_timing: bool) -> CellEvent {
        CellEvent::ExecutionStarted {
            record_timing,
            at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn backspace_stops_at_line_start() {
        assert_eq!(handle_backspace("abc\u{8}d"), "abd");
        assert_eq!(handle_backspace("a\n\u{8}b"), "a\nb");
        assert_eq!(handle_backspace("\u{8}\u{8}x"), "x");
    }

    #[test]
    fn carriage_return_overwrites_line_prefix() {
        assert_eq!(handle_carriage_return("10%\r20%"), "20%");
        assert_eq!(handle_carriage_return("hello\rHi"), "Hillo");
        assert_eq!(handle_carriage_return("a\rb\nc\rd"), "b\nd");
    }

    #[test]
    fn trailing_carriage_return_is_kept() {
        assert_eq!(normalize_terminal_text("1\r2\r"), "2\r");
    }

    #[tokio::test]
    async fn progress_bar_stream_collapses() {
        let (store, target) = store_with_cell();
        store.push(&target, started(false)).await.unwrap();
        for chunk in ["0%\r", "50%\r", "100%\n"] {
            let event = CellEvent::Output(OutputEvent::stream("stdout", chunk));
            store.push(&target, event).await.unwrap();
        }
        let cell = store.cell("doc", "c1").unwrap();
        assert_eq!(cell.outputs, vec![OutputEvent::stream("stdout", "100%\n")]);
    }

    #[tokio::test]
    async fn streams_of_different_names_do_not_merge() {
        let (store, target) = store_with_cell();
        for output in [
            OutputEvent::stream("stdout", "a\n"),
            OutputEvent::stream("stdout", "b\n"),
            OutputEvent::stream("stderr", "oops\n"),
        ] {
            let event = CellEvent::Output(output);
            store.push(&target, event).await.unwrap();
        }
        let cell = store.cell("doc", "c1").unwrap();
        assert_eq!(
            cell.outputs,
            vec![
                OutputEvent::stream("stdout", "a\nb\n"),
                OutputEvent::stream("stderr", "oops\n"),
            ]
        );
    }

    #[tokio::test]
    async fn lifecycle_resets_and_records_timing() {
        let (store, target) = store_with_cell();
        let stale = CellEvent::Output(OutputEvent::stream("stdout", "stale"));
        store.push(&target, stale).await.unwrap();
        store.push(&target, started(true)).await.unwrap();
        let running = store.cell("doc", "c1").unwrap();
        assert!(running.outputs.is_empty());
        assert_eq!(running.execution_state, CellExecutionState::Running);
        assert_eq!(
            running.metadata["execution"]["shell.execute_reply.started"],
            json!("2026-01-01T00:00:00.000Z")
        );

        let finished = CellEvent::ExecutionFinished {
            execution_count: Some(4),
            status: ExecutionStatus::Error,
            record_timing: true,
            at: "2026-01-01T00:00:01.000Z".into(),
        };
        store.push(&target, finished).await.unwrap();
        let done = store.cell("doc", "c1").unwrap();
        assert_eq!(done.execution_count, Some(4));
        assert_eq!(done.execution_state, CellExecutionState::Idle);
        let timing = done.metadata["execution"].as_object().unwrap();
        assert!(timing.contains_key("execution_failed"));
        assert!(!timing.contains_key("shell.execute_reply"));
    }

    #[tokio::test]
    async fn clear_output_wait_defers_until_next_output() {
        let (store, target) = store_with_cell();
        let out = |text: &str| CellEvent::Output(OutputEvent::stream("stdout", text));
        store.push(&target, out("old\n")).await.unwrap();
        store
            .push(&target, CellEvent::ClearOutput { wait: true })
            .await
            .unwrap();
        assert_eq!(store.cell("doc", "c1").unwrap().outputs.len(), 1);
        store.push(&target, out("new\n")).await.unwrap();
        assert_eq!(
            store.cell("doc", "c1").unwrap().outputs,
            vec![OutputEvent::stream("stdout", "new\n")]
        );
        store
            .push(&target, CellEvent::ClearOutput { wait: false })
            .await
            .unwrap();
        assert!(store.cell("doc", "c1").unwrap().outputs.is_empty());
    }

    #[tokio::test]
    async fn unknown_targets_are_reported() {
        let (store, _) = store_with_cell();
        store.upsert_cell("doc", NotebookCell::new("md", CellKind::Markdown, "# hi"));
        assert!(matches!(
            store.push(&CellTarget::new("nope", "c1"), started(false)).await,
            Err(SinkError::UnknownDocument(_))
        ));
        assert!(matches!(
            store.push(&CellTarget::new("doc", "c9"), started(false)).await,
            Err(SinkError::UnknownCell { .. })
        ));
        assert!(matches!(
            store.push(&CellTarget::new("doc", "md"), started(false)).await,
            Err(SinkError::NotCodeCell { .. })
        ));
    }
}
