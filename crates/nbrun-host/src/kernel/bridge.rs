//! Kernel message bridge.
//!
//! A kernel emits one session-wide stream of messages. The bridge runs a
//! single router task per kernel that reads that stream and demultiplexes it
//! by `parent_header.msg_id` into one event queue per dispatched request.
//! When the kernel channel closes, every request still routed receives a
//! synthesized [`KernelEvent::Disconnected`] so nothing is left orphaned.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nbrun_protocol::message::{CLEAR_OUTPUT, EXECUTE_REPLY, INPUT_REQUEST};
use nbrun_protocol::{
    ErrorInfo, ErrorKind, ExecutionStatus, InputRequest, KernelMessage, MessageHeader, OutputEvent,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::KernelChannel;
use crate::error::BridgeError;
use crate::record::{KernelId, PendingInput, RequestId};

/// One event observed for a dispatched request.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    Output(OutputEvent),
    ClearOutput { wait: bool },
    /// The kernel is blocked on a prompt; execution is still in flight.
    InputRequested(PendingInput),
    /// Terminal `execute_reply`.
    Finished(ExecuteReply),
    /// The channel closed before the reply arrived.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteReply {
    pub status: ExecutionStatus,
    pub execution_count: Option<i64>,
    pub error: Option<ErrorInfo>,
}

impl ExecuteReply {
    pub fn from_content(content: &Value) -> Self {
        let execution_count = content.get("execution_count").and_then(Value::as_i64);
        let status = content
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("error");
        if status == "ok" {
            return Self {
                status: ExecutionStatus::Ok,
                execution_count,
                error: None,
            };
        }
        let error = match (content.get("ename"), content.get("evalue")) {
            (Some(Value::String(ename)), Some(Value::String(evalue))) => Some(ErrorInfo {
                kind: ErrorKind::KernelExecutionError,
                message: format!("{ename}: {evalue}"),
            }),
            _ if status == "aborted" => Some(ErrorInfo {
                kind: ErrorKind::KernelExecutionError,
                message: "execution aborted".into(),
            }),
            _ => None,
        };
        Self {
            status: ExecutionStatus::Error,
            execution_count,
            error,
        }
    }
}

/// Receiving side of one dispatched request.
#[derive(Debug)]
pub struct Execution {
    token: String,
    events: mpsc::UnboundedReceiver<KernelEvent>,
}

impl Execution {
    /// Correlation token: the `msg_id` of the execute request.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Next event; `None` once the route is gone and drained.
    pub async fn next_event(&mut self) -> Option<KernelEvent> {
        self.events.recv().await
    }
}

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<KernelEvent>>>>;

pub struct KernelBridge {
    kernel_id: KernelId,
    outbound: Mutex<Option<mpsc::UnboundedSender<KernelMessage>>>,
    routes: Routes,
    closed: Arc<AtomicBool>,
    router: JoinHandle<()>,
    allow_stdin: bool,
}

impl KernelBridge {
    /// Take ownership of a connected channel and start routing its messages.
    pub fn new(kernel_id: KernelId, channel: KernelChannel, allow_stdin: bool) -> Self {
        let routes: Routes = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let router = tokio::spawn(route_messages(
            kernel_id.clone(),
            channel.inbound,
            routes.clone(),
            closed.clone(),
        ));
        Self {
            kernel_id,
            outbound: Mutex::new(Some(channel.outbound)),
            routes,
            closed,
            router,
            allow_stdin,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send an `execute_request` and subscribe to the messages it produces.
    pub fn dispatch(&self, session: &RequestId, code: &str) -> Result<Execution, BridgeError> {
        let msg = KernelMessage::execute_request(session.as_str(), code, self.allow_stdin);
        let token = msg.header.msg_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.routes.lock();
            // Checked under the routes lock so a concurrent close either sees
            // this route or this call sees the close.
            if self.is_closed() {
                return Err(BridgeError::Closed);
            }
            routes.insert(token.clone(), tx);
        }
        if let Err(err) = self.send(msg) {
            self.routes.lock().remove(&token);
            return Err(err);
        }
        tracing::debug!(
            kernel = %self.kernel_id,
            request = %session,
            token = %token,
            "dispatched execute request"
        );
        Ok(Execution { token, events: rx })
    }

    /// Answer the prompt identified by `prompt_header`.
    pub fn send_input(
        &self,
        prompt_header: &MessageHeader,
        value: &str,
    ) -> Result<(), BridgeError> {
        self.send(KernelMessage::input_reply(prompt_header, value))
    }

    fn send(&self, msg: KernelMessage) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(BridgeError::Closed)?;
        tx.send(msg).map_err(|_| BridgeError::Closed)
    }

    /// Close the outbound side and fail every outstanding request.
    pub fn close(&self) {
        self.outbound.lock().take();
        disconnect_all(&self.kernel_id, &self.routes, &self.closed);
    }
}

impl Drop for KernelBridge {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route_messages(
    kernel_id: KernelId,
    mut inbound: mpsc::UnboundedReceiver<KernelMessage>,
    routes: Routes,
    closed: Arc<AtomicBool>,
) {
    while let Some(msg) = inbound.recv().await {
        let Some(parent) = msg.parent_msg_id().map(str::to_owned) else {
            tracing::trace!(
                kernel = %kernel_id,
                msg_type = msg.msg_type(),
                "message without parent"
            );
            continue;
        };
        let Some(event) = classify(&msg) else {
            continue;
        };
        let terminal = matches!(event, KernelEvent::Finished(_));
        let mut routes = routes.lock();
        match routes.get(&parent) {
            Some(tx) => {
                let _ = tx.send(event);
                if terminal {
                    routes.remove(&parent);
                }
            }
            None => {
                tracing::debug!(
                    kernel = %kernel_id,
                    msg_type = msg.msg_type(),
                    parent = %parent,
                    "dropping message for unknown request"
                );
            }
        }
    }
    tracing::warn!(kernel = %kernel_id, "kernel channel closed");
    disconnect_all(&kernel_id, &routes, &closed);
}

fn disconnect_all(kernel_id: &KernelId, routes: &Routes, closed: &AtomicBool) {
    closed.store(true, Ordering::SeqCst);
    let mut routes = routes.lock();
    if !routes.is_empty() {
        tracing::warn!(
            kernel = %kernel_id,
            outstanding = routes.len(),
            "failing outstanding requests"
        );
    }
    for (_, tx) in routes.drain() {
        let _ = tx.send(KernelEvent::Disconnected);
    }
}

fn classify(msg: &KernelMessage) -> Option<KernelEvent> {
    match msg.msg_type() {
        t if OutputEvent::MESSAGE_TYPES.contains(&t) => match OutputEvent::from_message(msg) {
            Some(output) => Some(KernelEvent::Output(output)),
            None => {
                tracing::warn!(msg_type = t, "malformed output message");
                None
            }
        },
        CLEAR_OUTPUT => Some(KernelEvent::ClearOutput {
            wait: msg
                .content
                .get("wait")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        INPUT_REQUEST => match serde_json::from_value::<InputRequest>(msg.content.clone()) {
            Ok(request) => Some(KernelEvent::InputRequested(PendingInput {
                parent_header: msg.header.clone(),
                request,
            })),
            Err(err) => {
                tracing::warn!("malformed input request: {err}");
                None
            }
        },
        EXECUTE_REPLY => {
            let reply = ExecuteReply::from_content(&msg.content);
            Some(KernelEvent::Finished(reply))
        }
        _ => None,
    }
}
