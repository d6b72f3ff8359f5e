use nbrun_protocol::RequestState;
use thiserror::Error;

use crate::record::{KernelId, RequestId};

/// Structural errors raised synchronously by the execution stack.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("unknown kernel: {0}")]
    UnknownKernel(KernelId),
    #[error("unknown request: {0}")]
    UnknownRequest(RequestId),
    #[error("request {id} is {state:?}, no input is pending")]
    InvalidState { id: RequestId, state: RequestState },
    #[error("no request of kernel {0} is waiting for input")]
    NoPendingInput(KernelId),
    #[error("kernel {0} disconnected")]
    KernelDisconnected(KernelId),
}

/// A kernel spec given on the command line or in the environment is malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("expected NAME=COMMAND, got {0:?}")]
    MissingSeparator(String),
    #[error("kernel spec name is empty")]
    EmptyName,
    #[error("kernel spec {0} has an empty command line")]
    EmptyCommand(String),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("kernel channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown kernel spec: {0}")]
    UnknownSpec(String),
    #[error("unknown kernel: {0}")]
    UnknownKernel(KernelId),
    #[error("kernel spec {0} has an empty command line")]
    EmptyCommand(String),
    #[error("spawn kernel {spec}: {source}")]
    Spawn {
        spec: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("document {0} not found")]
    UnknownDocument(String),
    #[error("cell {cell_id} not found in document {document_id}")]
    UnknownCell {
        document_id: String,
        cell_id: String,
    },
    #[error("cell {cell_id} of document {document_id} is not a code cell")]
    NotCodeCell {
        document_id: String,
        cell_id: String,
    },
}
