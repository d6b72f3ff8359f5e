//! nbrun host: queued code execution against long-lived kernels.
//!
//! Callers submit snippets over HTTP and poll for results; the
//! [`ExecutionStack`] runs them one at a time per kernel, in submission
//! order, through a [`KernelBridge`](kernel::KernelBridge).

pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod http;
pub mod kernel;
pub mod record;
pub mod stack;

pub mod testkernel;

pub use config::{HostConfig, HttpServerConfig, KernelSpec};
pub use document::{CellEvent, CellTarget, DocumentSink, NotebookStore, NullSink};
pub use error::{BridgeError, RegistryError, SinkError, SpecError, StackError};
pub use kernel::{KernelChannel, KernelManager, KernelRegistry};
pub use record::{KernelId, RequestId, RequestRecord, RequestSnapshot};
pub use stack::ExecutionStack;
