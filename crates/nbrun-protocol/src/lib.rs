//! Wire types shared by the nbrun host and its clients.
//!
//! Two protocols meet here:
//! - the kernel message protocol (Jupyter-shaped `header` / `parent_header` /
//!   `content` envelopes exchanged with a running kernel), see [`message`];
//! - the HTTP polling protocol spoken by remote callers, see [`http`].
//!
//! Notebook output events ([`OutputEvent`]) are common to both.

pub mod http;
pub mod message;
pub mod output;

pub use http::{
    AcceptedBody, ErrorBody, ErrorInfo, ErrorKind, ExecuteBody, ExecutionResult, ExecutionStatus,
    HealthBody, InputBody, KernelInfo, PendingInputBody, RequestMetadata, RequestState,
    RequestSummary, StartKernelBody,
};
pub use message::{Channel, KernelMessage, MessageHeader, now_timestamp};
pub use output::{InputRequest, OutputEvent};
