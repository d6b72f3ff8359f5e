//! `/api` routes.
//!
//! The request status route speaks a three-state protocol through the HTTP
//! status code: `202` still running, `300` waiting for input, `200` terminal.
//! A terminal result is handed out once and then forgotten.

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use nbrun_protocol::{
    AcceptedBody, ErrorBody, ExecuteBody, ExecutionResult, HealthBody, InputBody, KernelInfo,
    PendingInputBody, RequestState, RequestSummary, StartKernelBody,
};
use serde::Deserialize;
use utoipa::{OpenApi, ToSchema};

use crate::document::{CellKind, NotebookCell};
use crate::error::{RegistryError, StackError};
use crate::http::HttpState;
use crate::record::{KernelId, RequestId};

pub fn router() -> Router<HttpState> {
    Router::new()
        .route("/health", get(health))
        .route("/kernels", get(list_kernels).post(start_kernel))
        .route("/kernels/{kernel_id}", delete(shutdown_kernel))
        .route("/kernels/{kernel_id}/execute", post(execute))
        .route("/kernels/{kernel_id}/input", post(kernel_input))
        .route("/kernels/{kernel_id}/requests", get(kernel_requests))
        .route("/kernels/{kernel_id}/requests/{uid}", get(request_status))
        .route(
            "/kernels/{kernel_id}/requests/{uid}/input",
            post(request_input),
        )
        .route("/documents/{document_id}/cells", get(list_cells))
        .route(
            "/documents/{document_id}/cells/{cell_id}",
            get(get_cell).put(put_cell),
        )
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "nbrun",
        description = "Queued code execution against long-lived kernels"
    ),
    paths(
        health,
        list_kernels,
        start_kernel,
        shutdown_kernel,
        execute,
        request_status,
        request_input,
        kernel_input,
        kernel_requests,
        list_cells,
        get_cell,
        put_cell,
    )
)]
struct ApiDoc;

pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

pub fn request_location(kernel_id: &KernelId, id: &RequestId) -> String {
    format!("/api/kernels/{kernel_id}/requests/{id}")
}

#[derive(Debug)]
pub enum ApiError {
    Stack(StackError),
    Registry(RegistryError),
    UnknownDocument(String),
    UnknownCell {
        document_id: String,
        cell_id: String,
    },
    Invalid(String),
}

impl From<StackError> for ApiError {
    fn from(err: StackError) -> Self {
        ApiError::Stack(err)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        ApiError::Registry(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        ApiError::Invalid(err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Stack(err) => err.to_string(),
            ApiError::Registry(err) => err.to_string(),
            ApiError::UnknownDocument(document_id) => format!("document {document_id} not found"),
            ApiError::UnknownCell {
                document_id,
                cell_id,
            } => format!("cell {cell_id} not found in document {document_id}"),
            ApiError::Invalid(msg) => msg.clone(),
        };
        let (status, code) = match self {
            ApiError::Stack(err) => match err {
                StackError::UnknownKernel(_) => (StatusCode::NOT_FOUND, "unknown_kernel"),
                StackError::UnknownRequest(_) => (StatusCode::NOT_FOUND, "unknown_request"),
                StackError::InvalidState { .. } | StackError::NoPendingInput(_) => {
                    (StatusCode::CONFLICT, "invalid_state")
                }
                StackError::KernelDisconnected(_) => (StatusCode::CONFLICT, "kernel_disconnected"),
            },
            ApiError::Registry(err) => match err {
                RegistryError::UnknownSpec(_) => (StatusCode::NOT_FOUND, "unknown_kernel_spec"),
                RegistryError::UnknownKernel(_) => (StatusCode::NOT_FOUND, "unknown_kernel"),
                RegistryError::EmptyCommand(_) | RegistryError::Spawn { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "kernel_start_failed")
                }
            },
            ApiError::UnknownDocument(_) => (StatusCode::NOT_FOUND, "unknown_document"),
            ApiError::UnknownCell { .. } => (StatusCode::NOT_FOUND, "unknown_cell"),
            ApiError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        };
        let body = ErrorBody {
            code: code.into(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Host is up", body = HealthBody))
)]
async fn health(State(state): State<HttpState>) -> Json<HealthBody> {
    Json(HealthBody {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        kernels: state.kernels.len(),
    })
}

#[utoipa::path(
    get,
    path = "/api/kernels",
    responses((status = 200, description = "Attached kernels", body = Vec<KernelInfo>))
)]
async fn list_kernels(State(state): State<HttpState>) -> Json<Vec<KernelInfo>> {
    Json(state.kernels.list())
}

#[utoipa::path(
    post,
    path = "/api/kernels",
    request_body = StartKernelBody,
    responses(
        (status = 201, description = "Kernel started", body = KernelInfo),
        (status = 404, description = "No kernel spec with that name", body = ErrorBody),
    )
)]
async fn start_kernel(
    State(state): State<HttpState>,
    body: Result<Json<StartKernelBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let kernel_id = state.kernels.start(&body.name)?;
    let info = state
        .kernels
        .info(&kernel_id)
        .ok_or(RegistryError::UnknownKernel(kernel_id))?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[utoipa::path(
    delete,
    path = "/api/kernels/{kernel_id}",
    params(("kernel_id" = String, Path)),
    responses(
        (status = 204, description = "Kernel shut down"),
        (status = 404, description = "Unknown kernel", body = ErrorBody),
    )
)]
async fn shutdown_kernel(
    State(state): State<HttpState>,
    Path(kernel_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.kernels.shutdown(&KernelId::new(kernel_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/kernels/{kernel_id}/execute",
    params(("kernel_id" = String, Path)),
    request_body = ExecuteBody,
    responses(
        (status = 202, description = "Queued; poll the Location header", body = AcceptedBody),
        (status = 400, description = "Malformed body", body = ErrorBody),
        (status = 404, description = "Unknown or dead kernel", body = ErrorBody),
    )
)]
async fn execute(
    State(state): State<HttpState>,
    Path(kernel_id): Path<String>,
    body: Result<Json<ExecuteBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let kernel_id = KernelId::new(kernel_id);
    let id = state.stack.submit(&kernel_id, body.code, body.metadata)?;
    let location = request_location(&kernel_id, &id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(AcceptedBody {
            uid: id.to_string(),
        }),
    )
        .into_response())
}

#[utoipa::path(
    get,
    path = "/api/kernels/{kernel_id}/requests/{uid}",
    params(("kernel_id" = String, Path), ("uid" = String, Path)),
    responses(
        (status = 200, description = "Terminal result, returned once", body = ExecutionResult),
        (status = 202, description = "Still running"),
        (status = 300, description = "Waiting for input", body = PendingInputBody),
        (status = 404, description = "Unknown request", body = ErrorBody),
    )
)]
async fn request_status(
    State(state): State<HttpState>,
    Path((kernel_id, uid)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let kernel_id = KernelId::new(kernel_id);
    let id = RequestId::from(uid);
    let snapshot = state.stack.retrieve(&kernel_id, &id)?;
    if let Some(result) = snapshot.result {
        return Ok((StatusCode::OK, Json(result)).into_response());
    }
    let response = match (snapshot.state, snapshot.pending_input) {
        (RequestState::PendingInput, Some(pending)) => {
            let location = format!("{}/input", request_location(&kernel_id, &id));
            (
                StatusCode::MULTIPLE_CHOICES,
                [(header::LOCATION, location)],
                Json(pending.to_body()),
            )
                .into_response()
        }
        _ => (StatusCode::ACCEPTED, Json(serde_json::json!({}))).into_response(),
    };
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/api/kernels/{kernel_id}/requests/{uid}/input",
    params(("kernel_id" = String, Path), ("uid" = String, Path)),
    request_body = InputBody,
    responses(
        (status = 200, description = "Input delivered"),
        (status = 404, description = "Unknown request", body = ErrorBody),
        (status = 409, description = "No input is pending", body = ErrorBody),
    )
)]
async fn request_input(
    State(state): State<HttpState>,
    Path((kernel_id, uid)): Path<(String, String)>,
    body: Result<Json<InputBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = body?;
    let id = RequestId::from(uid);
    let snapshot = state.stack.poll(&id)?;
    if snapshot.kernel_id.as_str() != kernel_id {
        return Err(StackError::UnknownRequest(id).into());
    }
    state.stack.submit_input(&id, &body.input)?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    post,
    path = "/api/kernels/{kernel_id}/input",
    params(("kernel_id" = String, Path)),
    request_body = InputBody,
    responses(
        (status = 200, description = "Input delivered"),
        (
            status = 409,
            description = "No request of this kernel is waiting for input",
            body = ErrorBody
        ),
    )
)]
async fn kernel_input(
    State(state): State<HttpState>,
    Path(kernel_id): Path<String>,
    body: Result<Json<InputBody>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(body) = body?;
    state
        .stack
        .submit_kernel_input(&KernelId::new(kernel_id), &body.input)?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    get,
    path = "/api/kernels/{kernel_id}/requests",
    params(("kernel_id" = String, Path)),
    responses((
        status = 200,
        description = "Retained requests in submission order",
        body = Vec<RequestSummary>
    ))
)]
async fn kernel_requests(
    State(state): State<HttpState>,
    Path(kernel_id): Path<String>,
) -> Json<Vec<RequestSummary>> {
    Json(state.stack.kernel_requests(&KernelId::new(kernel_id)))
}

#[utoipa::path(
    get,
    path = "/api/documents/{document_id}/cells",
    params(("document_id" = String, Path)),
    responses(
        (status = 200, description = "Cells of the document in order", body = Vec<NotebookCell>),
        (status = 404, description = "Unknown document", body = ErrorBody),
    )
)]
async fn list_cells(
    State(state): State<HttpState>,
    Path(document_id): Path<String>,
) -> Result<Json<Vec<NotebookCell>>, ApiError> {
    state
        .documents
        .cells(&document_id)
        .map(Json)
        .ok_or(ApiError::UnknownDocument(document_id))
}

#[utoipa::path(
    get,
    path = "/api/documents/{document_id}/cells/{cell_id}",
    params(("document_id" = String, Path), ("cell_id" = String, Path)),
    responses(
        (status = 200, description = "Cell model", body = NotebookCell),
        (status = 404, description = "Unknown document or cell", body = ErrorBody),
    )
)]
async fn get_cell(
    State(state): State<HttpState>,
    Path((document_id, cell_id)): Path<(String, String)>,
) -> Result<Json<NotebookCell>, ApiError> {
    state
        .documents
        .cell(&document_id, &cell_id)
        .map(Json)
        .ok_or(ApiError::UnknownCell {
            document_id,
            cell_id,
        })
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PutCellBody {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub cell_type: CellKind,
}

#[utoipa::path(
    put,
    path = "/api/documents/{document_id}/cells/{cell_id}",
    params(("document_id" = String, Path), ("cell_id" = String, Path)),
    request_body = PutCellBody,
    responses((status = 200, description = "Cell created or replaced", body = NotebookCell))
)]
async fn put_cell(
    State(state): State<HttpState>,
    Path((document_id, cell_id)): Path<(String, String)>,
    body: Result<Json<PutCellBody>, JsonRejection>,
) -> Result<Json<NotebookCell>, ApiError> {
    let Json(body) = body?;
    let cell = NotebookCell::new(cell_id, body.cell_type, body.source);
    state.documents.upsert_cell(&document_id, cell.clone());
    Ok(Json(cell))
}
