use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts, Multipart, Path, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use recon_core::InitOutcome;
use recon_model::{NodeId, NodeRecord, TaskDescriptor, TaskId};
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, handler::ApiHandler};

/// Port assumed for a registering node that does not name one.
pub const DEFAULT_NODE_PORT: u16 = 8080;

/// HTTP API service builder.
pub struct HttpApi<H> {
    handler: Arc<H>,
}

impl<H> HttpApi<H>
where
    H: ApiHandler,
{
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Build the axum router with every node endpoint mounted.
    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(health::<H>))
            .route(
                "/task/init/{kind}/{task}/{name}/{priority}",
                get(init_task::<H>),
            )
            .route("/task/status/{task}", get(task_status::<H>))
            .route("/task/stop/{task}", get(stop_task::<H>))
            .route("/task/end/{task}", get(stop_task::<H>))
            .route("/task/finish/{task}/{node}", get(node_finished::<H>))
            .route("/task/fail/{task}/{node}", get(node_failed::<H>))
            .route("/task/process/{task}/{node}/{seq}", get(process_upload::<H>))
            .route("/register/{token}", get(register::<H>))
            .route("/unregister/{token}", get(unregister::<H>))
            .route("/nodes", get(list_nodes::<H>))
            .route("/image/{task}", post(intake_image::<H>))
            .with_state(self.handler)
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct InitQuery {
    node: Option<String>,
    #[serde(default)]
    replace: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FailQuery {
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RegisterQuery {
    address: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ImageQuery {
    node: String,
    seq: u32,
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    relayed: bool,
    status: u16,
}

#[derive(Debug, Serialize)]
struct NodesResponse {
    nodes: Vec<NodeRecord>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /
async fn health<H: ApiHandler>(State(handler): State<Arc<H>>) -> impl IntoResponse {
    Json(handler.health())
}

/// GET /task/init/{kind}/{task}/{name}/{priority}
async fn init_task<H: ApiHandler>(
    State(handler): State<Arc<H>>,
    Path((kind, task, name, priority)): Path<(String, String, String, String)>,
    Query(q): Query<InitQuery>,
) -> Result<Response, ApiError> {
    let descriptor = TaskDescriptor::new(TaskId::parse(task)?, kind, name, priority);
    let node = q.node.map(NodeId::parse).transpose()?;

    let outcome = handler.init_task(descriptor, node, q.replace).await?;
    let status = match &outcome {
        InitOutcome::Dispatched(report)
            if !report.value.nodes.is_empty() && report.value.succeeded() == 0 =>
        {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

/// GET /task/status/{task}
async fn task_status<H: ApiHandler>(
    State(handler): State<Arc<H>>,
    Path(task): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = handler.task_status(&TaskId::parse(task)?).await?;
    Ok(Json(record))
}

/// GET /task/stop/{task}, GET /task/end/{task}
async fn stop_task<H: ApiHandler>(
    State(handler): State<Arc<H>>,
    Path(task): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = handler.stop_task(&TaskId::parse(task)?).await?;
    Ok(Json(report))
}

/// GET /task/finish/{task}/{node}
async fn node_finished<H: ApiHandler>(
    State(handler): State<Arc<H>>,
    Path((task, node)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = handler
        .node_finished(&TaskId::parse(task)?, &NodeId::parse(node)?)
        .await?;
    Ok(Json(outcome))
}

/// GET /task/fail/{task}/{node}
async fn node_failed<H: ApiHandler>(
    State(handler): State<Arc<H>>,
    Path((task, node)): Path<(String, String)>,
    Query(q): Query<FailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = q.reason.unwrap_or_else(|| "node failure".to_string());
    let outcome = handler
        .node_failed(&TaskId::parse(task)?, &NodeId::parse(node)?, &reason)
        .await?;
    Ok(Json(outcome))
}

/// GET /task/process/{task}/{node}/{seq}
async fn process_upload<H: ApiHandler>(
    State(handler): State<Arc<H>>,
    Path((task, node, seq)): Path<(String, String, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    let status = handler
        .process_upload(&TaskId::parse(task)?, &NodeId::parse(node)?, seq)
        .await?;
    Ok(Json(ProcessResponse {
        relayed: true,
        status,
    }))
}

/// GET /register/{token}
async fn register<H: ApiHandler>(
    State(handler): State<Arc<H>>,
    Path(token): Path<String>,
    Query(q): Query<RegisterQuery>,
    request: Request,
) -> Result<impl IntoResponse, ApiError> {
    let address = caller_address(q, peer_of(request).await)?;
    let record = handler.register(&token, &address).await?;
    Ok(Json(record))
}

/// GET /unregister/{token}
async fn unregister<H: ApiHandler>(
    State(handler): State<Arc<H>>,
    Path(token): Path<String>,
    Query(q): Query<RegisterQuery>,
    request: Request,
) -> Result<impl IntoResponse, ApiError> {
    let address = caller_address(q, peer_of(request).await)?;
    let record = handler.unregister(&token, &address).await?;
    Ok(Json(record))
}

/// GET /nodes
async fn list_nodes<H: ApiHandler>(
    State(handler): State<Arc<H>>,
) -> Result<impl IntoResponse, ApiError> {
    let nodes = handler.nodes().await?;
    Ok(Json(NodesResponse { nodes }))
}

/// POST /image/{task}
async fn intake_image<H: ApiHandler>(
    State(handler): State<Arc<H>>,
    Path(task): Path<String>,
    Query(q): Query<ImageQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let task = TaskId::parse(task)?;
    let node = NodeId::parse(q.node)?;

    let mut payload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    {
        if field.name() == Some("image") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
            payload = Some(bytes.to_vec());
            break;
        }
    }
    let payload = payload
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("missing multipart part 'image'".into()))?;

    let receipt = handler.intake_image(&task, &node, q.seq, payload).await?;
    Ok(Json(receipt))
}

// ============================================================================
// Helpers
// ============================================================================

async fn peer_of(request: Request) -> Option<SocketAddr> {
    let (mut parts, _) = request.into_parts();
    ConnectInfo::<SocketAddr>::from_request_parts(&mut parts, &())
        .await
        .ok()
        .map(|ConnectInfo(addr)| addr)
}

/// Resolve the address a node registers under: an explicit `address`
/// (with or without scheme), else the connecting peer's IP.
fn caller_address(q: RegisterQuery, peer: Option<SocketAddr>) -> Result<String, ApiError> {
    let port = q.port.unwrap_or(DEFAULT_NODE_PORT);
    match q.address {
        Some(address) if address.contains("://") => Ok(address),
        Some(host) if host.contains(':') => Ok(format!("http://{host}")),
        Some(host) => Ok(format!("http://{host}:{port}")),
        None => peer
            .map(|p| format!("http://{}", SocketAddr::new(p.ip(), port)))
            .ok_or_else(|| {
                ApiError::InvalidRequest("caller address unknown, pass ?address=".into())
            }),
    }
}
