//! ---
//! kpg_section: "04-http-interface"
//! kpg_subsection: "module"
//! kpg_type: "source"
//! kpg_scope: "code"
//! kpg_description: "HTTP JSON API over the control plane."
//! kpg_version: "v0.1.0"
//! kpg_owner: "tbd"
//! ---

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use kpg_common::DEFAULT_CLUSTER_ID;
use kpg_core::{
    BrokerState, BrokerStatus, Cluster, ClusterStatus, ControlPlane, ControlPlaneError,
    ProvisionedBroker, RemovedBroker, TopicInfo, TopicSpec, ValidationReport,
};
use kpg_metrics::SharedRegistry;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const DEFAULT_TOPIC_PARTITIONS: i32 = 3;
const DEFAULT_REPLICATION_FACTOR: i32 = 1;

/// Shared API state exposed to handlers.
pub struct ApiState {
    plane: Arc<ControlPlane>,
    metrics: Option<SharedRegistry>,
}

impl ApiState {
    pub fn new(plane: Arc<ControlPlane>, metrics: Option<SharedRegistry>) -> Self {
        Self { plane, metrics }
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

fn routes() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/healthz", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/clusters", get(get_clusters).post(post_cluster))
        .route("/clusters/:id", delete(delete_cluster))
        .route("/cluster/status", get(get_cluster_status))
        .route("/cluster/reset", post(post_reset))
        .route("/cluster/start", post(post_cluster_start))
        .route("/cluster/stop", post(post_cluster_stop))
        .route("/config/validate", get(get_validate))
        .route("/brokers/add", post(post_broker_add))
        .route("/brokers/:name", get(get_broker).delete(delete_broker))
        .route("/brokers/:name/start", post(post_broker_start))
        .route("/brokers/:name/stop", post(post_broker_stop))
        .route("/topics/list", get(get_topics))
        .route("/topics/create", post(post_topic))
        .route("/topics/delete/:name", delete(delete_topic))
}

/// Router serving every route at the root and again under `/api`.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .merge(routes())
        .nest("/api", routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve the API until [`ApiServer::shutdown`] is called.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let local = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let app = router(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %local, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %local, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr: local,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Every JSON response carries `success`; payload fields sit beside it.
#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn ok<T: Serialize>(body: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        body,
    })
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: &'static str,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }
}

fn status_for(err: &ControlPlaneError) -> StatusCode {
    match err.root() {
        ControlPlaneError::InvalidClusterName { .. }
        | ControlPlaneError::InvalidTopicSpec(_)
        | ControlPlaneError::CannotDeleteDefault => StatusCode::BAD_REQUEST,
        ControlPlaneError::NotFound(_)
        | ControlPlaneError::ClusterNotFound(_)
        | ControlPlaneError::TopicNotFound(_) => StatusCode::NOT_FOUND,
        ControlPlaneError::DuplicateCluster(_) | ControlPlaneError::TopicAlreadyExists(_) => {
            StatusCode::CONFLICT
        }
        ControlPlaneError::RuntimeUnavailable(_) | ControlPlaneError::AdminUnreachable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ControlPlaneError::PortSpaceExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
        ControlPlaneError::MalformedDescription(_)
        | ControlPlaneError::StepFailed { .. }
        | ControlPlaneError::CascadeIncomplete { .. }
        | ControlPlaneError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            warn!(error = %err, status = status.as_u16(), "control operation failed");
        }
        Self {
            status,
            code: err.root().code(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            success: false,
            error: self.message,
            code: self.code,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<Envelope<T>>, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct ClusterQuery {
    cluster_id: Option<String>,
}

impl ClusterQuery {
    fn cluster_id(&self) -> &str {
        self.cluster_id.as_deref().unwrap_or(DEFAULT_CLUSTER_ID)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClusterSelector {
    cluster_id: Option<String>,
}

impl ClusterSelector {
    /// An empty body selects nothing; any other body must be valid JSON.
    fn from_body(headers: &HeaderMap, body: &Bytes) -> std::result::Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        if !has_json_content_type(headers) {
            return Err(ApiError::bad_request(
                "Expected request with `Content-Type: application/json`",
            ));
        }
        let Json(selector) = Json::<Self>::from_bytes(body)?;
        Ok(selector)
    }
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    let Some(mime) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
    else {
        return false;
    };
    let mime = mime.trim().to_ascii_lowercase();
    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}

#[derive(Debug, Deserialize)]
struct CreateClusterRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CreateTopicRequest {
    cluster_id: Option<String>,
    name: String,
    #[serde(default = "default_partitions")]
    partitions: i32,
    #[serde(default = "default_replication_factor")]
    replication_factor: i32,
}

fn default_partitions() -> i32 {
    DEFAULT_TOPIC_PARTITIONS
}

fn default_replication_factor() -> i32 {
    DEFAULT_REPLICATION_FACTOR
}

#[derive(Debug, Serialize)]
struct ClusterSummary {
    id: String,
    name: String,
    brokers: usize,
    broker_names: Vec<String>,
    bootstrap_servers: Vec<String>,
    discovered: bool,
}

impl From<Cluster> for ClusterSummary {
    fn from(cluster: Cluster) -> Self {
        Self {
            brokers: cluster.brokers.len(),
            broker_names: cluster.broker_names(),
            id: cluster.id,
            name: cluster.name,
            bootstrap_servers: cluster.bootstrap_servers,
            discovered: cluster.discovered,
        }
    }
}

#[derive(Debug, Serialize)]
struct ClustersBody {
    clusters: BTreeMap<String, ClusterSummary>,
}

#[derive(Debug, Serialize)]
struct ClusterBody {
    cluster: ClusterSummary,
}

#[derive(Debug, Serialize)]
struct ClusterDeletedBody {
    message: String,
    removed_brokers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ActionsBody {
    actions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StartedBody {
    started: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StoppedBody {
    stopped: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BrokerBody<T> {
    broker: T,
}

#[derive(Debug, Serialize)]
struct BrokerTransition {
    name: String,
    state: BrokerState,
}

#[derive(Debug, Serialize)]
struct TopicsBody {
    topics: Vec<TopicInfo>,
}

#[derive(Debug, Serialize)]
struct MessageBody {
    message: String,
}

async fn get_health() -> &'static str {
    "ok"
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Response {
    let Some(registry) = &state.metrics else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics registry unavailable",
        )
            .into_response();
    };
    match kpg_metrics::render(registry) {
        Ok((body, content_type)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_clusters(State(state): State<Arc<ApiState>>) -> ApiResult<ClustersBody> {
    let clusters = state
        .plane
        .list_clusters()?
        .into_iter()
        .map(|cluster| (cluster.id.clone(), ClusterSummary::from(cluster)))
        .collect();
    Ok(ok(ClustersBody { clusters }))
}

async fn post_cluster(
    State(state): State<Arc<ApiState>>,
    payload: std::result::Result<Json<CreateClusterRequest>, JsonRejection>,
) -> ApiResult<ClusterBody> {
    let Json(request) = payload?;
    let cluster = state.plane.create_cluster(&request.name).await?;
    Ok(ok(ClusterBody {
        cluster: cluster.into(),
    }))
}

async fn delete_cluster(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<ClusterDeletedBody> {
    let deletion = state.plane.delete_cluster(&id).await?;
    Ok(ok(ClusterDeletedBody {
        message: format!("Cluster {} deleted", deletion.cluster_id),
        removed_brokers: deletion.removed_brokers,
    }))
}

async fn get_cluster_status(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ClusterQuery>,
) -> ApiResult<ClusterStatus> {
    Ok(ok(state.plane.cluster_status(query.cluster_id()).await?))
}

async fn post_reset(State(state): State<Arc<ApiState>>) -> ApiResult<ActionsBody> {
    let actions = state.plane.reset().await?;
    Ok(ok(ActionsBody { actions }))
}

async fn post_cluster_start(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StartedBody> {
    let selector = ClusterSelector::from_body(&headers, &body)?;
    let started = state
        .plane
        .start_cluster(selector.cluster_id.as_deref())
        .await?;
    Ok(ok(StartedBody { started }))
}

async fn post_cluster_stop(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StoppedBody> {
    let selector = ClusterSelector::from_body(&headers, &body)?;
    let stopped = state
        .plane
        .stop_cluster(selector.cluster_id.as_deref())
        .await?;
    Ok(ok(StoppedBody { stopped }))
}

async fn get_validate(State(state): State<Arc<ApiState>>) -> ApiResult<ValidationReport> {
    Ok(ok(state.plane.validate_config().await?))
}

async fn post_broker_add(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<BrokerBody<ProvisionedBroker>> {
    let selector = ClusterSelector::from_body(&headers, &body)?;
    let cluster_id = selector.cluster_id.as_deref().unwrap_or(DEFAULT_CLUSTER_ID);
    let broker = state.plane.add_broker(cluster_id).await?;
    Ok(ok(BrokerBody { broker }))
}

async fn get_broker(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<BrokerBody<BrokerStatus>> {
    let broker = state.plane.broker_status(&name).await?;
    Ok(ok(BrokerBody { broker }))
}

async fn post_broker_start(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<BrokerBody<BrokerTransition>> {
    let state_after = state.plane.start_broker(&name).await?;
    Ok(ok(BrokerBody {
        broker: BrokerTransition {
            name,
            state: state_after,
        },
    }))
}

async fn post_broker_stop(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<BrokerBody<BrokerTransition>> {
    let state_after = state.plane.stop_broker(&name).await?;
    Ok(ok(BrokerBody {
        broker: BrokerTransition {
            name,
            state: state_after,
        },
    }))
}

async fn delete_broker(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> ApiResult<BrokerBody<RemovedBroker>> {
    let broker = state.plane.delete_broker(&name).await?;
    Ok(ok(BrokerBody { broker }))
}

async fn get_topics(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ClusterQuery>,
) -> ApiResult<TopicsBody> {
    let topics = state.plane.list_topics(query.cluster_id()).await?;
    Ok(ok(TopicsBody { topics }))
}

async fn post_topic(
    State(state): State<Arc<ApiState>>,
    payload: std::result::Result<Json<CreateTopicRequest>, JsonRejection>,
) -> ApiResult<MessageBody> {
    let Json(request) = payload?;
    let cluster_id = request.cluster_id.as_deref().unwrap_or(DEFAULT_CLUSTER_ID);
    let spec = TopicSpec {
        name: request.name.clone(),
        partitions: request.partitions,
        replication_factor: request.replication_factor,
    };
    state.plane.create_topic(cluster_id, &spec).await?;
    Ok(ok(MessageBody {
        message: format!("Topic {} created", request.name),
    }))
}

async fn delete_topic(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Query(query): Query<ClusterQuery>,
) -> ApiResult<MessageBody> {
    state.plane.delete_topic(query.cluster_id(), &name).await?;
    Ok(ok(MessageBody {
        message: format!("Topic {name} deleted"),
    }))
}
