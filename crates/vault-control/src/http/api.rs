use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use utoipa::OpenApi;
use vault_protocol::api::{
    ApiErrorBody, FieldError, FleetStatusReport, HealthReport, KindStatusDetail, KindSyncStatus,
    LedgerHealth, NodeReachability, NodeStatusDetail, NotificationView, PublishOutcome,
    PublishSummary, QueueResponse, RecoverySummary, Severity, SyncOverview, TaskSource,
};

use crate::drift::RecoveryError;
use crate::error::ControlError;
use crate::http::HttpState;
use crate::publisher::PublishResult;
use crate::scheduler::{Task, TaskError, TaskHandle, TaskOutput};

pub fn router() -> Router<HttpState> {
    Router::new()
        .route("/health", get(health))
        .route("/queue/sync-all", post(sync_all))
        .route("/queue/publish/{kind}", post(publish_kind))
        .route("/queue/publish-tenant/{tenant}", post(publish_tenant))
        .route("/queue/poll", post(poll))
        .route("/queue/recover", post(recover))
        .route("/sync/overview", get(sync_overview))
        .route("/sync/{kind}", get(sync_kind))
        .route("/lm/status", get(lm_status))
        .route("/notifications", get(notifications))
        .route("/notifications/{id}/ack", post(acknowledge))
}

#[derive(OpenApi)]
#[openapi(
    info(title = "vault-control", version = env!("CARGO_PKG_VERSION")),
    paths(
        health,
        sync_all,
        publish_kind,
        publish_tenant,
        poll,
        recover,
        sync_overview,
        sync_kind,
        lm_status,
        notifications,
        acknowledge,
    ),
    components(schemas(
        ApiErrorBody,
        FieldError,
        HealthReport,
        LedgerHealth,
        QueueResponse,
        PublishSummary,
        PublishOutcome,
        TaskSource,
        SyncOverview,
        KindSyncStatus,
        NodeReachability,
        FleetStatusReport,
        NodeStatusDetail,
        KindStatusDetail,
        RecoverySummary,
        NotificationView,
        Severity,
    )),
    tags(
        (name = "queue", description = "Publish and poll triggers"),
        (name = "sync", description = "Fleet convergence"),
        (name = "ops", description = "Health and notifications"),
    )
)]
struct ApiDoc;

pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

#[derive(Debug)]
pub enum ApiError {
    /// Rejected before reaching the scheduler.
    Invalid(Vec<FieldError>),
    Control(ControlError),
}

impl ApiError {
    fn field(field: &str, message: impl Into<String>) -> Self {
        ApiError::Invalid(vec![FieldError {
            field: field.to_string(),
            message: message.into(),
        }])
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::InvalidKind(invalid) => ApiError::field("kind", invalid.to_string()),
            other => ApiError::Control(other),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        ApiError::Control(err.into())
    }
}

fn classify(err: &ControlError) -> (StatusCode, &'static str) {
    match err {
        ControlError::InvalidKind(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        ControlError::UnknownKind(_) => (StatusCode::NOT_FOUND, "unknown_kind"),
        ControlError::UnknownNotification(_) => (StatusCode::NOT_FOUND, "unknown_notification"),
        ControlError::RecoveryFailed(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "drift_recovery_failed")
        }
        ControlError::Recovery(RecoveryError::Disabled(_)) => {
            (StatusCode::CONFLICT, "recovery_disabled")
        }
        ControlError::Recovery(_) | ControlError::Task(TaskError::Fatal(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "drift_recovery_failed")
        }
        ControlError::Task(_) => (StatusCode::INTERNAL_SERVER_ERROR, "task_failed"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Invalid(fields) => (
                StatusCode::BAD_REQUEST,
                ApiErrorBody {
                    code: "invalid_request".into(),
                    message: "request validation failed".into(),
                    fields,
                },
            ),
            ApiError::Control(err) => {
                let (status, code) = classify(&err);
                if status.is_server_error() {
                    tracing::error!(code, "request failed: {err}");
                }
                (
                    status,
                    ApiErrorBody {
                        code: code.into(),
                        message: err.to_string(),
                        fields: Vec::new(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    source: Option<String>,
    #[serde(rename = "async")]
    run_async: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueParams {
    source: TaskSource,
    run_async: bool,
}

impl QueueQuery {
    fn validate(&self) -> Result<QueueParams, ApiError> {
        let mut errors = Vec::new();
        let source = match self.source.as_deref() {
            None => TaskSource::Interactive,
            Some(raw) => raw.parse().unwrap_or_else(|message| {
                errors.push(FieldError {
                    field: "source".into(),
                    message,
                });
                TaskSource::Interactive
            }),
        };
        let run_async = parse_flag("async", self.run_async.as_deref(), &mut errors);
        if errors.is_empty() {
            Ok(QueueParams { source, run_async })
        } else {
            Err(ApiError::Invalid(errors))
        }
    }
}

fn parse_flag(field: &str, raw: Option<&str>, errors: &mut Vec<FieldError>) -> bool {
    match raw {
        None | Some("") | Some("false") | Some("0") => false,
        Some("true") | Some("1") => true,
        Some(other) => {
            errors.push(FieldError {
                field: field.into(),
                message: format!("expected true or false, got '{other}'"),
            });
            false
        }
    }
}

fn accepted(handle: &TaskHandle) -> Response {
    let body = QueueResponse {
        task: handle.key.clone(),
        source: handle.source,
        created: handle.created,
        completed: false,
        results: None,
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

async fn completed(handle: TaskHandle) -> Result<Response, ApiError> {
    let task = handle.key.clone();
    let source = handle.source;
    let created = handle.created;
    let results = match handle.wait().await? {
        TaskOutput::Published(results) => {
            Some(results.iter().map(PublishResult::summary).collect())
        }
        TaskOutput::Polled(_) => None,
    };
    let body = QueueResponse {
        task,
        source,
        created,
        completed: true,
        results,
    };
    Ok(Json(body).into_response())
}

async fn dispatch(state: &HttpState, task: Task, query: &QueueQuery) -> Result<Response, ApiError> {
    let params = query.validate()?;
    let handle = state.control.enqueue(task, params.source);
    if params.run_async {
        Ok(accepted(&handle))
    } else {
        completed(handle).await
    }
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "ops",
    responses((status = 200, body = HealthReport))
)]
async fn health(State(state): State<HttpState>) -> Result<Json<HealthReport>, ApiError> {
    Ok(Json(state.control.health_report()?))
}

#[utoipa::path(
    post,
    path = "/queue/sync-all",
    tag = "queue",
    params(
        ("source" = Option<String>, Query, description = "interactive, periodic or internal"),
        ("async" = Option<bool>, Query, description = "Return 202 without waiting"),
    ),
    responses(
        (status = 200, body = QueueResponse),
        (status = 202, body = QueueResponse),
        (status = 400, body = ApiErrorBody),
        (status = 500, body = ApiErrorBody),
    )
)]
async fn sync_all(
    State(state): State<HttpState>,
    Query(query): Query<QueueQuery>,
) -> Result<Response, ApiError> {
    dispatch(&state, Task::PublishAll, &query).await
}

#[utoipa::path(
    post,
    path = "/queue/publish/{kind}",
    tag = "queue",
    params(
        ("kind" = String, Path, description = "Configuration kind"),
        ("source" = Option<String>, Query, description = "interactive, periodic or internal"),
        ("async" = Option<bool>, Query, description = "Return 202 without waiting"),
    ),
    responses(
        (status = 200, body = QueueResponse),
        (status = 202, body = QueueResponse),
        (status = 400, body = ApiErrorBody),
        (status = 404, body = ApiErrorBody),
    )
)]
async fn publish_kind(
    State(state): State<HttpState>,
    Path(kind): Path<String>,
    Query(query): Query<QueueQuery>,
) -> Result<Response, ApiError> {
    let params = query.validate()?;
    let kind = state.control.resolve_kind(&kind)?;
    if params.run_async {
        let handle = state.control.request_publish(&kind, params.source)?;
        return Ok(accepted(&handle));
    }
    let result = state.control.request_publish_await(&kind, params.source).await?;
    // Every call records a new change request, joined task or not.
    let body = QueueResponse {
        task: Task::Publish(kind).dedup_key(),
        source: params.source,
        created: true,
        completed: true,
        results: Some(vec![result.summary()]),
    };
    Ok(Json(body).into_response())
}

#[utoipa::path(
    post,
    path = "/queue/publish-tenant/{tenant}",
    tag = "queue",
    params(
        ("tenant" = String, Path, description = "Tenant whose state changed"),
        ("source" = Option<String>, Query, description = "interactive, periodic or internal"),
        ("async" = Option<bool>, Query, description = "Return 202 without waiting"),
    ),
    responses(
        (status = 200, body = QueueResponse),
        (status = 202, body = QueueResponse),
        (status = 400, body = ApiErrorBody),
    )
)]
async fn publish_tenant(
    State(state): State<HttpState>,
    Path(tenant): Path<String>,
    Query(query): Query<QueueQuery>,
) -> Result<Response, ApiError> {
    let tenant = tenant.trim();
    if tenant.is_empty() {
        return Err(ApiError::field("tenant", "must not be empty"));
    }
    dispatch(&state, Task::PublishForTenant(tenant.to_string()), &query).await
}

#[utoipa::path(
    post,
    path = "/queue/poll",
    tag = "queue",
    params(
        ("source" = Option<String>, Query, description = "interactive, periodic or internal"),
        ("async" = Option<bool>, Query, description = "Return 202 without waiting"),
    ),
    responses(
        (status = 200, body = QueueResponse),
        (status = 202, body = QueueResponse),
        (status = 503, body = ApiErrorBody),
    )
)]
async fn poll(
    State(state): State<HttpState>,
    Query(query): Query<QueueQuery>,
) -> Result<Response, ApiError> {
    dispatch(&state, Task::PollFleet, &query).await
}

#[utoipa::path(
    post,
    path = "/queue/recover",
    tag = "queue",
    responses(
        (status = 200, body = RecoverySummary),
        (status = 409, description = "Recovery disabled", body = ApiErrorBody),
        (status = 503, body = ApiErrorBody),
    )
)]
async fn recover(State(state): State<HttpState>) -> Result<Json<RecoverySummary>, ApiError> {
    let outcome = state.control.recover_now().await?;
    Ok(Json(outcome.summary()))
}

#[utoipa::path(
    get,
    path = "/sync/overview",
    tag = "sync",
    responses(
        (status = 200, body = SyncOverview),
        (status = 503, description = "Drift recovery failed", body = ApiErrorBody),
    )
)]
async fn sync_overview(State(state): State<HttpState>) -> Result<Json<SyncOverview>, ApiError> {
    Ok(Json(state.control.sync_overview()?))
}

#[utoipa::path(
    get,
    path = "/sync/{kind}",
    tag = "sync",
    params(("kind" = String, Path, description = "Configuration kind")),
    responses(
        (status = 200, body = KindSyncStatus),
        (status = 400, body = ApiErrorBody),
        (status = 404, body = ApiErrorBody),
    )
)]
async fn sync_kind(
    State(state): State<HttpState>,
    Path(kind): Path<String>,
) -> Result<Json<KindSyncStatus>, ApiError> {
    let kind = state.control.resolve_kind(&kind)?;
    Ok(Json(state.control.sync_status(&kind)?))
}

#[utoipa::path(
    get,
    path = "/lm/status",
    tag = "sync",
    responses((status = 200, body = FleetStatusReport))
)]
async fn lm_status(State(state): State<HttpState>) -> Result<Json<FleetStatusReport>, ApiError> {
    Ok(Json(state.control.fleet_status()?))
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationsQuery {
    all: Option<String>,
}

#[utoipa::path(
    get,
    path = "/notifications",
    tag = "ops",
    params(("all" = Option<bool>, Query, description = "Include acknowledged records")),
    responses(
        (status = 200, body = [NotificationView]),
        (status = 400, body = ApiErrorBody),
    )
)]
async fn notifications(
    State(state): State<HttpState>,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<Vec<NotificationView>>, ApiError> {
    let mut errors = Vec::new();
    let include_acknowledged = parse_flag("all", query.all.as_deref(), &mut errors);
    if !errors.is_empty() {
        return Err(ApiError::Invalid(errors));
    }
    Ok(Json(state.control.notifications(include_acknowledged)?))
}

#[utoipa::path(
    post,
    path = "/notifications/{id}/ack",
    tag = "ops",
    params(("id" = i64, Path, description = "Notification id")),
    responses(
        (status = 204, description = "Acknowledged"),
        (status = 400, body = ApiErrorBody),
        (status = 404, body = ApiErrorBody),
    )
)]
async fn acknowledge(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: i64 = id
        .parse()
        .map_err(|_| ApiError::field("id", format!("expected an integer, got '{id}'")))?;
    state.control.acknowledge(id)?;
    Ok(StatusCode::NO_CONTENT)
}
