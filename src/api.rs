use std::sync::Arc;

use axum::{
    Router,
    extract::{
        FromRequest, FromRequestParts, Path, Query, Request, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, de::DeserializeOwned};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    Error,
    clients::{health::HealthChecker, smtp::SmtpConnector},
    dispatcher::DispatchQueue,
    metrics::Metrics,
    models::{
        notification::{ChannelRequest, ChannelType, NewNotification, NotificationFilter, Priority},
        response::{ApiResponse, PageRequest},
        schedule::ScheduledNotification,
        status::NotificationStatus,
        validation,
    },
    pipeline::{NotificationService, SubmitOutcome},
    pool::ConnectionPool,
    scheduler::Scheduler,
    trace::TraceContext,
};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const TRACE_HEADER: &str = "x-trace-id";

pub struct AppState {
    pub service: Arc<NotificationService>,
    pub scheduler: Arc<Scheduler>,
    pub health_checker: HealthChecker,
    pub metrics: Arc<Metrics>,
    pub queue: Arc<DispatchQueue>,
    pub smtp_pool: Option<ConnectionPool<SmtpConnector>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/notifications", post(submit_notification).get(list_notifications))
        .route(
            "/notifications/{id}",
            get(get_notification).delete(delete_notification),
        )
        .route("/notifications/{id}/restore", post(restore_notification))
        .route("/notifications/{id}/feedback", post(record_feedback))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{id}", get(get_dead_letter))
        .route("/dead-letters/{id}/retry", post(retry_dead_letter))
        .route("/schedules", post(create_schedule))
        .route("/schedules/{id}", delete(delete_schedule))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(
    port: u16,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::DuplicateIdempotencyKey { .. }
            | Error::Conflict(_)
            | Error::OptimisticLockConflict { .. }
            | Error::InvalidStateTransition { .. }
            | Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::TransientDelivery(_) | Error::PermanentDelivery(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }

        let body = ApiResponse::<()>::error(self.0.to_string(), "Request failed".to_string());
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Tenant taken from the `x-tenant-id` header.
pub struct Tenant(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        validation::validate_tenant_id(&tenant_id)?;
        Ok(Tenant(tenant_id))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(Error::validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(Error::validation(rejection.body_text()))
    }
}

/// `Json` whose rejection is rendered as an [`ApiResponse`].
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// `Path` whose rejection is rendered as an [`ApiResponse`].
pub struct ApiPath<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// `Query` whose rejection is rendered as an [`ApiResponse`].
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

fn trace_for(header: Option<&str>) -> TraceContext {
    match header {
        Some(trace_id) if !trace_id.is_empty() => TraceContext::new(trace_id),
        _ => TraceContext::root(),
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health_checker.check_all().await;

    let status_code = if report.status.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(report))
}

async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    state.metrics.queue_depth.set(state.queue.len() as i64);
    if let Some(pool) = &state.smtp_pool {
        state.metrics.record_pool(&pool.stats());
    }

    let body = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    priority: Priority,
    #[serde(flatten)]
    request: ChannelRequest,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

async fn submit_notification(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    headers: axum::http::HeaderMap,
    ApiJson(body): ApiJson<SubmitRequest>,
) -> ApiResult<impl IntoResponse> {
    let new = NewNotification {
        tenant_id,
        priority: body.priority,
        request: body.request,
        idempotency_key: body.idempotency_key,
        scheduled_for: body.scheduled_for,
        expires_at: body.expires_at,
    };

    let trace = trace_for(headers.get(TRACE_HEADER).and_then(|v| v.to_str().ok()));
    let outcome = trace.scope(state.service.submit(new)).await?;

    let response = match outcome {
        SubmitOutcome::Accepted(n) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(n, "Notification accepted".to_string())),
        ),
        SubmitOutcome::Duplicate(n) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                n,
                "Notification already submitted with this idempotency key".to_string(),
            )),
        ),
    };

    Ok(response)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    page: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
    #[serde(default)]
    status: Option<NotificationStatus>,
    #[serde(default)]
    channel: Option<ChannelType>,
    #[serde(default)]
    recipient: Option<String>,
}

impl ListQuery {
    fn page_request(&self) -> PageRequest {
        let defaults = PageRequest::default();
        PageRequest::new(
            self.page.unwrap_or(defaults.page),
            self.limit.unwrap_or(defaults.limit),
        )
    }
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = NotificationFilter {
        status: query.status,
        channel: query.channel,
        recipient: query.recipient.clone(),
    };

    let page = state
        .service
        .repository()
        .list(&tenant_id, &filter, query.page_request())
        .await?;
    let meta = page.meta();

    Ok(Json(
        ApiResponse::success(page.items, "Notifications retrieved".to_string()).with_meta(meta),
    ))
}

async fn get_notification(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let notification = state.service.repository().find_by_id(&tenant_id, id).await?;
    Ok(Json(ApiResponse::success(
        notification,
        "Notification retrieved".to_string(),
    )))
}

#[derive(Debug, Deserialize)]
struct VersionQuery {
    version: i64,
}

async fn delete_notification(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<VersionQuery>,
) -> ApiResult<impl IntoResponse> {
    let deleted = TraceContext::root()
        .scope(
            state
                .service
                .repository()
                .soft_delete(&tenant_id, id, query.version),
        )
        .await?;

    Ok(Json(ApiResponse::success(
        deleted,
        "Notification deleted".to_string(),
    )))
}

async fn restore_notification(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<VersionQuery>,
) -> ApiResult<impl IntoResponse> {
    let restored = TraceContext::root()
        .scope(
            state
                .service
                .repository()
                .restore(&tenant_id, id, query.version),
        )
        .await?;

    Ok(Json(ApiResponse::success(
        restored,
        "Notification restored".to_string(),
    )))
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    status: NotificationStatus,
}

async fn record_feedback(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<FeedbackRequest>,
) -> ApiResult<impl IntoResponse> {
    let updated = TraceContext::root()
        .scope(state.service.record_feedback(&tenant_id, id, body.status))
        .await?;

    Ok(Json(ApiResponse::success(
        updated,
        "Feedback recorded".to_string(),
    )))
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let page = state
        .service
        .dead_letters()
        .list(&tenant_id, query.page_request())
        .await?;
    let meta = page.meta();

    Ok(Json(
        ApiResponse::success(page.items, "Dead letters retrieved".to_string()).with_meta(meta),
    ))
}

async fn get_dead_letter(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let entry = state.service.dead_letters().get(&tenant_id, id).await?;
    Ok(Json(ApiResponse::success(
        entry,
        "Dead letter retrieved".to_string(),
    )))
}

async fn retry_dead_letter(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let sent = TraceContext::root()
        .scope(state.service.retry_dead_letter(&tenant_id, id))
        .await?;

    Ok(Json(ApiResponse::success(
        sent,
        "Dead letter replayed".to_string(),
    )))
}

async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiJson(mut schedule): ApiJson<ScheduledNotification>,
) -> ApiResult<impl IntoResponse> {
    schedule.tenant_id = tenant_id;
    state.scheduler.add(schedule.clone())?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(
            schedule,
            "Schedule registered".to_string(),
        )),
    ))
}

async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Tenant(tenant_id): Tenant,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.scheduler.remove(&tenant_id, id)?;
    Ok(Json(ApiResponse::success(id, "Schedule removed".to_string())))
}
