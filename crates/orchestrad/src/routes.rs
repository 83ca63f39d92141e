//! API routes for orchestrad
//!
//! Every handler answers with an [`Envelope`]; the HTTP status follows the
//! error code. Actor identity comes from `x-actor-id`, trace id from
//! `x-trace-id`.

use crate::config_store::{redacted, REDACTED};
use crate::server::AppState;
use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use orchestra_common::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::BoxError;
use tracing::{debug, error, warn};

type AppStateArc = Arc<AppState>;

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const TRACE_HEADER: &str = "x-trace-id";

// ============================================================================
// Envelope plumbing
// ============================================================================

/// Envelope plus the HTTP status it is sent with
pub struct ApiReply<T> {
    status: StatusCode,
    envelope: Envelope<T>,
}

impl<T> ApiReply<T> {
    /// 201 instead of 200 on success
    fn created(mut self) -> Self {
        if self.envelope.ok {
            self.status = StatusCode::CREATED;
        }
        self
    }

    fn message(mut self, message: impl Into<String>) -> Self {
        if self.envelope.ok {
            self.envelope = self.envelope.with_message(message);
        }
        self
    }
}

impl<T: Serialize> IntoResponse for ApiReply<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

/// Who is calling, taken from request headers
pub struct RequestContext {
    pub actor: Actor,
    pub trace_id: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header_value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let trace_id = header_value(TRACE_HEADER);
        let actor = match header_value(ACTOR_HEADER) {
            Some(id) if id != "system" => Actor::user(id),
            _ => Actor::system(),
        };
        Self {
            actor: actor.with_trace(trace_id.clone()),
            trace_id,
        }
    }

    fn reply<T>(&self, result: KernelResult<T>) -> ApiReply<T> {
        let status = match &result {
            Ok(_) => StatusCode::OK,
            Err(e) => {
                if e.code() == ErrorCode::Internal {
                    error!("Request failed: {} ({})", e, e.details().unwrap_or("-"));
                } else {
                    debug!("Request rejected: {}", e);
                }
                StatusCode::from_u16(e.code().http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };
        ApiReply {
            status,
            envelope: Envelope::from(result).with_trace(self.trace_id.clone()),
        }
    }
}

/// Failures raised by the middleware stack, answered as envelopes
pub async fn handle_layer_error(err: BoxError) -> ApiReply<()> {
    let kernel_error = if err.is::<tower::timeout::error::Elapsed>() {
        warn!("Request timed out");
        KernelError::ServiceUnavailable("Request timed out".to_string())
    } else {
        KernelError::internal("Request failed", err)
    };
    RequestContext {
        actor: Actor::system(),
        trace_id: None,
    }
    .reply(Err(kernel_error))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> KernelResult<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| KernelError::validation(format!("invalid request body: {}", rejection.body_text())))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> KernelResult<T> {
    query
        .map(|Query(value)| value)
        .map_err(|rejection| KernelError::validation(format!("invalid query: {}", rejection.body_text())))
}

/// An empty body means "all defaults"
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> KernelResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| KernelError::validation(format!("invalid request body: {}", e)))
}

// ============================================================================
// Health Routes
// ============================================================================

pub fn health_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/health", get(liveness))
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/health/check", post(check_all))
        .route("/v1/health/history", get(health_history))
        .route("/v1/health/uptime/:id", get(uptime))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SweepQuery {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    service_id: Option<String>,
    hours: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct HoursQuery {
    hours: Option<u32>,
}

async fn liveness(State(state): State<AppStateArc>, headers: HeaderMap) -> ApiReply<LivenessReport> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.health.get_health_check().await)
}

async fn diagnostics(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
) -> ApiReply<DiagnosticsReport> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.health.get_diagnostics().await)
}

async fn check_all(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    query: Result<Query<SweepQuery>, QueryRejection>,
) -> ApiReply<SystemHealthReport> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let query = query_params(query)?;
        let timeout = query.timeout_ms.map(Duration::from_millis);
        state.kernel.health.check_all_service_health(timeout).await
    }
    .await;
    ctx.reply(result)
}

async fn health_history(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiReply<HealthHistoryPage> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let q = query_params(query)?;
        state
            .kernel
            .history
            .get_health_history(q.service_id, q.hours, q.limit)
            .await
    }
    .await;
    ctx.reply(result)
}

async fn uptime(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
    query: Result<Query<HoursQuery>, QueryRejection>,
) -> ApiReply<UptimeReport> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let q = query_params(query)?;
        state.kernel.history.calculate_uptime(&id, q.hours).await
    }
    .await;
    ctx.reply(result)
}

// ============================================================================
// Service Routes
// ============================================================================

pub fn service_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/services", get(list_services).post(register_service))
        .route(
            "/v1/services/:id",
            get(get_service)
                .patch(update_service)
                .delete(unregister_service),
        )
}

async fn list_services(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
) -> ApiReply<Vec<ServiceSummary>> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.registry.list_services().await)
}

async fn register_service(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    body: Result<Json<RegisterServiceInput>, JsonRejection>,
) -> ApiReply<ServiceRecord> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let input = json_body(body)?;
        state.kernel.registry.register_service(input, &ctx.actor).await
    }
    .await;
    ctx.reply(result).created().message("Service registered")
}

async fn get_service(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiReply<ServiceRecord> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.registry.get_service(&id).await)
}

async fn update_service(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<ServiceMetadataPatch>, JsonRejection>,
) -> ApiReply<ServiceRecord> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let patch = json_body(body)?;
        state
            .kernel
            .registry
            .update_service_metadata(&id, patch, &ctx.actor)
            .await
    }
    .await;
    ctx.reply(result).message("Service updated")
}

async fn unregister_service(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiReply<ServiceRecord> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.registry.unregister_service(&id, &ctx.actor).await)
        .message("Service unregistered")
}

// ============================================================================
// Navigation Routes
// ============================================================================

pub fn nav_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/nav", get(nav_tree))
        .route("/v1/shell/health", get(shell_health))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavQuery {
    user_id: Option<String>,
    /// Comma-separated capability list
    capabilities: Option<String>,
    tenant: Option<String>,
}

impl NavQuery {
    fn user(&self) -> Option<NavUser> {
        let capabilities: Vec<String> = self
            .capabilities
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if self.user_id.is_none() && capabilities.is_empty() {
            return None;
        }
        Some(NavUser {
            id: self.user_id.clone().unwrap_or_else(|| "anonymous".to_string()),
            capabilities,
        })
    }
}

async fn nav_tree(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    query: Result<Query<NavQuery>, QueryRejection>,
) -> ApiReply<NavTree> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let q = query_params(query)?;
        let user = q.user();
        state.kernel.nav.get_nav_tree(user, q.tenant).await
    }
    .await;
    ctx.reply(result)
}

async fn shell_health(State(state): State<AppStateArc>, headers: HeaderMap) -> ApiReply<ShellHealth> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.nav.get_shell_health().await)
}

// ============================================================================
// Config Routes
// ============================================================================

pub fn config_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/config", get(list_configs))
        .route("/v1/config/bulk", post(bulk_set_configs))
        .route(
            "/v1/config/:key",
            get(get_config).put(set_config).delete(delete_config),
        )
        .route("/v1/config/:key/history", get(config_history))
}

#[derive(Debug, Default, Deserialize)]
struct PrefixQuery {
    prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SetConfigBody {
    value: Value,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkSetBody {
    entries: Vec<SetConfigInput>,
}

async fn list_configs(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    query: Result<Query<PrefixQuery>, QueryRejection>,
) -> ApiReply<Vec<ConfigEntry>> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let q = query_params(query)?;
        let entries = state.kernel.config.list_configs(q.prefix.as_deref()).await?;
        Ok::<Vec<ConfigEntry>, KernelError>(entries.into_iter().map(redacted).collect())
    }
    .await;
    ctx.reply(result)
}

async fn get_config(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> ApiReply<ConfigEntry> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.config.get_config(&key).await.map(redacted))
}

async fn set_config(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(key): Path<String>,
    body: Result<Json<SetConfigBody>, JsonRejection>,
) -> ApiReply<ConfigEntry> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let body = json_body(body)?;
        let input = SetConfigInput {
            key,
            value: body.value,
            description: body.description,
        };
        state.kernel.config.set_config(input, &ctx.actor).await
    }
    .await;

    match result {
        Ok(outcome) => {
            let message = outcome.message();
            let created = outcome.created;
            let reply = ctx.reply(Ok(redacted(outcome.entry))).message(message);
            if created {
                reply.created()
            } else {
                reply
            }
        }
        Err(e) => ctx.reply(Err(e)),
    }
}

async fn delete_config(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> ApiReply<ConfigEntry> {
    let ctx = RequestContext::from_headers(&headers);
    let result = state.kernel.config.delete_config(&key, &ctx.actor).await;
    ctx.reply(result.map(redacted)).message("Config deleted")
}

async fn bulk_set_configs(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    body: Result<Json<BulkSetBody>, JsonRejection>,
) -> ApiReply<BulkSetOutcome> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let body = json_body(body)?;
        Ok::<_, KernelError>(
            state
                .kernel
                .config
                .bulk_set_configs(body.entries, &ctx.actor)
                .await,
        )
    }
    .await;
    ctx.reply(result)
}

async fn config_history(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(key): Path<String>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiReply<Vec<ConfigHistoryEntry>> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let q = query_params(query)?;
        let mut history = state.kernel.config.get_config_history(&key, q.limit).await?;
        if is_sensitive_key(&key) {
            for entry in &mut history {
                entry.old_value = Value::String(REDACTED.to_string());
                entry.new_value = Value::String(REDACTED.to_string());
            }
        }
        Ok::<_, KernelError>(history)
    }
    .await;
    ctx.reply(result)
}

// ============================================================================
// Backup Routes
// ============================================================================

pub fn backup_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/backup/trigger", post(trigger_backup))
        .route("/v1/restore/trigger", post(trigger_restore))
        .route(
            "/v1/backup/kernel",
            get(list_kernel_backups).post(create_kernel_backup),
        )
        .route(
            "/v1/backup/kernel/:id",
            get(get_kernel_backup).delete(delete_kernel_backup),
        )
        .route("/v1/backup/kernel/:id/verify", post(verify_kernel_backup))
        .route("/v1/backup/kernel/:id/restore", post(restore_kernel_backup))
        .route(
            "/v1/backup/schedules",
            get(list_schedules).post(create_schedule),
        )
        .route(
            "/v1/backup/schedules/:id",
            get(get_schedule)
                .patch(update_schedule)
                .delete(delete_schedule),
        )
}

async fn trigger_backup(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiReply<FanoutRun> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let request: TriggerBackupRequest = optional_body(&body)?;
        state
            .kernel
            .coordinator
            .trigger_backup(request.service_ids, &ctx.actor)
            .await
    }
    .await;
    ctx.reply(result)
}

async fn trigger_restore(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    body: Result<Json<TriggerRestoreRequest>, JsonRejection>,
) -> ApiReply<FanoutRun> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let request = json_body(body)?;
        state
            .kernel
            .coordinator
            .trigger_restore(&request.backup_id, request.service_ids, &ctx.actor)
            .await
    }
    .await;
    ctx.reply(result)
}

async fn list_kernel_backups(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
) -> ApiReply<Vec<KernelBackupRecord>> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.kernel_backups.list_kernel_backups().await)
}

async fn create_kernel_backup(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
) -> ApiReply<KernelBackupRecord> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.kernel_backups.create_kernel_backup(&ctx.actor).await)
        .created()
        .message("Kernel backup created")
}

async fn get_kernel_backup(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiReply<KernelBackupRecord> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.kernel_backups.get_kernel_backup(&id).await)
}

async fn delete_kernel_backup(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiReply<KernelBackupRecord> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.kernel_backups.delete_kernel_backup(&id).await)
        .message("Kernel backup deleted")
}

async fn verify_kernel_backup(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiReply<KernelBackupVerification> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.kernel_backups.verify_kernel_backup(&id).await)
}

async fn restore_kernel_backup(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiReply<KernelBackupVerification> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(
        state
            .kernel
            .kernel_backups
            .restore_kernel_backup(&id, &ctx.actor)
            .await,
    )
    .message("Kernel backup restored")
}

async fn list_schedules(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
) -> ApiReply<Vec<BackupSchedule>> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.schedules.list_schedules().await)
}

async fn create_schedule(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    body: Result<Json<CreateScheduleInput>, JsonRejection>,
) -> ApiReply<BackupSchedule> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let input = json_body(body)?;
        state.kernel.schedules.create_schedule(input, &ctx.actor).await
    }
    .await;
    ctx.reply(result).created()
}

async fn get_schedule(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiReply<BackupSchedule> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.schedules.get_schedule(&id).await)
}

async fn update_schedule(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<UpdateScheduleInput>, JsonRejection>,
) -> ApiReply<BackupSchedule> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let patch = json_body(body)?;
        state.kernel.schedules.update_schedule(&id, patch).await
    }
    .await;
    ctx.reply(result)
}

async fn delete_schedule(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiReply<BackupSchedule> {
    let ctx = RequestContext::from_headers(&headers);
    ctx.reply(state.kernel.schedules.delete_schedule(&id).await)
}

// ============================================================================
// Audit + Metrics Routes
// ============================================================================

pub fn audit_routes() -> Router<AppStateArc> {
    Router::new().route("/v1/audit", get(list_audit))
}

async fn list_audit(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    query: Result<Query<AuditFilter>, QueryRejection>,
) -> ApiReply<Vec<AuditLogEntry>> {
    let ctx = RequestContext::from_headers(&headers);
    let result = async {
        let filter = query_params(query)?;
        state.kernel.audit.list_entries(filter).await
    }
    .await;
    ctx.reply(result)
}

pub fn metrics_routes() -> Router<AppStateArc> {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics(State(state): State<AppStateArc>) -> Response {
    match state.kernel.metrics.export() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Metrics export failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
