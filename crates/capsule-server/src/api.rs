use std::sync::Arc;

use axum::{
    extract::{
        multipart::MultipartError, DefaultBodyLimit, FromRequestParts, Multipart, Path, Query,
        State,
    },
    http::{header, request::Parts, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use capsule_core::{
    CapsuleChanges, CapsuleContent, CapsuleService, DashboardStats, NewCapsule,
    NotificationCenter, OpenedCapsule, ScanReport, SchedulerStatus, UnlockOutcome,
    UnlockScheduler,
};
use capsule_shared::{CapsuleId, ContentKind, Recipient, UserId};
use capsule_store::{Capsule, CapsuleState, Notification};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ServerError;

/// Header set by the upstream auth gateway with the caller's user id.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CapsuleService>,
    pub scheduler: Arc<UnlockScheduler>,
    pub notifications: NotificationCenter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Multipart framing and text fields ride on top of the payload itself.
    let body_limit = state.config.max_payload_size.saturating_add(1024 * 1024);

    Router::new()
        .route("/health", get(health_check))
        .route("/capsules", post(create_capsule).get(list_capsules))
        .route(
            "/capsules/:id",
            get(get_capsule).put(update_capsule).delete(delete_capsule),
        )
        .route("/capsules/:id/unlock", post(unlock_capsule))
        .route("/capsules/:id/download", get(download_capsule))
        .route("/capsules/:id/preview", get(preview_capsule))
        .route("/dashboard", get(dashboard))
        .route("/dashboard/stats", get(dashboard_stats))
        .route("/dashboard/upcoming", get(dashboard_upcoming))
        .route("/dashboard/unlocked", get(dashboard_unlocked))
        .route("/notifications", get(list_notifications))
        .route("/notifications/:id/read", post(mark_notification_read))
        .route("/admin/scheduler", get(admin_scheduler_status))
        .route("/admin/scheduler/run", post(admin_scheduler_run))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The authenticated caller, from [`USER_HEADER`].
pub struct CurrentUser(pub UserId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ServerError::Unauthorized(format!("Missing {USER_HEADER} header")))?;

        Ok(CurrentUser(UserId::from(user)))
    }
}

// ─── Response bodies ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Capsule metadata as shown to clients. The nonce and payload reference
/// stay server-side.
#[derive(Serialize)]
struct CapsuleView {
    id: CapsuleId,
    owner_id: UserId,
    recipient: Recipient,
    unlock_at: DateTime<Utc>,
    state: CapsuleState,
    unlocked_at: Option<DateTime<Utc>>,
    description: Option<String>,
    filename: String,
    content_kind: ContentKind,
    original_size: i64,
    created_at: DateTime<Utc>,
}

impl From<&Capsule> for CapsuleView {
    fn from(c: &Capsule) -> Self {
        Self {
            id: c.id,
            owner_id: c.owner_id.clone(),
            recipient: c.recipient.clone(),
            unlock_at: c.unlock_at,
            state: c.state,
            unlocked_at: c.unlocked_at,
            description: c.description.clone(),
            filename: c.filename.clone(),
            content_kind: c.content_kind,
            original_size: c.original_size,
            created_at: c.created_at,
        }
    }
}

#[derive(Serialize)]
struct UnlockResponse {
    status: &'static str,
    capsule: CapsuleView,
}

#[derive(Serialize)]
struct PreviewResponse {
    capsule: CapsuleView,
    content_type: &'static str,
    /// Base64-encoded plaintext.
    data: String,
}

#[derive(Serialize)]
struct DashboardResponse {
    user_id: UserId,
    statistics: DashboardStats,
    locked_capsules: Vec<CapsuleView>,
    unlocked_capsules: Vec<CapsuleView>,
    upcoming_unlocks: Vec<CapsuleView>,
}

#[derive(Serialize)]
struct CapsuleListResponse {
    capsules: Vec<CapsuleView>,
    count: usize,
}

impl CapsuleListResponse {
    fn new(capsules: &[Capsule]) -> Self {
        Self {
            capsules: views(capsules),
            count: capsules.len(),
        }
    }
}

fn views(capsules: &[Capsule]) -> Vec<CapsuleView> {
    capsules.iter().map(CapsuleView::from).collect()
}

#[derive(Deserialize, Default)]
struct ListQuery {
    #[serde(default)]
    unlocked: bool,
}

#[derive(Deserialize, Default)]
struct NotificationQuery {
    #[serde(default)]
    unread: bool,
}

// ─── Multipart form ───

/// Fields accepted by create and update. Empty text fields count as absent,
/// except `description`, where an empty value clears it on update.
#[derive(Default)]
struct CapsuleForm {
    recipient_id: Option<String>,
    recipient_email: Option<String>,
    unlock_at: Option<String>,
    description: Option<String>,
    message: Option<String>,
    file: Option<(String, Vec<u8>)>,
}

impl CapsuleForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ServerError> {
        let mut form = Self::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(multipart_error)?
        {
            let name = field.name().unwrap_or("").to_string();
            if name == "file" {
                let filename = field.file_name().unwrap_or("").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(multipart_error)?;
                if !filename.is_empty() {
                    form.file = Some((filename, data.to_vec()));
                }
                continue;
            }

            let text = field
                .text()
                .await
                .map_err(multipart_error)?;
            if name == "message" {
                form.message = (!text.trim().is_empty()).then_some(text);
                continue;
            }

            let value = text.trim().to_string();
            match name.as_str() {
                "recipient_id" => form.recipient_id = non_empty(value),
                "recipient_email" => form.recipient_email = non_empty(value),
                "unlock_at" => form.unlock_at = non_empty(value),
                "description" => form.description = Some(value),
                _ => {}
            }
        }

        Ok(form)
    }

    fn recipient(&self) -> Result<Option<Recipient>, ServerError> {
        match (&self.recipient_id, &self.recipient_email) {
            (Some(_), Some(_)) => Err(ServerError::BadRequest(
                "Provide either recipient_id or recipient_email, not both".into(),
            )),
            (Some(id), None) => Ok(Some(Recipient::User(UserId(id.clone())))),
            (None, Some(email)) => Ok(Some(Recipient::Email(email.clone()))),
            (None, None) => Ok(None),
        }
    }

    fn unlock_at(&self) -> Result<Option<DateTime<Utc>>, ServerError> {
        self.unlock_at.as_deref().map(parse_unlock_at).transpose()
    }

    /// A file wins over a message when both are sent.
    fn take_content(&mut self) -> Option<CapsuleContent> {
        if let Some((filename, bytes)) = self.file.take() {
            return Some(CapsuleContent::File { filename, bytes });
        }
        self.message.take().map(CapsuleContent::Message)
    }
}

/// Keeps the body-limit rejection as 413; anything else is a malformed form.
fn multipart_error(e: MultipartError) -> ServerError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge(e.body_text())
    } else {
        ServerError::BadRequest(format!("Multipart error: {}", e.body_text()))
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// RFC 3339 timestamp, or a bare `YYYY-MM-DD` date meaning midnight UTC.
fn parse_unlock_at(value: &str) -> Result<DateTime<Utc>, ServerError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| ServerError::BadRequest(format!("Invalid unlock_at: {value}")))
}

// ─── Handlers ───

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn create_capsule(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    multipart: Multipart,
) -> Result<(StatusCode, Json<CapsuleView>), ServerError> {
    let mut form = CapsuleForm::read(multipart).await?;
    let unlock_at = form
        .unlock_at()?
        .ok_or_else(|| ServerError::BadRequest("unlock_at is required".into()))?;

    let new = NewCapsule {
        recipient: form.recipient()?,
        unlock_at,
        description: form.description.take().and_then(non_empty),
        content: form.take_content(),
    };

    let capsule = state.service.create(&user, new, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(CapsuleView::from(&capsule))))
}

async fn list_capsules(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<CapsuleView>>, ServerError> {
    let capsules = state.service.list(&user, query.unlocked).await?;
    Ok(Json(views(&capsules)))
}

async fn get_capsule(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<CapsuleId>,
) -> Result<Json<CapsuleView>, ServerError> {
    let capsule = state.service.get(&user, id).await?;
    Ok(Json(CapsuleView::from(&capsule)))
}

async fn update_capsule(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<CapsuleId>,
    multipart: Multipart,
) -> Result<Json<CapsuleView>, ServerError> {
    let mut form = CapsuleForm::read(multipart).await?;
    let changes = CapsuleChanges {
        description: form.description.take().map(non_empty),
        unlock_at: form.unlock_at()?,
        content: form.take_content(),
    };

    let capsule = state.service.update(&user, id, changes, Utc::now()).await?;
    Ok(Json(CapsuleView::from(&capsule)))
}

async fn delete_capsule(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<CapsuleId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.service.delete(&user, id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn unlock_capsule(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<CapsuleId>,
) -> Result<Json<UnlockResponse>, ServerError> {
    match state.service.unlock(&user, id, Utc::now()).await? {
        UnlockOutcome::Unlocked { capsule, .. } => Ok(Json(UnlockResponse {
            status: "unlocked",
            capsule: CapsuleView::from(&capsule),
        })),
        UnlockOutcome::AlreadyUnlocked { capsule } => Ok(Json(UnlockResponse {
            status: "already_unlocked",
            capsule: CapsuleView::from(&capsule),
        })),
        UnlockOutcome::NotYetDue { unlock_at } => Err(ServerError::NotYetDue { unlock_at }),
    }
}

fn attachment(opened: OpenedCapsule) -> impl IntoResponse {
    let filename = opened.capsule.filename.replace(['"', '\r', '\n'], "");
    (
        [
            (header::CONTENT_TYPE, opened.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        opened.plaintext,
    )
}

async fn download_capsule(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<CapsuleId>,
) -> Result<impl IntoResponse, ServerError> {
    let opened = state.service.download(&user, id).await?;
    info!(capsule = %id, user = %user, "Capsule downloaded");
    Ok(attachment(opened))
}

async fn preview_capsule(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<CapsuleId>,
) -> Result<Json<PreviewResponse>, ServerError> {
    let opened = state.service.preview(&user, id).await?;
    Ok(Json(PreviewResponse {
        capsule: CapsuleView::from(&opened.capsule),
        content_type: opened.content_type,
        data: STANDARD.encode(&opened.plaintext),
    }))
}

async fn dashboard(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<DashboardResponse>, ServerError> {
    let dashboard = state.service.dashboard(&user, Utc::now()).await?;
    Ok(Json(DashboardResponse {
        user_id: user,
        locked_capsules: views(&dashboard.locked),
        unlocked_capsules: views(&dashboard.unlocked),
        upcoming_unlocks: views(&dashboard.upcoming),
        statistics: dashboard.stats,
    }))
}

async fn dashboard_stats(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<DashboardStats>, ServerError> {
    Ok(Json(state.service.dashboard(&user, Utc::now()).await?.stats))
}

async fn dashboard_upcoming(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<CapsuleListResponse>, ServerError> {
    let dashboard = state.service.dashboard(&user, Utc::now()).await?;
    Ok(Json(CapsuleListResponse::new(&dashboard.upcoming)))
}

async fn dashboard_unlocked(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<CapsuleListResponse>, ServerError> {
    let capsules = state.service.list(&user, true).await?;
    Ok(Json(CapsuleListResponse::new(&capsules)))
}

async fn list_notifications(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<Notification>>, ServerError> {
    Ok(Json(state.notifications.list(&user, query.unread).await?))
}

async fn mark_notification_read(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if !state.notifications.mark_read(id, &user).await? {
        return Err(ServerError::NotFound(id.to_string()));
    }
    Ok(Json(serde_json::json!({ "read": true })))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_scheduler_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<SchedulerStatus>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.scheduler.status()))
}

async fn admin_scheduler_run(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<ScanReport>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    info!("Admin triggered unlock scan");
    Ok(Json(state.scheduler.run_once(Utc::now()).await))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
