//! HTTP API
//!
//! JSON endpoints for the trigger, check-ins, confirmations and panic fires,
//! plus the public HTML viewing page recipients reach from their email.

use crate::app::AppState;
use crate::config::{ServerConfig, WHATSAPP_CHECK_IN_KEYWORD};
use crate::error::AppError;
use crate::services::access::AccessView;
use crate::services::check_in::{CheckInReport, ConfirmationReport};
use crate::services::panic::PanicTriggerOutcome;
use crate::services::runner::{NotifyRequest, RunReport, StatusReport};
use crate::templates;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/access", get(access_page))
        .route("/access/verify-pin", post(verify_pin))
        .route("/access/record-view", post(record_view))
        .route("/notify", post(notify))
        .route("/notify/status", get(notify_status))
        .route("/check-in", post(check_in))
        .route("/confirm", post(confirm))
        .route("/panic/trigger", post(panic_trigger))
        .route("/whatsapp/inbound", post(whatsapp_inbound))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    tracing::info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ===== Public viewing page =====

#[derive(Debug, Deserialize)]
struct AccessQuery {
    id: Option<String>,
    recipient: Option<String>,
    delivery: Option<String>,
}

/// Always answers with HTML, including for failures.
async fn access_page(
    State(state): State<AppState>,
    Query(query): Query<AccessQuery>,
) -> Response {
    let (Some(id), Some(recipient)) = (
        query.id.filter(|s| !s.is_empty()),
        query.recipient.filter(|s| !s.is_empty()),
    ) else {
        return html_error(StatusCode::BAD_REQUEST, "This link is incomplete.");
    };

    match state
        .access
        .view(&id, &recipient, query.delivery.as_deref())
        .await
    {
        Ok(AccessView::Expired(at)) => {
            (StatusCode::GONE, Html(templates::expired_page(at))).into_response()
        }
        Ok(AccessView::Locked(at)) => Html(templates::locked_page(at)).into_response(),
        Ok(AccessView::PinRequired {
            message_id,
            delivery_id,
            recipient_email,
        }) => Html(templates::pin_page(&message_id, &delivery_id, &recipient_email))
            .into_response(),
        Ok(AccessView::Content {
            message,
            delivery_id,
        }) => Html(templates::message_page(&message, delivery_id.as_deref())).into_response(),
        Err(e) => {
            let status = e.status_code();
            let text = match status {
                StatusCode::NOT_FOUND => "This message could not be found.",
                StatusCode::FORBIDDEN => "You are not allowed to view this message.",
                _ => {
                    tracing::error!("Access page for {} failed: {}", id, e);
                    "Something went wrong loading this message."
                }
            };
            html_error(status, text)
        }
    }
}

fn html_error(status: StatusCode, text: &str) -> Response {
    (status, Html(templates::error_page(text))).into_response()
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SuccessResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            success: true,
            error: None,
        })
    }

    fn failed(error: &AppError) -> (StatusCode, Json<Self>) {
        (
            error.status_code(),
            Json(Self {
                success: false,
                error: Some(error.to_string()),
            }),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyPinRequest {
    pin: String,
    message_id: String,
    delivery_id: String,
    recipient_email: String,
}

async fn verify_pin(
    State(state): State<AppState>,
    Json(req): Json<VerifyPinRequest>,
) -> Response {
    match state
        .access
        .verify_pin(&req.pin, &req.message_id, &req.delivery_id, &req.recipient_email)
        .await
    {
        Ok(true) => SuccessResponse::ok().into_response(),
        Ok(false) => Json(SuccessResponse {
            success: false,
            error: Some("Incorrect PIN".to_string()),
        })
        .into_response(),
        Err(e) => SuccessResponse::failed(&e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordViewRequest {
    message_id: String,
    delivery_id: String,
    device_info: Option<String>,
}

async fn record_view(
    State(state): State<AppState>,
    Json(req): Json<RecordViewRequest>,
) -> Response {
    match state
        .access
        .record_view(&req.message_id, &req.delivery_id, req.device_info.as_deref())
        .await
    {
        Ok(_) => SuccessResponse::ok().into_response(),
        Err(e) => SuccessResponse::failed(&e).into_response(),
    }
}

// ===== Trigger endpoint =====

/// Bearer check shared by the trigger and the owner actions. Open when no
/// token is configured.
fn verify_trigger_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), AppError> {
    let Some(ref expected) = config.trigger_token else {
        return Ok(());
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(AppError::Unauthorized("Invalid trigger token".into()));
    }
    Ok(())
}

async fn notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<NotifyRequest>>,
) -> Result<Json<RunReport>, AppError> {
    verify_trigger_token(&headers, &state.config)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.runner.run(request).await?))
}

async fn notify_status(State(state): State<AppState>) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(state.runner.status().await?))
}

// ===== Owner and recipient actions =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckInRequest {
    user_id: String,
}

async fn check_in(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CheckInRequest>,
) -> Result<Json<CheckInReport>, AppError> {
    verify_trigger_token(&headers, &state.config)?;
    Ok(Json(state.check_in.check_in(&req.user_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    condition_id: String,
    recipient_id: String,
}

async fn confirm(
    State(state): State<AppState>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<ConfirmationReport>, AppError> {
    Ok(Json(
        state
            .check_in
            .confirm(&req.condition_id, &req.recipient_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PanicTriggerRequest {
    message_id: String,
    user_id: String,
}

async fn panic_trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PanicTriggerRequest>,
) -> Result<Json<PanicTriggerOutcome>, AppError> {
    verify_trigger_token(&headers, &state.config)?;
    Ok(Json(
        state
            .panic
            .trigger(&req.message_id, Some(&req.user_id))
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct WhatsAppInbound {
    from: String,
    body: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct WhatsAppInboundResponse {
    handled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check_in: Option<CheckInReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    panic: Option<PanicTriggerOutcome>,
}

async fn whatsapp_inbound(
    State(state): State<AppState>,
    Json(req): Json<WhatsAppInbound>,
) -> Result<Json<WhatsAppInboundResponse>, AppError> {
    let from = req.from.trim();
    let profile = state
        .repo
        .find_profile_by_whatsapp(from)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No user with WhatsApp number {}", from)))?;

    let text = req.body.trim();
    if text.eq_ignore_ascii_case(WHATSAPP_CHECK_IN_KEYWORD) {
        let report = state.check_in.check_in(&profile.user_id).await?;
        return Ok(Json(WhatsAppInboundResponse {
            handled: true,
            action: Some("check_in"),
            check_in: Some(report),
            ..Default::default()
        }));
    }

    match state
        .panic
        .trigger_by_keyword(&profile.user_id, text)
        .await?
    {
        Some(outcome) => Ok(Json(WhatsAppInboundResponse {
            handled: true,
            action: Some("panic"),
            panic: Some(outcome),
            ..Default::default()
        })),
        None => {
            tracing::debug!("Unmatched WhatsApp message from user {}", profile.user_id);
            Ok(Json(WhatsAppInboundResponse::default()))
        }
    }
}
