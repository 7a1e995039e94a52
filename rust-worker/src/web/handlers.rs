//! HTTP endpoint handlers.
//!
//! Job routes call straight into the orchestrator and the result store.
//! Webhook routes only authenticate and hand the message to the inbox; the
//! mail watcher does all parsing and extraction.

use std::sync::Arc;

use axum::{
    extract::{Form, Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::browser::PoolStats;
use crate::job::JobId;
use crate::mail::inbox::DeliveryError;
use crate::mail::providers::{CloudflarePayload, InboundMail, MailgunPayload};
use crate::mail::{WatcherHealth, WebhookInbox};
use crate::orchestrator::{CancelError, JobRequest, Orchestrator, SubmitError};
use crate::web::auth::{
    check_bearer, check_header_secret, configured, verify_mailgun_signature, AuthFailure,
    CLOUDFLARE_AUTH_HEADER,
};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub inbox: WebhookInbox,
    pub watcher_health: watch::Receiver<WatcherHealth>,
}

impl AppState {
    pub fn new(
        config: Config,
        orchestrator: Arc<Orchestrator>,
        inbox: WebhookInbox,
        watcher_health: watch::Receiver<WatcherHealth>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator,
            inbox,
            watcher_health,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

fn error(status: StatusCode, error: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error,
            message: message.into(),
        }),
    )
        .into_response()
}

fn unauthorized(failure: AuthFailure) -> Response {
    let message = match failure {
        AuthFailure::Missing => "credentials missing",
        AuthFailure::Invalid => "credentials invalid",
    };
    error(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

/// Bearer-token gate for the job routes. Runs before the body is read, so
/// an unauthenticated caller always gets 401.
pub async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(failure) = check_bearer(request.headers(), configured(&state.config.api_token)) {
        warn!(path = %request.uri().path(), reason = ?failure, "api_auth_failed");
        return unauthorized(failure);
    }
    next.run(request).await
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub mail_watcher: WatcherHealth,
    pub active_jobs: usize,
    pub pool: PoolStats,
}

/// Reports 503 once the mail watcher has given up on its mailbox.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mail_watcher = state.watcher_health.borrow().clone();
    let (code, status) = if mail_watcher.is_fatal() {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    } else {
        (StatusCode::OK, "ok")
    };

    (
        code,
        Json(HealthResponse {
            status,
            mail_watcher,
            active_jobs: state.orchestrator.active_jobs(),
            pool: state.orchestrator.pool().stats(),
        }),
    )
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub correlation_key: String,
}

pub async fn create_job(State(state): State<AppState>, Json(request): Json<JobRequest>) -> Response {
    match state.orchestrator.submit(request).await {
        Ok(submitted) => (
            StatusCode::CREATED,
            Json(CreateJobResponse {
                job_id: submitted.job_id,
                correlation_key: submitted.correlation_key,
            }),
        )
            .into_response(),
        Err(e @ SubmitError::Invalid(_)) => {
            error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_workflow", e.to_string())
        }
        Err(e @ SubmitError::Conflict(_)) => {
            error(StatusCode::CONFLICT, "correlation_conflict", e.to_string())
        }
        Err(e @ SubmitError::ShuttingDown) => {
            error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", e.to_string())
        }
    }
}

pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.orchestrator.store().get(&JobId::from(job_id)).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
    }
}

pub async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let job_id = JobId::from(job_id);
    match state.orchestrator.cancel(&job_id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "job_id": job_id, "status": "cancel_requested" })),
        )
            .into_response(),
        Err(e @ CancelError::NotFound(_)) => error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
        Err(e @ CancelError::AlreadyTerminal(..)) => {
            error(StatusCode::CONFLICT, "already_finished", e.to_string())
        }
    }
}

// =============================================================================
// Webhooks
// =============================================================================

#[derive(Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

async fn deliver(state: &AppState, mail: InboundMail) -> Response {
    let message = mail.into_raw_message();
    let message_id = message.id.clone();

    match state.inbox.deliver(message).await {
        Ok(()) => {
            info!(message_id = %message_id, "webhook_message_accepted");
            (
                StatusCode::OK,
                Json(WebhookResponse {
                    status: "accepted",
                    message_id: Some(message_id),
                }),
            )
                .into_response()
        }
        Err(e @ (DeliveryError::Full(_) | DeliveryError::Closed)) => {
            warn!(message_id = %message_id, error = %e, "webhook_delivery_refused");
            error(StatusCode::SERVICE_UNAVAILABLE, "inbox_unavailable", e.to_string())
        }
    }
}

/// Mailgun webhook endpoint (form-encoded).
pub async fn mailgun_webhook(
    State(state): State<AppState>,
    Form(form): Form<MailgunPayload>,
) -> Response {
    info!(
        recipient = %form.recipient,
        has_body_html = form.body_html.is_some(),
        has_signature = !form.signature.is_empty(),
        "mailgun_webhook_received"
    );

    if let Some(signing_key) = configured(&state.config.mailgun_signing_key) {
        if !verify_mailgun_signature(
            signing_key,
            &form.timestamp,
            &form.token,
            &form.signature,
            state.config.mailgun_signature_max_age,
        ) {
            warn!(recipient = %form.recipient, "mailgun_signature_invalid");
            return unauthorized(AuthFailure::Invalid);
        }
    }

    if let Some(domain) = &state.config.mailgun_domain {
        let suffix = format!("@{}", domain.to_lowercase());
        if !form.recipient.to_lowercase().ends_with(&suffix) {
            warn!(
                recipient = %form.recipient,
                expected_domain = %domain,
                "mailgun_invalid_recipient_domain"
            );
            return error(StatusCode::BAD_REQUEST, "invalid_domain", "recipient domain not accepted");
        }
    }

    deliver(&state, InboundMail::Mailgun(form)).await
}

/// Cloudflare Email Worker endpoint (JSON with raw content).
pub async fn cloudflare_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CloudflarePayload>,
) -> Response {
    info!(
        to = %payload.to,
        raw_content_length = payload.raw_content.len(),
        "cloudflare_webhook_received"
    );

    let expected = configured(&state.config.cloudflare_auth_token);
    if expected.is_none() {
        warn!("cloudflare_auth_not_configured");
    }
    if let Err(failure) = check_header_secret(&headers, CLOUDFLARE_AUTH_HEADER, expected) {
        warn!(to = %payload.to, reason = ?failure, "cloudflare_auth_failed");
        return unauthorized(failure);
    }

    deliver(&state, InboundMail::Cloudflare(payload)).await
}
