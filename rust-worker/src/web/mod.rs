//! HTTP surface: the jobs API and the inbound mail webhooks.
//!
//! - `GET /health`
//! - `POST /jobs`, `GET /jobs/:id`, `DELETE /jobs/:id`
//! - `POST /webhooks/mailgun`, `POST /webhooks/cloudflare`

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    cancel_job, cloudflare_webhook, create_job, get_job, health, mailgun_webhook,
    require_api_token, AppState, HealthResponse, WebhookResponse,
};

pub fn router(state: AppState) -> Router {
    // Webhooks carry their own provider auth; only the job routes take the
    // API token.
    let jobs = Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_token));

    Router::new()
        .route("/health", get(health))
        .merge(jobs)
        .route("/webhooks/mailgun", post(mailgun_webhook))
        .route("/webhooks/cloudflare", post(cloudflare_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
