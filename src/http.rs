//! Axum route receiving gateway webhooks.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};
use serde::Serialize;

use crate::error::{CashierError, Result};
use crate::storage::SubscriptionStore;
use crate::webhook::{PaymentNotifier, WebhookHandler};

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
}

/// Build a router with `POST /webhook` backed by `handler`.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new().nest("/billing", webhook_router(Arc::new(handler)));
/// ```
pub fn webhook_router<S, N>(handler: Arc<WebhookHandler<S, N>>) -> Router
where
    S: SubscriptionStore + 'static,
    N: PaymentNotifier + 'static,
{
    Router::new()
        .route("/webhook", post(receive_webhook::<S, N>))
        .with_state(handler)
}

async fn receive_webhook<S, N>(
    State(handler): State<Arc<WebhookHandler<S, N>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>>
where
    S: SubscriptionStore + 'static,
    N: PaymentNotifier + 'static,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!(target: "cashier::http", "Webhook request without signature header");
            CashierError::access_denied("Missing signature header")
        })?;

    let outcome = handler.handle(&body, signature).await?;
    Ok(Json(WebhookResponse {
        status: outcome.as_str(),
    }))
}
