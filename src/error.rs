//! Error types for subscription billing.
//!
//! Every failure a caller may want to special-case has its own variant:
//! "needs a new payment method" ([`CashierError::PaymentFailure`]), "needs a
//! client-side challenge" ([`CashierError::PaymentActionRequired`]),
//! structurally invalid requests, gateway failures, and the case where the
//! gateway accepted a change that could not be written locally.

use std::fmt;

use crate::payment::Payment;

/// The main error type for cashier operations.
#[derive(Debug, thiserror::Error)]
pub enum CashierError {
    /// The owner has no gateway customer yet. Create the customer first.
    #[error("Owner '{owner_id}' is not a gateway customer yet")]
    InvalidCustomer { owner_id: String },

    /// The payment needs a new payment method.
    ///
    /// The remote change already happened and is not rolled back.
    #[error("The payment attempt failed because of an invalid payment method")]
    PaymentFailure(Box<Payment>),

    /// The payment needs an additional confirmation step (3D Secure etc).
    ///
    /// The remote change already happened and is not rolled back.
    #[error("The payment attempt failed because additional action is required before it can be completed")]
    PaymentActionRequired(Box<Payment>),

    /// The request is structurally invalid for the subscription's current items.
    #[error(transparent)]
    SubscriptionUpdateFailure(#[from] SubscriptionUpdateFailure),

    /// The operation is not legal in the subscription's current state.
    #[error("Logic error: {0}")]
    Logic(String),

    /// The gateway rejected the request or could not be reached.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The gateway accepted the change but the local record could not be saved.
    ///
    /// The local record is stale until it is re-synced from the gateway.
    #[error("Subscription '{gateway_id}' changed at the gateway but the local record was not saved: {message}")]
    Inconsistent { gateway_id: String, message: String },

    /// Webhook signature or timestamp verification failed.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A webhook or gateway payload could not be understood.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for cashier operations.
pub type Result<T> = std::result::Result<T, CashierError>;

impl CashierError {
    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// The payment attached to a payment error, if any.
    #[must_use]
    pub fn payment(&self) -> Option<&Payment> {
        match self {
            Self::PaymentFailure(payment) | Self::PaymentActionRequired(payment) => Some(&**payment),
            _ => None,
        }
    }

    /// Check if the caller has to collect a payment method or run a challenge.
    #[must_use]
    pub fn requires_payment_attention(&self) -> bool {
        matches!(self, Self::PaymentFailure(_) | Self::PaymentActionRequired(_))
    }

    /// Check if this is a caller error (bad input or illegal state).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidCustomer { .. }
            | Self::SubscriptionUpdateFailure(_)
            | Self::Logic(_)
            | Self::AccessDenied(_)
            | Self::InvalidPayload(_)
            | Self::NotFound(_) => true,
            Self::Gateway(err) => matches!(err.http_status, Some(400..=499)),
            _ => false,
        }
    }

    /// Check if retrying the same call could succeed.
    ///
    /// Nothing in this crate retries on its own; this is for callers.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway(err) => err.is_retryable(),
            Self::Inconsistent { .. } | Self::Database(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CashierError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CashierError::InvalidPayload(format!("JSON error: {}", err))
        } else {
            CashierError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

// =============================================================================
// Subscription update failures
// =============================================================================

/// Requests rejected before any remote call because of the item layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionUpdateFailure {
    #[error("The subscription has multiple prices; this operation needs a single-price subscription")]
    MultiplePrices,

    #[error("The price \"{price}\" is already attached to the subscription")]
    DuplicatePrice { price: String },

    #[error("The last price on a subscription cannot be removed; cancel the subscription instead")]
    CannotDeleteLastPrice,

    #[error("Quantity {quantity} for price \"{price}\" is invalid; quantities must be at least 1")]
    InvalidQuantity { price: String, quantity: u64 },

    #[error("The price \"{price}\" is metered; its quantity is computed by the gateway")]
    MeteredQuantity { price: String },

    #[error("The subscription \"{name}\" has an incomplete payment and cannot be updated")]
    IncompleteSubscription { name: String },

    #[error("At least one price is required to create a subscription")]
    NoPrices,
}

// =============================================================================
// Gateway errors
// =============================================================================

/// Broad category of a gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    /// The card was declined or could not be charged.
    Card,
    InvalidRequest,
    Authentication,
    RateLimit,
    /// The gateway failed on its side.
    Api,
    Connection,
    Timeout,
    /// The response could not be decoded.
    Decode,
}

impl GatewayErrorKind {
    /// Parse the `error.type` field of a gateway error body.
    #[must_use]
    pub fn from_gateway(kind: &str) -> Self {
        match kind {
            "card_error" => Self::Card,
            "invalid_request_error" | "idempotency_error" => Self::InvalidRequest,
            "authentication_error" => Self::Authentication,
            "rate_limit_error" => Self::RateLimit,
            "api_connection_error" => Self::Connection,
            _ => Self::Api,
        }
    }
}

/// An error reported by (or while talking to) the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    /// The gateway operation that failed (e.g. "update_subscription").
    pub operation: String,
    pub message: String,
    /// Machine-readable error code (e.g. "resource_missing").
    pub code: Option<String>,
    /// Card decline reason, for card errors.
    pub decline_code: Option<String>,
    pub http_status: Option<u16>,
}

/// Error codes the gateway uses when an invoice would have no lines.
const NOTHING_TO_INVOICE_CODES: [&str; 2] = [
    "invoice_no_customer_line_items",
    "invoice_no_subscription_line_items",
];

impl GatewayError {
    #[must_use]
    pub fn new(
        kind: GatewayErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
            code: None,
            decline_code: None,
            http_status: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_decline_code(mut self, decline_code: impl Into<String>) -> Self {
        self.decline_code = Some(decline_code.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// A card decline or other card-level failure.
    #[must_use]
    pub fn card_declined(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Card, operation, message)
            .with_code("card_declined")
            .with_status(402)
    }

    /// The gateway refused to create an invoice with no line items.
    #[must_use]
    pub fn nothing_to_invoice(operation: impl Into<String>) -> Self {
        Self::new(
            GatewayErrorKind::InvalidRequest,
            operation,
            "Nothing to invoice for customer",
        )
        .with_code(NOTHING_TO_INVOICE_CODES[0])
        .with_status(400)
    }

    #[must_use]
    pub fn is_card_error(&self) -> bool {
        self.kind == GatewayErrorKind::Card
    }

    /// Check if the gateway refused an invoice because nothing was billable.
    #[must_use]
    pub fn is_nothing_to_invoice(&self) -> bool {
        self.code
            .as_deref()
            .is_some_and(|code| NOTHING_TO_INVOICE_CODES.contains(&code))
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            GatewayErrorKind::RateLimit
            | GatewayErrorKind::Connection
            | GatewayErrorKind::Timeout => true,
            _ => matches!(self.http_status, Some(429) | Some(500..=599)),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gateway error during '{}': {}", self.operation, self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        if let Some(status) = self.http_status {
            write!(f, " [HTTP {}]", status)?;
        }
        Ok(())
    }
}

impl std::error::Error for GatewayError {}

// =============================================================================
// HTTP mapping
// =============================================================================

#[cfg(feature = "axum")]
mod response {
    use axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    };
    use serde::Serialize;

    use super::CashierError;

    #[derive(Serialize)]
    struct ErrorResponse {
        error: String,
    }

    impl CashierError {
        /// HTTP status for this error.
        #[must_use]
        pub fn status_code(&self) -> StatusCode {
            match self {
                Self::AccessDenied(_) => StatusCode::FORBIDDEN,
                Self::NotFound(_) => StatusCode::NOT_FOUND,
                Self::PaymentFailure(_) | Self::PaymentActionRequired(_) => {
                    StatusCode::PAYMENT_REQUIRED
                }
                err if err.is_client_error() => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        }
    }

    impl IntoResponse for CashierError {
        fn into_response(self) -> Response {
            let status = self.status_code();
            let message = if status.is_server_error() {
                tracing::error!(target: "cashier::http", error = %self, "request failed");
                "Internal server error".to_string()
            } else {
                self.to_string()
            };
            (status, Json(ErrorResponse { error: message })).into_response()
        }
    }
}
