//! Gateway webhook handling.
//!
//! Handles webhook signature verification, event routing, and reconciliation
//! of local subscription records with the state the gateway reports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::builder::META_SUBSCRIPTION_NAME;
use crate::config::WebhookConfig;
use crate::error::{CashierError, Result};
use crate::gateway::{GatewayCustomer, GatewayInvoice, GatewaySubscription};
use crate::payment::Payment;
use crate::storage::{OwnerRef, SubscriptionStore};
use crate::subscription::{DEFAULT_SUBSCRIPTION_NAME, Subscription, SubscriptionStatus};

/// Default maximum age of a signed webhook timestamp.
pub const DEFAULT_TOLERANCE_SECONDS: u64 = 300;

// =============================================================================
// Events
// =============================================================================

/// Event types the handler acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentActionRequired,
    CustomerDeleted,
    Other(String),
}

impl WebhookEventType {
    #[must_use]
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_action_required" => Self::InvoicePaymentActionRequired,
            "customer.deleted" => Self::CustomerDeleted,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaymentActionRequired => "invoice.payment_action_required",
            Self::CustomerDeleted => "customer.deleted",
            Self::Other(other) => other,
        }
    }
}

/// Parsed webhook event.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEvent {
    /// Event ID.
    pub id: String,
    /// Event type (e.g., "customer.subscription.updated").
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    /// Unix timestamp when the event was created.
    #[serde(default)]
    pub created: i64,
}

impl WebhookEvent {
    #[must_use]
    pub fn kind(&self) -> WebhookEventType {
        WebhookEventType::parse(&self.event_type)
    }

    /// Deserialize the event's object into a gateway DTO.
    fn object<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            tracing::warn!(
                target: "cashier::webhook",
                event_id = %self.id,
                event_type = %self.event_type,
                error = %e,
                "Failed to parse webhook object"
            );
            CashierError::invalid_payload(format!("unexpected {} object", self.event_type))
        })
    }
}

/// Webhook event data.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event was processed successfully.
    Processed,
    /// Event was ignored (unknown type or unknown owner).
    Ignored,
    /// Event was already processed (idempotency).
    AlreadyProcessed,
}

impl WebhookOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Ignored => "ignored",
            Self::AlreadyProcessed => "already_processed",
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// An invoice whose payment needs the customer to confirm it.
#[derive(Debug, Clone)]
pub struct PaymentActionNotice {
    pub owner: OwnerRef,
    pub invoice: GatewayInvoice,
    /// Present when the event carried the expanded payment intent.
    pub payment: Option<Payment>,
}

/// Tells owners about payments that need their attention.
#[async_trait]
pub trait PaymentNotifier: Send + Sync {
    async fn payment_action_required(&self, notice: PaymentActionNotice) -> Result<()>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl PaymentNotifier for NoopNotifier {
    async fn payment_action_required(&self, notice: PaymentActionNotice) -> Result<()> {
        tracing::debug!(
            target: "cashier::webhook",
            owner_id = %notice.owner.owner_id,
            invoice_id = %notice.invoice.id,
            "No notifier configured for payment action"
        );
        Ok(())
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Webhook handler for gateway events.
///
/// Handles signature verification, idempotency, and event processing. Every
/// event overwrites local fields with what the gateway reports, so replays
/// and out-of-order deliveries converge on the gateway's state.
///
/// The webhook secret is stored using [`SecretString`] to prevent accidental
/// exposure in logs or debug output.
pub struct WebhookHandler<S: SubscriptionStore, N: PaymentNotifier = NoopNotifier> {
    store: S,
    webhook_secret: SecretString,
    tolerance_seconds: u64,
    notifier: N,
}

impl<S: SubscriptionStore> WebhookHandler<S> {
    /// Create a new webhook handler.
    #[must_use]
    pub fn new(store: S, webhook_secret: impl Into<SecretString>) -> Self {
        Self {
            store,
            webhook_secret: webhook_secret.into(),
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
            notifier: NoopNotifier,
        }
    }

    #[must_use]
    pub fn from_config(store: S, config: &WebhookConfig) -> Self {
        Self::new(
            store,
            SecretString::from(config.secret.expose_secret().to_owned()),
        )
        .with_tolerance(config.tolerance_seconds)
    }
}

impl<S: SubscriptionStore, N: PaymentNotifier> WebhookHandler<S, N> {
    /// Replace the notifier used for payment-action events.
    #[must_use]
    pub fn with_notifier<M: PaymentNotifier>(self, notifier: M) -> WebhookHandler<S, M> {
        WebhookHandler {
            store: self.store,
            webhook_secret: self.webhook_secret,
            tolerance_seconds: self.tolerance_seconds,
            notifier,
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, seconds: u64) -> Self {
        self.tolerance_seconds = seconds;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Verify, parse and process a raw webhook delivery.
    pub async fn handle(&self, payload: &[u8], signature: &str) -> Result<WebhookOutcome> {
        let event = self.verify_signature(payload, signature)?;
        self.handle_event(event).await
    }

    /// Verify the webhook signature and parse the event.
    ///
    /// # Arguments
    /// * `payload` - The raw request body
    /// * `signature` - The `Stripe-Signature` header value
    ///
    /// # Errors
    /// Returns [`CashierError::AccessDenied`] if verification fails and
    /// [`CashierError::InvalidPayload`] if the body is not an event.
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent> {
        self.verify_signature_at(payload, signature, Utc::now().timestamp())
    }

    /// [`Self::verify_signature`] against a fixed clock.
    pub fn verify_signature_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: i64,
    ) -> Result<WebhookEvent> {
        let sig_parts = parse_signature_header(signature)?;

        let age = now.abs_diff(sig_parts.timestamp);
        if age > self.tolerance_seconds {
            tracing::warn!(
                target: "cashier::webhook",
                age_seconds = age,
                "Rejected webhook outside the tolerance window"
            );
            return Err(CashierError::access_denied("Webhook timestamp outside tolerance"));
        }

        let mut signed_payload = format!("{}.", sig_parts.timestamp).into_bytes();
        signed_payload.extend_from_slice(payload);
        let expected = compute_signature(self.webhook_secret.expose_secret(), &signed_payload)?;

        // Any candidate may match; the secret may be mid-rotation.
        let matched = sig_parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| expected.ct_eq(&provided).unwrap_u8() == 1)
                .unwrap_or(false)
        });
        if !matched {
            tracing::warn!(target: "cashier::webhook", "Rejected webhook with invalid signature");
            return Err(CashierError::access_denied("Invalid webhook signature"));
        }

        // Log detailed error internally but return generic message
        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "cashier::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            CashierError::invalid_payload("malformed JSON payload")
        })
    }

    /// Process a verified webhook event.
    ///
    /// Events are marked processed only after their handler succeeds, so a
    /// failed event is retried by the gateway. Ignored events are not marked.
    pub async fn handle_event(&self, event: WebhookEvent) -> Result<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            tracing::debug!(
                target: "cashier::webhook",
                event_id = %event.id,
                "Skipping already processed event"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let outcome = match event.kind() {
            WebhookEventType::SubscriptionCreated | WebhookEventType::SubscriptionUpdated => {
                self.handle_subscription_updated(&event).await?
            }
            WebhookEventType::SubscriptionDeleted => self.handle_subscription_deleted(&event).await?,
            WebhookEventType::InvoicePaymentActionRequired => {
                self.handle_payment_action_required(&event).await?
            }
            WebhookEventType::CustomerDeleted => self.handle_customer_deleted(&event).await?,
            WebhookEventType::Other(_) => WebhookOutcome::Ignored,
        };

        if outcome == WebhookOutcome::Processed {
            self.store.mark_event_processed(&event.id).await?;
        }

        tracing::info!(
            target: "cashier::webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Handled webhook event"
        );
        Ok(outcome)
    }

    /// Insert or update the local record from a subscription object.
    ///
    /// Subscriptions of unknown customers are ignored. A subscription that
    /// expired before its first payment is deleted locally.
    async fn handle_subscription_updated(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let remote: GatewaySubscription = event.object()?;
        let now = Utc::now();

        let existing = self.store.find_subscription_by_gateway_id(&remote.id).await?;

        if remote.subscription_status() == SubscriptionStatus::IncompleteExpired {
            return match existing {
                Some(sub) => {
                    self.store.delete_subscription(sub.id).await?;
                    tracing::info!(
                        target: "cashier::webhook",
                        subscription_id = %sub.id,
                        gateway_id = %remote.id,
                        "Deleted subscription that never started"
                    );
                    Ok(WebhookOutcome::Processed)
                }
                None => Ok(WebhookOutcome::Ignored),
            };
        }

        let is_new = existing.is_none();
        let mut sub = match existing {
            Some(sub) => sub,
            None => match self.new_local_subscription(&remote).await? {
                Some(sub) => sub,
                None => return Ok(WebhookOutcome::Ignored),
            },
        };

        let before = sub.clone();
        sub.reconcile_with(&remote, now);
        sub.updated_at = before.updated_at;
        if !is_new && sub == before {
            return Ok(WebhookOutcome::Processed);
        }
        sub.updated_at = now;
        self.store.save_subscription(&sub).await?;

        tracing::info!(
            target: "cashier::webhook",
            subscription_id = %sub.id,
            gateway_id = %sub.gateway_id,
            status = %sub.status,
            "Reconciled subscription from webhook"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// Build a record for a subscription created outside this library.
    ///
    /// Returns `None` when the customer has no owner, or the owner holds a
    /// live subscription with the same name.
    async fn new_local_subscription(
        &self,
        remote: &GatewaySubscription,
    ) -> Result<Option<Subscription>> {
        let Some(owner) = self.store.find_owner_by_customer_id(&remote.customer).await? else {
            tracing::warn!(
                target: "cashier::webhook",
                gateway_id = %remote.id,
                customer_id = %remote.customer,
                "Ignoring subscription of unknown customer"
            );
            return Ok(None);
        };

        let name = remote
            .metadata
            .get(META_SUBSCRIPTION_NAME)
            .map_or(DEFAULT_SUBSCRIPTION_NAME, String::as_str);

        if let Some(previous) = self.store.find_subscription_by_name(&owner.owner_id, name).await? {
            if !previous.ended() && !previous.status.is_terminal() {
                tracing::warn!(
                    target: "cashier::webhook",
                    gateway_id = %remote.id,
                    owner_id = %owner.owner_id,
                    name,
                    "Ignoring subscription whose name is held by a live subscription"
                );
                return Ok(None);
            }
        }

        Ok(Some(Subscription::new(
            owner.owner_id.clone(),
            owner.owner_type,
            name,
            remote.id.clone(),
            remote.subscription_status(),
        )))
    }

    /// Mark the subscription cancelled.
    async fn handle_subscription_deleted(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let remote: GatewaySubscription = event.object()?;
        let Some(mut sub) = self.store.find_subscription_by_gateway_id(&remote.id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        let ended_at = remote
            .ended_at
            .or(remote.canceled_at)
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        mark_cancelled(&mut sub, ended_at, Utc::now());
        self.store.save_subscription(&sub).await?;

        tracing::info!(
            target: "cashier::webhook",
            subscription_id = %sub.id,
            gateway_id = %sub.gateway_id,
            "Marked subscription cancelled"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// Notify the owner that a payment needs confirmation.
    async fn handle_payment_action_required(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let invoice: GatewayInvoice = event.object()?;
        let Some(customer_id) = invoice.customer.as_deref() else {
            return Ok(WebhookOutcome::Ignored);
        };
        let Some(owner) = self.store.find_owner_by_customer_id(customer_id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        let payment = invoice
            .payment_intent
            .as_ref()
            .and_then(|intent| intent.as_object())
            .map(|intent| Payment::new(intent.clone()));

        tracing::info!(
            target: "cashier::webhook",
            owner_id = %owner.owner_id,
            invoice_id = %invoice.id,
            "Notifying owner of payment requiring action"
        );
        self.notifier
            .payment_action_required(PaymentActionNotice {
                owner,
                invoice,
                payment,
            })
            .await?;
        Ok(WebhookOutcome::Processed)
    }

    /// Cancel every subscription of the owner and drop the customer link.
    async fn handle_customer_deleted(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let customer: GatewayCustomer = event.object()?;
        let Some(owner) = self.store.find_owner_by_customer_id(&customer.id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        let now = Utc::now();
        for mut sub in self.store.list_subscriptions(&owner.owner_id).await? {
            let before = sub.clone();
            mark_cancelled(&mut sub, None, now);
            if sub != before {
                self.store.save_subscription(&sub).await?;
            }
        }
        self.store.clear_customer_id(&owner.owner_id).await?;

        tracing::info!(
            target: "cashier::webhook",
            owner_id = %owner.owner_id,
            customer_id = %customer.id,
            "Removed deleted customer"
        );
        Ok(WebhookOutcome::Processed)
    }
}

/// Cancel a record locally: status canceled, trial cleared, ended now unless it
/// already ended.
fn mark_cancelled(sub: &mut Subscription, ended_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
    if sub.status == SubscriptionStatus::Canceled && sub.trial_ends_at.is_none() && sub.ended_at(now) {
        return;
    }
    sub.status = SubscriptionStatus::Canceled;
    sub.trial_ends_at = None;
    if !sub.ended_at(now) {
        sub.ends_at = Some(ended_at.filter(|at| *at <= now).unwrap_or(now));
    }
    sub.updated_at = now;
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

/// Parse the `Stripe-Signature` header.
fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| CashierError::access_denied("Invalid signature header format"))?;

        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {} // Ignore other schemes
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| CashierError::access_denied("Missing timestamp in signature"))?;
    if signatures.is_empty() {
        return Err(CashierError::access_denied("Missing v1 signature"));
    }
    Ok(SignatureParts {
        timestamp,
        signatures,
    })
}

/// Compute HMAC-SHA256 signature bytes.
fn compute_signature(secret: &str, payload: &[u8]) -> Result<Vec<u8>> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| CashierError::Internal("HMAC error".to_string()))?;

    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sign a payload the way the gateway does, for tests.
#[cfg(any(test, feature = "test-cashier"))]
pub mod test {
    use super::*;

    /// Build a `Stripe-Signature` header for `payload` at `timestamp`.
    #[must_use]
    pub fn sign_payload(secret: &str, payload: &[u8], timestamp: i64) -> String {
        let mut signed_payload = format!("{timestamp}.").into_bytes();
        signed_payload.extend_from_slice(payload);
        let signature = compute_signature(secret, &signed_payload).unwrap_or_default();
        format!("t={},v1={}", timestamp, hex::encode(signature))
    }
}

#[cfg(test)]
mod tests {
    use super::test::sign_payload;
    use super::*;
    use crate::storage::test::InMemorySubscriptionStore;
    use chrono::Duration;
    use std::sync::{Arc, Mutex};

    const SECRET: &str = "whsec_test_secret";

    fn create_test_handler() -> (WebhookHandler<InMemorySubscriptionStore>, InMemorySubscriptionStore) {
        let store = InMemorySubscriptionStore::new();
        (WebhookHandler::new(store.clone(), SECRET), store)
    }

    fn create_test_event(id: &str, event_type: &str, object: serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            data: WebhookEventData { object },
            created: 1_700_000_000,
        }
    }

    fn subscription_object(status: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "sub_123",
            "customer": "cus_123",
            "status": status,
            "current_period_end": 1_900_000_000i64,
            "cancel_at_period_end": false,
            "items": {
                "data": [
                    {"id": "si_a", "price": {"id": "price_a"}, "quantity": 10},
                    {"id": "si_b", "price": {"id": "price_b"}, "quantity": 1}
                ]
            },
            "metadata": {"name": "main"}
        })
    }

    async fn link_test_customer(store: &InMemorySubscriptionStore) {
        store.set_customer_id("user_1", "user", "cus_123").await.unwrap();
    }

    #[test]
    fn test_parse_signature_header() {
        let parts = parse_signature_header("t=1234567890,v1=abc123,v0=old,v1=def456").unwrap();
        assert_eq!(parts.timestamp, 1234567890);
        assert_eq!(parts.signatures, vec!["abc123", "def456"]);
    }

    #[test]
    fn test_parse_signature_header_invalid() {
        for header in ["invalid", "v1=abc", "t=123"] {
            assert!(matches!(
                parse_signature_header(header),
                Err(CashierError::AccessDenied(_))
            ));
        }
    }

    #[test]
    fn test_verify_signature_valid() {
        let (handler, _) = create_test_handler();
        let payload = br#"{"id":"evt_123","type":"test","data":{"object":{}},"created":1234567890}"#;
        let now = Utc::now().timestamp();

        let event = handler
            .verify_signature(payload, &sign_payload(SECRET, payload, now))
            .unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.kind(), WebhookEventType::Other("test".to_string()));
    }

    #[test]
    fn test_verify_signature_rejects_tampering() {
        let (handler, _) = create_test_handler();
        let payload = br#"{"id":"evt_123","type":"test","data":{"object":{}},"created":1}"#;
        let now = Utc::now().timestamp();

        let wrong_secret = sign_payload("whsec_other", payload, now);
        assert!(matches!(
            handler.verify_signature(payload, &wrong_secret),
            Err(CashierError::AccessDenied(_))
        ));

        let not_hex = format!("t={now},v1=invalid_signature_hex");
        assert!(matches!(
            handler.verify_signature(payload, &not_hex),
            Err(CashierError::AccessDenied(_))
        ));

        let signature = sign_payload(SECRET, payload, now);
        let tampered = br#"{"id":"evt_999","type":"test","data":{"object":{}},"created":1}"#;
        assert!(matches!(
            handler.verify_signature(tampered, &signature),
            Err(CashierError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_verify_signature_tolerance() {
        let (handler, _) = create_test_handler();
        let handler = handler.with_tolerance(60);
        let payload = br#"{"id":"evt_123","type":"test","data":{"object":{}},"created":1}"#;
        let signature = sign_payload(SECRET, payload, 1_700_000_000);

        assert!(handler.verify_signature_at(payload, &signature, 1_700_000_059).is_ok());
        assert!(matches!(
            handler.verify_signature_at(payload, &signature, 1_700_000_061),
            Err(CashierError::AccessDenied(_))
        ));
        assert!(matches!(
            handler.verify_signature(payload, &signature),
            Err(CashierError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_verify_signature_malformed_payload() {
        let (handler, _) = create_test_handler();
        let payload = b"not json";
        let signature = sign_payload(SECRET, payload, Utc::now().timestamp());

        assert!(matches!(
            handler.verify_signature(payload, &signature),
            Err(CashierError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_event_ignored() {
        let (handler, store) = create_test_handler();

        let event = create_test_event("evt_unknown", "unknown.event.type", serde_json::json!({}));
        assert_eq!(handler.handle_event(event).await.unwrap(), WebhookOutcome::Ignored);
        assert!(store.processed_events().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_created_upserts_for_known_owner() {
        let (handler, store) = create_test_handler();
        link_test_customer(&store).await;

        let event = create_test_event(
            "evt_created",
            "customer.subscription.created",
            subscription_object("active"),
        );
        assert_eq!(handler.handle_event(event).await.unwrap(), WebhookOutcome::Processed);

        let sub = store.find_subscription_by_gateway_id("sub_123").await.unwrap().unwrap();
        assert_eq!(sub.owner_id, "user_1");
        assert_eq!(sub.name, "main");
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.has_multiple_prices());
        assert_eq!(sub.find_item("price_a").unwrap().quantity, Some(10));
        assert_eq!(sub.ends_at, None);
    }

    #[tokio::test]
    async fn test_subscription_of_unknown_customer_ignored() {
        let (handler, store) = create_test_handler();

        let event = create_test_event(
            "evt_created",
            "customer.subscription.created",
            subscription_object("active"),
        );
        assert_eq!(handler.handle_event(event).await.unwrap(), WebhookOutcome::Ignored);
        assert!(store.all_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_created_keeps_ended_namesake() {
        let (handler, store) = create_test_handler();
        link_test_customer(&store).await;

        let mut ended = Subscription::new("user_1", "user", "main", "sub_old", SubscriptionStatus::Canceled);
        ended.ends_at = Some(Utc::now() - Duration::days(3));
        ended.created_at = Utc::now() - Duration::days(60);
        store.save_subscription(&ended).await.unwrap();

        let event = create_test_event(
            "evt_created",
            "customer.subscription.created",
            subscription_object("active"),
        );
        assert_eq!(handler.handle_event(event).await.unwrap(), WebhookOutcome::Processed);

        assert_eq!(store.find_subscription(ended.id).await.unwrap(), Some(ended.clone()));
        let current = store.find_subscription_by_name("user_1", "main").await.unwrap().unwrap();
        assert_eq!(current.gateway_id, "sub_123");
        assert_ne!(current.id, ended.id);
        assert_eq!(store.all_subscriptions().len(), 2);
    }

    #[tokio::test]
    async fn test_subscription_updated_is_idempotent() {
        let (handler, store) = create_test_handler();
        link_test_customer(&store).await;

        let mut object = subscription_object("active");
        object["cancel_at_period_end"] = serde_json::json!(true);

        for id in ["evt_1", "evt_2"] {
            let event = create_test_event(id, "customer.subscription.updated", object.clone());
            handler.handle_event(event).await.unwrap();
        }
        let once = store.find_subscription_by_gateway_id("sub_123").await.unwrap().unwrap();

        let event = create_test_event("evt_3", "customer.subscription.updated", object);
        handler.handle_event(event).await.unwrap();
        let twice = store.find_subscription_by_gateway_id("sub_123").await.unwrap().unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.ends_at, DateTime::from_timestamp(1_900_000_000, 0));
        assert!(once.on_grace_period());
        assert_eq!(store.all_subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_already_processed() {
        let (handler, store) = create_test_handler();
        link_test_customer(&store).await;

        let event = create_test_event(
            "evt_dup",
            "customer.subscription.updated",
            subscription_object("active"),
        );
        assert_eq!(handler.handle_event(event.clone()).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(
            handler.handle_event(event).await.unwrap(),
            WebhookOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_updated_trial_and_cancel_at() {
        let (handler, store) = create_test_handler();
        link_test_customer(&store).await;
        let trial_end = (Utc::now() + Duration::days(5)).timestamp();
        let cancel_at = (Utc::now() + Duration::days(20)).timestamp();

        let mut object = subscription_object("trialing");
        object["trial_end"] = serde_json::json!(trial_end);
        object["cancel_at"] = serde_json::json!(cancel_at);
        let event = create_test_event("evt_1", "customer.subscription.updated", object);
        handler.handle_event(event).await.unwrap();

        let sub = store.find_subscription_by_gateway_id("sub_123").await.unwrap().unwrap();
        assert_eq!(sub.trial_ends_at, DateTime::from_timestamp(trial_end, 0));
        assert_eq!(sub.ends_at, DateTime::from_timestamp(cancel_at, 0));
        assert!(sub.on_trial());
    }

    #[tokio::test]
    async fn test_incomplete_expired_deletes_local_record() {
        let (handler, store) = create_test_handler();
        link_test_customer(&store).await;

        let event = create_test_event(
            "evt_1",
            "customer.subscription.created",
            subscription_object("incomplete"),
        );
        handler.handle_event(event).await.unwrap();
        assert_eq!(store.all_subscriptions().len(), 1);

        let event = create_test_event(
            "evt_2",
            "customer.subscription.updated",
            subscription_object("incomplete_expired"),
        );
        assert_eq!(handler.handle_event(event).await.unwrap(), WebhookOutcome::Processed);
        assert!(store.all_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_deleted_marks_cancelled() {
        let (handler, store) = create_test_handler();
        link_test_customer(&store).await;

        let event = create_test_event(
            "evt_1",
            "customer.subscription.created",
            subscription_object("active"),
        );
        handler.handle_event(event).await.unwrap();

        let ended_at = Utc::now().timestamp() - 10;
        let mut object = subscription_object("canceled");
        object["ended_at"] = serde_json::json!(ended_at);
        let event = create_test_event("evt_2", "customer.subscription.deleted", object);
        assert_eq!(handler.handle_event(event).await.unwrap(), WebhookOutcome::Processed);

        let sub = store.find_subscription_by_gateway_id("sub_123").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert_eq!(sub.ends_at, DateTime::from_timestamp(ended_at, 0));
        assert!(sub.ended());
        assert!(!sub.active());
    }

    #[tokio::test]
    async fn test_subscription_deleted_unknown_ignored() {
        let (handler, _store) = create_test_handler();

        let event = create_test_event(
            "evt_1",
            "customer.subscription.deleted",
            subscription_object("canceled"),
        );
        assert_eq!(handler.handle_event(event).await.unwrap(), WebhookOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_customer_deleted_cancels_everything() {
        let (handler, store) = create_test_handler();
        link_test_customer(&store).await;

        let mut object = subscription_object("trialing");
        object["trial_end"] = serde_json::json!((Utc::now() + Duration::days(3)).timestamp());
        let event = create_test_event("evt_1", "customer.subscription.created", object);
        handler.handle_event(event).await.unwrap();

        let event = create_test_event(
            "evt_2",
            "customer.deleted",
            serde_json::json!({"id": "cus_123"}),
        );
        assert_eq!(handler.handle_event(event).await.unwrap(), WebhookOutcome::Processed);

        let sub = store.find_subscription_by_gateway_id("sub_123").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert_eq!(sub.trial_ends_at, None);
        assert!(sub.ends_at.is_some());
        assert!(!sub.on_trial());
        assert_eq!(store.get_customer_id("user_1").await.unwrap(), None);
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        notices: Arc<Mutex<Vec<PaymentActionNotice>>>,
    }

    #[async_trait]
    impl PaymentNotifier for RecordingNotifier {
        async fn payment_action_required(&self, notice: PaymentActionNotice) -> Result<()> {
            self.notices.lock().unwrap().push(notice);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_payment_action_required_notifies_owner() {
        let store = InMemorySubscriptionStore::new();
        link_test_customer(&store).await;
        let notifier = RecordingNotifier::default();
        let handler = WebhookHandler::new(store, SECRET).with_notifier(notifier.clone());

        let event = create_test_event(
            "evt_1",
            "invoice.payment_action_required",
            serde_json::json!({
                "id": "in_123",
                "customer": "cus_123",
                "amount_due": 2500,
                "currency": "usd",
                "payment_intent": {
                    "id": "pi_123",
                    "amount": 2500,
                    "currency": "usd",
                    "status": "requires_action",
                    "client_secret": "pi_123_secret"
                }
            }),
        );
        assert_eq!(handler.handle_event(event).await.unwrap(), WebhookOutcome::Processed);

        let notices = notifier.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].owner.owner_id, "user_1");
        let payment = notices[0].payment.as_ref().unwrap();
        assert!(payment.requires_action());
        assert_eq!(payment.client_secret(), Some("pi_123_secret"));
    }

    #[tokio::test]
    async fn test_malformed_object_is_invalid_payload() {
        let (handler, store) = create_test_handler();

        let event = create_test_event(
            "evt_bad",
            "customer.subscription.updated",
            serde_json::json!({"id": 42}),
        );
        assert!(matches!(
            handler.handle_event(event).await,
            Err(CashierError::InvalidPayload(_))
        ));
        assert!(store.processed_events().is_empty());
    }
}
