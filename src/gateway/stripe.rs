//! Live Stripe gateway.
//!
//! Built on the `async-stripe` SDK with idempotency keys on mutating calls,
//! retry with exponential backoff for transient failures, and a mapping from
//! SDK objects into the gateway types the rest of the crate reads.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Serialize;
use serde::de::IgnoredAny;
use stripe::generated::billing::subscription::{
    SubscriptionBillingCycleAnchor, SubscriptionPaymentBehavior, SubscriptionProrationBehavior,
};
use stripe::generated::billing::subscription_item::{
    SubscriptionPaymentBehavior as ItemPaymentBehavior,
    SubscriptionProrationBehavior as ItemProrationBehavior,
};

use super::Gateway;
use super::types::*;
use crate::config::{CashierConfig, GatewayConfig, validate_api_key};
use crate::error::{CashierError, GatewayError, GatewayErrorKind, Result};

/// Expansion applied to every subscription response.
const EXPAND_LATEST_PAYMENT: &[&str] = &["latest_invoice.payment_intent"];

// ============================================================================
// Parameters the SDK does not model
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct ConfirmPaymentIntentParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_method: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
struct DeleteSubscriptionItemParams {
    proration_behavior: ItemProrationBehavior,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    clear_usage: bool,
}

// ============================================================================
// Option mapping
// ============================================================================

fn subscription_proration(behavior: ProrationBehavior) -> SubscriptionProrationBehavior {
    match behavior {
        ProrationBehavior::CreateProrations => SubscriptionProrationBehavior::CreateProrations,
        ProrationBehavior::None => SubscriptionProrationBehavior::None,
        ProrationBehavior::AlwaysInvoice => SubscriptionProrationBehavior::AlwaysInvoice,
    }
}

fn item_proration(behavior: ProrationBehavior) -> ItemProrationBehavior {
    match behavior {
        ProrationBehavior::CreateProrations => ItemProrationBehavior::CreateProrations,
        ProrationBehavior::None => ItemProrationBehavior::None,
        ProrationBehavior::AlwaysInvoice => ItemProrationBehavior::AlwaysInvoice,
    }
}

fn subscription_payment(behavior: PaymentBehavior) -> SubscriptionPaymentBehavior {
    match behavior {
        PaymentBehavior::AllowIncomplete => SubscriptionPaymentBehavior::AllowIncomplete,
        PaymentBehavior::DefaultIncomplete => SubscriptionPaymentBehavior::DefaultIncomplete,
        PaymentBehavior::ErrorIfIncomplete => SubscriptionPaymentBehavior::ErrorIfIncomplete,
        PaymentBehavior::PendingIfIncomplete => SubscriptionPaymentBehavior::PendingIfIncomplete,
    }
}

fn item_payment(behavior: PaymentBehavior) -> ItemPaymentBehavior {
    match behavior {
        PaymentBehavior::AllowIncomplete => ItemPaymentBehavior::AllowIncomplete,
        PaymentBehavior::DefaultIncomplete => ItemPaymentBehavior::DefaultIncomplete,
        PaymentBehavior::ErrorIfIncomplete => ItemPaymentBehavior::ErrorIfIncomplete,
        PaymentBehavior::PendingIfIncomplete => ItemPaymentBehavior::PendingIfIncomplete,
    }
}

fn billing_cycle_anchor(anchor: BillingCycleAnchor) -> SubscriptionBillingCycleAnchor {
    match anchor {
        BillingCycleAnchor::Now => SubscriptionBillingCycleAnchor::Now,
        BillingCycleAnchor::Unchanged => SubscriptionBillingCycleAnchor::Unchanged,
    }
}

fn scheduled(trial_end: TrialEnd) -> stripe::Scheduled {
    match trial_end {
        TrialEnd::Now => stripe::Scheduled::now(),
        TrialEnd::At(at) => stripe::Scheduled::Timestamp(at.timestamp()),
    }
}

// ============================================================================
// ID Parsing Helpers
// ============================================================================

/// Parse a gateway ID into its typed SDK form.
fn parse_id<T: FromStr>(id: &str, operation: &str) -> Result<T> {
    id.parse().map_err(|_| {
        GatewayError::new(
            GatewayErrorKind::InvalidRequest,
            operation,
            format!("Invalid identifier: {id:?}"),
        )
        .with_status(400)
        .into()
    })
}

// ============================================================================
// Live gateway
// ============================================================================

/// Live Stripe gateway for production use.
///
/// # Example
///
/// ```rust,ignore
/// use cashier::{ConfigBuilder, StripeGateway};
///
/// let config = ConfigBuilder::new().from_env().build()?;
/// let gateway = StripeGateway::from_config(&config)?;
/// ```
#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
    config: GatewayConfig,
}

impl StripeGateway {
    /// Create a gateway from adapter settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        validate_api_key(config.api_key.expose_secret())?;

        let base_url = format!("{}/", config.base_url.trim_end_matches('/'));
        let client = stripe::Client::from_url(base_url.as_str(), config.api_key.expose_secret())
            .with_app_info(
                "cashier-rs".to_string(),
                Some(env!("CARGO_PKG_VERSION").to_string()),
                None,
            );

        Ok(Self { client, config })
    }

    pub fn from_config(config: &CashierConfig) -> Result<Self> {
        Self::new(config.gateway.clone())
    }

    /// Check if the gateway is using a test mode API key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.config.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    #[inline]
    fn generate_idempotency_key(operation: &str) -> String {
        format!("{}_{}", operation, uuid::Uuid::new_v4())
    }

    /// A client that sends one idempotency key across all retries of `operation`.
    #[inline]
    fn idempotent_client(&self, operation: &str) -> stripe::Client {
        let key = Self::generate_idempotency_key(operation);
        tracing::debug!(
            target: "cashier::gateway",
            operation = operation,
            "Sending gateway request"
        );
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key))
    }

    async fn fetch_subscription(
        &self,
        id: &stripe::SubscriptionId,
        operation: &str,
    ) -> Result<GatewaySubscription> {
        let subscription = with_retry(&self.config, operation, || {
            let client = self.client.clone();
            let id = id.clone();
            async move { stripe::Subscription::retrieve(&client, &id, EXPAND_LATEST_PAYMENT).await }
        })
        .await?;
        Ok(map_subscription(subscription))
    }

    async fn fetch_payment_intent(
        &self,
        id: &stripe::PaymentIntentId,
        operation: &str,
    ) -> Result<stripe::PaymentIntent> {
        with_retry(&self.config, operation, || {
            let client = self.client.clone();
            let id = id.clone();
            async move { stripe::PaymentIntent::retrieve(&client, &id, &[]).await }
        })
        .await
    }
}

// Debug implementation that doesn't expose the API key
impl std::fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGateway")
            .field("base_url", &self.config.base_url)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

impl Gateway for StripeGateway {
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<GatewayCustomer> {
        let operation = "create_customer";
        let client = self.idempotent_client(operation);

        let mut params = stripe::CreateCustomer::new();
        params.email = request.email.as_deref();
        params.name = request.name.as_deref();
        if !request.metadata.is_empty() {
            params.metadata = Some(request.metadata.clone());
        }
        if let Some(pm) = &request.payment_method {
            params.payment_method = Some(parse_id(pm, operation)?);
            params.invoice_settings = Some(stripe::CustomerInvoiceSettings {
                default_payment_method: Some(pm.clone()),
                ..Default::default()
            });
        }

        let customer = with_retry(&self.config, operation, || {
            let client = client.clone();
            let params = params.clone();
            async move { stripe::Customer::create(&client, params).await }
        })
        .await?;

        Ok(map_customer(customer))
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<()> {
        let operation = "set_default_payment_method";
        let customer: stripe::CustomerId = parse_id(customer_id, operation)?;
        let pm: stripe::PaymentMethodId = parse_id(payment_method_id, operation)?;

        let client = self.idempotent_client("attach_payment_method");
        with_retry(&self.config, operation, || {
            let client = client.clone();
            let pm = pm.clone();
            let params = stripe::AttachPaymentMethod {
                customer: customer.clone(),
            };
            async move { stripe::PaymentMethod::attach(&client, &pm, params).await }
        })
        .await?;

        let client = self.idempotent_client(operation);
        let mut params = stripe::UpdateCustomer::new();
        params.invoice_settings = Some(stripe::CustomerInvoiceSettings {
            default_payment_method: Some(payment_method_id.to_string()),
            ..Default::default()
        });
        with_retry(&self.config, operation, || {
            let client = client.clone();
            let customer = customer.clone();
            let params = params.clone();
            async move { stripe::Customer::update(&client, &customer, params).await }
        })
        .await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<GatewaySubscription> {
        let operation = "create_subscription";
        let client = self.idempotent_client(operation);

        let mut params = stripe::CreateSubscription::new(parse_id(&request.customer, operation)?);
        params.items = Some(
            request
                .items
                .iter()
                .map(|item| stripe::CreateSubscriptionItems {
                    price: Some(item.price.clone()),
                    quantity: item.quantity,
                    ..Default::default()
                })
                .collect(),
        );
        params.trial_end = request.trial_end.map(scheduled);
        if let Some(coupon) = &request.coupon {
            params.coupon = Some(parse_id(coupon, operation)?);
        }
        if let Some(code) = &request.promotion_code {
            params.promotion_code = Some(parse_id(code, operation)?);
        }
        if !request.metadata.is_empty() {
            params.metadata = Some(request.metadata.clone());
        }
        params.billing_cycle_anchor = request.billing_cycle_anchor.map(|at| at.timestamp());
        params.proration_behavior = request.proration_behavior.map(subscription_proration);
        params.payment_behavior = Some(subscription_payment(request.payment_behavior));
        params.default_payment_method = request.default_payment_method.as_deref();
        params.expand = EXPAND_LATEST_PAYMENT;

        let subscription = with_retry(&self.config, operation, || {
            let client = client.clone();
            let params = params.clone();
            async move { stripe::Subscription::create(&client, params).await }
        })
        .await?;

        Ok(map_subscription(subscription))
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
        let operation = "retrieve_subscription";
        let id = parse_id(subscription_id, operation)?;
        self.fetch_subscription(&id, operation).await
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        request: UpdateSubscriptionRequest,
    ) -> Result<GatewaySubscription> {
        let operation = "update_subscription";
        let id: stripe::SubscriptionId = parse_id(subscription_id, operation)?;
        let client = self.idempotent_client(operation);

        let mut params = stripe::UpdateSubscription::new();
        if !request.items.is_empty() {
            params.items = Some(
                request
                    .items
                    .iter()
                    .map(|item| stripe::UpdateSubscriptionItems {
                        id: item.id.clone(),
                        price: item.price.clone(),
                        quantity: item.quantity,
                        deleted: item.deleted.then_some(true),
                        ..Default::default()
                    })
                    .collect(),
            );
        }
        params.trial_end = request.trial_end.map(scheduled);
        params.proration_behavior = request.proration_behavior.map(subscription_proration);
        params.billing_cycle_anchor = request.billing_cycle_anchor.map(billing_cycle_anchor);
        params.cancel_at_period_end = request.cancel_at_period_end;
        params.cancel_at = request.cancel_at.map(|at| at.timestamp());
        params.payment_behavior = request.payment_behavior.map(subscription_payment);
        params.expand = EXPAND_LATEST_PAYMENT;

        let subscription = with_retry(&self.config, operation, || {
            let client = client.clone();
            let id = id.clone();
            let params = params.clone();
            async move { stripe::Subscription::update(&client, &id, params).await }
        })
        .await?;

        Ok(map_subscription(subscription))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        request: CancelSubscriptionRequest,
    ) -> Result<GatewaySubscription> {
        let operation = "cancel_subscription";
        let id: stripe::SubscriptionId = parse_id(subscription_id, operation)?;

        if request.at_period_end {
            let client = self.idempotent_client(operation);
            let mut params = stripe::UpdateSubscription::new();
            params.cancel_at_period_end = Some(true);
            params.expand = EXPAND_LATEST_PAYMENT;

            let subscription = with_retry(&self.config, operation, || {
                let client = client.clone();
                let id = id.clone();
                let params = params.clone();
                async move { stripe::Subscription::update(&client, &id, params).await }
            })
            .await?;
            return Ok(map_subscription(subscription));
        }

        let mut params = stripe::CancelSubscription::default();
        params.invoice_now = Some(request.invoice_now);
        params.prorate = Some(request.prorate);

        let subscription = with_retry(&self.config, operation, || {
            let client = self.client.clone();
            let id = id.clone();
            let params = params.clone();
            async move { stripe::Subscription::cancel(&client, &id, params).await }
        })
        .await?;

        Ok(map_subscription(subscription))
    }

    async fn create_subscription_item(
        &self,
        request: CreateSubscriptionItemRequest,
    ) -> Result<GatewaySubscriptionItem> {
        let operation = "create_subscription_item";
        let client = self.idempotent_client(operation);

        let mut params =
            stripe::CreateSubscriptionItem::new(parse_id(&request.subscription, operation)?);
        params.price = Some(parse_id(&request.price, operation)?);
        params.quantity = request.quantity;
        params.proration_behavior = Some(item_proration(request.proration_behavior));
        params.payment_behavior = Some(item_payment(request.payment_behavior));

        let item = with_retry(&self.config, operation, || {
            let client = client.clone();
            let params = params.clone();
            async move { stripe::SubscriptionItem::create(&client, params).await }
        })
        .await?;

        item_or_invalid(item, operation)
    }

    async fn update_subscription_item(
        &self,
        item_id: &str,
        request: UpdateSubscriptionItemRequest,
    ) -> Result<GatewaySubscriptionItem> {
        let operation = "update_subscription_item";
        let id: stripe::SubscriptionItemId = parse_id(item_id, operation)?;
        let client = self.idempotent_client(operation);

        let mut params = stripe::UpdateSubscriptionItem::new();
        if let Some(price) = &request.price {
            params.price = Some(parse_id(price, operation)?);
        }
        params.quantity = request.quantity;
        params.proration_behavior = request.proration_behavior.map(item_proration);
        params.payment_behavior = request.payment_behavior.map(item_payment);

        let item = with_retry(&self.config, operation, || {
            let client = client.clone();
            let id = id.clone();
            let params = params.clone();
            async move { stripe::SubscriptionItem::update(&client, &id, params).await }
        })
        .await?;

        item_or_invalid(item, operation)
    }

    async fn delete_subscription_item(
        &self,
        item_id: &str,
        request: DeleteSubscriptionItemRequest,
    ) -> Result<()> {
        let operation = "delete_subscription_item";
        let id: stripe::SubscriptionItemId = parse_id(item_id, operation)?;
        let path = format!("/subscription_items/{id}");
        let params = DeleteSubscriptionItemParams {
            proration_behavior: item_proration(request.proration_behavior),
            clear_usage: request.clear_usage,
        };

        with_retry(&self.config, operation, || {
            self.client
                .delete_query::<IgnoredAny, _>(&path, params.clone())
        })
        .await?;
        Ok(())
    }

    async fn create_invoice(
        &self,
        customer_id: &str,
        subscription_id: Option<&str>,
    ) -> Result<GatewayInvoice> {
        let operation = "create_invoice";
        let client = self.idempotent_client(operation);

        let mut params = stripe::CreateInvoice::new();
        params.customer = Some(parse_id(customer_id, operation)?);
        if let Some(subscription_id) = subscription_id {
            params.subscription = Some(parse_id(subscription_id, operation)?);
        }
        params.pending_invoice_items_behavior =
            Some(stripe::InvoicePendingInvoiceItemsBehavior::Include);

        let invoice = with_retry(&self.config, operation, || {
            let client = client.clone();
            let params = params.clone();
            async move { stripe::Invoice::create(&client, params).await }
        })
        .await?;

        Ok(map_invoice(invoice))
    }

    async fn pay_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice> {
        let operation = "pay_invoice";
        let id: stripe::InvoiceId = parse_id(invoice_id, operation)?;
        let client = self.idempotent_client(operation);

        let invoice = with_retry(&self.config, operation, || {
            let client = client.clone();
            let id = id.clone();
            async move { stripe::Invoice::pay(&client, &id).await }
        })
        .await?;

        let mut invoice = map_invoice(invoice);
        if let Some(Expandable::Id(intent_id)) = &invoice.payment_intent {
            let intent = self
                .fetch_payment_intent(&parse_id(intent_id, operation)?, operation)
                .await?;
            invoice.payment_intent = Some(Expandable::Object(Box::new(map_payment_intent(intent))));
        }
        Ok(invoice)
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<GatewayPaymentIntent> {
        let operation = "retrieve_payment_intent";
        let id = parse_id(payment_intent_id, operation)?;
        let intent = self.fetch_payment_intent(&id, operation).await?;
        Ok(map_payment_intent(intent))
    }

    async fn confirm_payment_intent(
        &self,
        payment_intent_id: &str,
        payment_method: Option<&str>,
    ) -> Result<GatewayPaymentIntent> {
        let operation = "confirm_payment_intent";
        let id: stripe::PaymentIntentId = parse_id(payment_intent_id, operation)?;
        let client = self.idempotent_client(operation);
        let path = format!("/payment_intents/{id}/confirm");
        let params = ConfirmPaymentIntentParams { payment_method };

        let intent = with_retry(&self.config, operation, || {
            client.post_form::<stripe::PaymentIntent, _>(&path, params.clone())
        })
        .await?;

        Ok(map_payment_intent(intent))
    }
}

// ============================================================================
// Response mapping
// ============================================================================

/// Some SDK objects carry optional metadata, others always have it.
fn metadata_map(metadata: impl Into<Option<HashMap<String, String>>>) -> HashMap<String, String> {
    metadata.into().unwrap_or_default()
}

fn map_customer(customer: stripe::Customer) -> GatewayCustomer {
    GatewayCustomer {
        id: customer.id.to_string(),
        email: customer.email,
        name: customer.name,
        metadata: metadata_map(customer.metadata),
    }
}

fn map_price(price: stripe::Price) -> GatewayPrice {
    GatewayPrice {
        id: price.id.to_string(),
        product: price.product.as_ref().map(|p| p.id().to_string()),
        recurring: price.recurring.map(|r| GatewayRecurring {
            interval: Some(r.interval.to_string()),
            usage_type: Some(r.usage_type.to_string()),
        }),
    }
}

/// Items without a price cannot be reconciled.
fn map_item(item: stripe::SubscriptionItem) -> Option<GatewaySubscriptionItem> {
    Some(GatewaySubscriptionItem {
        id: item.id.to_string(),
        price: map_price(item.price?),
        quantity: item.quantity,
        current_period_end: None,
    })
}

fn item_or_invalid(item: stripe::SubscriptionItem, operation: &str) -> Result<GatewaySubscriptionItem> {
    let id = item.id.to_string();
    map_item(item).ok_or_else(|| {
        CashierError::invalid_payload(format!(
            "Subscription item '{id}' returned by {operation} has no price"
        ))
    })
}

fn map_subscription(subscription: stripe::Subscription) -> GatewaySubscription {
    GatewaySubscription {
        id: subscription.id.to_string(),
        customer: subscription.customer.id().to_string(),
        status: subscription.status.to_string(),
        items: subscription
            .items
            .data
            .into_iter()
            .filter_map(map_item)
            .collect::<Vec<_>>()
            .into(),
        trial_end: subscription.trial_end,
        current_period_end: Some(subscription.current_period_end),
        cancel_at_period_end: subscription.cancel_at_period_end,
        cancel_at: subscription.cancel_at,
        canceled_at: subscription.canceled_at,
        ended_at: subscription.ended_at,
        latest_invoice: subscription.latest_invoice.map(|invoice| match invoice {
            stripe::Expandable::Id(id) => Expandable::Id(id.to_string()),
            stripe::Expandable::Object(invoice) => {
                Expandable::Object(Box::new(map_invoice(*invoice)))
            }
        }),
        metadata: metadata_map(subscription.metadata),
    }
}

fn map_invoice(invoice: stripe::Invoice) -> GatewayInvoice {
    GatewayInvoice {
        id: invoice.id.to_string(),
        customer: invoice.customer.as_ref().map(|c| c.id().to_string()),
        subscription: invoice.subscription.as_ref().map(|s| s.id().to_string()),
        status: invoice.status.map(|s| s.to_string()),
        amount_due: invoice.amount_due.unwrap_or(0),
        currency: invoice.currency.map(|c| c.to_string()).unwrap_or_default(),
        payment_intent: invoice.payment_intent.map(|intent| match intent {
            stripe::Expandable::Id(id) => Expandable::Id(id.to_string()),
            stripe::Expandable::Object(intent) => {
                Expandable::Object(Box::new(map_payment_intent(*intent)))
            }
        }),
        hosted_invoice_url: invoice.hosted_invoice_url,
    }
}

fn map_payment_intent(intent: stripe::PaymentIntent) -> GatewayPaymentIntent {
    GatewayPaymentIntent {
        id: intent.id.to_string(),
        amount: intent.amount,
        currency: intent.currency.to_string(),
        status: intent.status.to_string(),
        client_secret: intent.client_secret,
        customer: intent.customer.as_ref().map(|c| c.id().to_string()),
        invoice: intent.invoice.as_ref().map(|i| i.id().to_string()),
        payment_method: intent.payment_method.as_ref().map(|pm| pm.id().to_string()),
    }
}

// ============================================================================
// Retry Logic
// ============================================================================

/// Execute an async operation with retry logic and timeout.
///
/// Retries on:
/// - HTTP 429 (Rate Limited)
/// - HTTP 5xx (Server Errors)
/// - Timeouts
async fn with_retry<T, F, Fut>(config: &GatewayConfig, operation: &str, operation_fn: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, stripe::StripeError>>,
{
    let timeout_duration = Duration::from_secs(config.timeout_seconds);
    let mut attempts = 0;

    loop {
        let result = tokio::time::timeout(timeout_duration, operation_fn()).await;

        match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                if !is_retryable_error(&e) || attempts >= config.max_retries {
                    return Err(map_stripe_error(e, operation).into());
                }

                log_retry(operation, attempts, &e, config);
                sleep_with_backoff(attempts, config).await;
                attempts += 1;
            }
            Err(_timeout) => {
                if attempts >= config.max_retries {
                    return Err(GatewayError::new(
                        GatewayErrorKind::Timeout,
                        operation,
                        format!("Request timed out after {} seconds", config.timeout_seconds),
                    )
                    .with_status(408)
                    .into());
                }

                tracing::warn!(
                    target: "cashier::gateway",
                    operation = operation,
                    attempt = attempts + 1,
                    timeout_seconds = config.timeout_seconds,
                    "Gateway request timed out, retrying"
                );

                sleep_with_backoff(attempts, config).await;
                attempts += 1;
            }
        }
    }
}

#[inline]
fn log_retry(operation: &str, attempts: u32, error: &stripe::StripeError, config: &GatewayConfig) {
    let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
    tracing::warn!(
        target: "cashier::gateway",
        operation = operation,
        attempt = attempts + 1,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Retrying gateway call after transient error"
    );
}

#[inline]
async fn sleep_with_backoff(attempts: u32, config: &GatewayConfig) {
    let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
    tokio::time::sleep(delay).await;
}

#[inline]
fn is_retryable_error(error: &stripe::StripeError) -> bool {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            status == 429 || (500..600).contains(&status)
        }
        stripe::StripeError::Timeout => true,
        _ => false,
    }
}

/// Calculate backoff delay with exponential backoff and jitter.
#[inline]
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    // Jitter of 0-25%
    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

// ============================================================================
// Error Mapping
// ============================================================================

/// `InvoiceNoCustomerLineItems` -> `invoice_no_customer_line_items`.
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 8);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn request_error_kind(request_error: &stripe::RequestError) -> GatewayErrorKind {
    match format!("{:?}", request_error.error_type).as_str() {
        "Card" => GatewayErrorKind::Card,
        "InvalidRequest" | "IdempotencyError" | "Idempotency" | "Validation" => {
            GatewayErrorKind::InvalidRequest
        }
        "Authentication" => GatewayErrorKind::Authentication,
        "RateLimit" => GatewayErrorKind::RateLimit,
        "Connection" => GatewayErrorKind::Connection,
        _ if request_error.http_status == 429 => GatewayErrorKind::RateLimit,
        _ => GatewayErrorKind::Api,
    }
}

fn map_stripe_error(error: stripe::StripeError, operation: &str) -> GatewayError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let mut mapped = GatewayError::new(
                request_error_kind(&request_error),
                operation,
                request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            )
            .with_status(request_error.http_status);
            mapped.code = request_error
                .code
                .as_ref()
                .map(|c| snake_case(&format!("{c:?}")));
            mapped.decline_code = request_error.decline_code.clone();
            mapped
        }
        stripe::StripeError::Timeout => {
            GatewayError::new(GatewayErrorKind::Timeout, operation, "Request timed out")
                .with_status(408)
        }
        stripe::StripeError::ClientError(msg) => GatewayError::new(
            GatewayErrorKind::Connection,
            operation,
            format!("HTTP client error: {msg}"),
        ),
        stripe::StripeError::JSONSerialize(e) => GatewayError::new(
            GatewayErrorKind::Decode,
            operation,
            format!("Failed to decode response: {e}"),
        ),
        other => GatewayError::new(GatewayErrorKind::Api, operation, other.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn test_config(key: &str) -> GatewayConfig {
        GatewayConfig {
            api_key: SecretString::from(key.to_string()),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_new_validates_api_key() {
        assert!(StripeGateway::new(test_config("sk_test_12345678901234567890")).is_ok());
        assert!(StripeGateway::new(test_config("pk_test_12345678901234567890")).is_err());
        assert!(StripeGateway::new(test_config("")).is_err());
    }

    #[test]
    fn test_is_test_mode() {
        let gateway = StripeGateway::new(test_config("sk_test_12345678901234567890")).unwrap();
        assert!(gateway.is_test_mode());

        let gateway = StripeGateway::new(test_config("sk_live_12345678901234567890")).unwrap();
        assert!(!gateway.is_test_mode());
    }

    #[test]
    fn test_debug_does_not_expose_api_key() {
        let gateway =
            StripeGateway::new(test_config("sk_test_secret_key_1234567890")).unwrap();
        let debug_output = format!("{:?}", gateway);

        assert!(!debug_output.contains("sk_test_secret_key_1234567890"));
        assert!(debug_output.contains("is_test_mode: true"));
    }

    #[test]
    fn test_timeout_getter() {
        let mut config = test_config("sk_test_12345678901234567890");
        config.timeout_seconds = 45;
        let gateway = StripeGateway::new(config).unwrap();
        assert_eq!(gateway.timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_backoff_calculation() {
        let delay0 = calculate_backoff_delay(0, 500, 30_000);
        assert!(delay0.as_millis() >= 500 && delay0.as_millis() <= 625);

        let delay2 = calculate_backoff_delay(2, 500, 30_000);
        assert!(delay2.as_millis() >= 2000 && delay2.as_millis() <= 2500);

        let delay_high = calculate_backoff_delay(10, 500, 30_000);
        assert!(delay_high.as_millis() <= 30_000 + 7_500);

        assert_eq!(calculate_backoff_delay(0, 0, 1000).as_millis(), 0);
    }

    #[test]
    fn test_idempotency_key_generation() {
        let key1 = StripeGateway::generate_idempotency_key("create_subscription");
        let key2 = StripeGateway::generate_idempotency_key("create_subscription");
        assert!(key1.starts_with("create_subscription_"));
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_error_codes_become_snake_case() {
        assert_eq!(
            snake_case("InvoiceNoCustomerLineItems"),
            "invoice_no_customer_line_items"
        );
        assert_eq!(snake_case("ResourceMissing"), "resource_missing");
        assert_eq!(snake_case(""), "");
    }

    #[test]
    fn test_option_mapping() {
        assert_eq!(
            subscription_proration(ProrationBehavior::AlwaysInvoice).to_string(),
            "always_invoice"
        );
        assert_eq!(item_proration(ProrationBehavior::None).to_string(), "none");
        assert_eq!(
            subscription_payment(PaymentBehavior::DefaultIncomplete).to_string(),
            "default_incomplete"
        );
        assert_eq!(
            item_payment(PaymentBehavior::PendingIfIncomplete).to_string(),
            "pending_if_incomplete"
        );
        assert_eq!(billing_cycle_anchor(BillingCycleAnchor::Now).to_string(), "now");
    }

    #[test]
    fn test_parse_id_rejects_wrong_prefix() {
        let err = parse_id::<stripe::SubscriptionId>("cus_123", "retrieve_subscription").unwrap_err();
        match err {
            CashierError::Gateway(err) => {
                assert_eq!(err.kind, GatewayErrorKind::InvalidRequest);
                assert_eq!(err.http_status, Some(400));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(parse_id::<stripe::SubscriptionId>("sub_123", "retrieve_subscription").is_ok());
    }

    #[test]
    fn test_sdk_only_params_serialize_sparse() {
        let params = DeleteSubscriptionItemParams {
            proration_behavior: item_proration(ProrationBehavior::None),
            clear_usage: false,
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            serde_json::json!({"proration_behavior": "none"})
        );

        let params = ConfirmPaymentIntentParams {
            payment_method: None,
        };
        assert_eq!(serde_json::to_value(&params).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn test_timeout_error_is_retryable() {
        assert!(is_retryable_error(&stripe::StripeError::Timeout));
        let err = map_stripe_error(stripe::StripeError::Timeout, "retrieve_subscription");
        assert_eq!(err.kind, GatewayErrorKind::Timeout);
        assert_eq!(err.http_status, Some(408));
        assert!(err.is_retryable());

        let err = map_stripe_error(
            stripe::StripeError::ClientError("connection reset".into()),
            "retrieve_subscription",
        );
        assert_eq!(err.kind, GatewayErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_non_retryable() {
        let config = GatewayConfig {
            max_retries: 3,
            base_delay_ms: 1,
            ..GatewayConfig::default()
        };
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = with_retry(&config, "pay_invoice", || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(stripe::StripeError::ClientError("bad request".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_retries_transient_failures() {
        let config = GatewayConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..GatewayConfig::default()
        };
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32> = with_retry(&config, "retrieve_subscription", || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(stripe::StripeError::Timeout)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
