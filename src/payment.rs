//! Payments and incomplete-payment handling.
//!
//! A [`Payment`] wraps one gateway payment intent. [`Payment::validate`] turns
//! intent states that need the customer's attention into typed errors, and
//! [`PaymentFailureHandler`] tries to settle an incomplete subscription
//! payment after a lifecycle operation.

use chrono::Utc;

use crate::error::{CashierError, Result};
use crate::gateway::{Gateway, GatewayPaymentIntent, GatewaySubscription};
use crate::storage::{SubscriptionStore, save_after_remote};
use crate::subscription::Subscription;

/// Status of a payment intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    Other(String),
}

impl PaymentStatus {
    #[must_use]
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "requires_payment_method" => Self::RequiresPaymentMethod,
            "requires_confirmation" => Self::RequiresConfirmation,
            "requires_action" => Self::RequiresAction,
            "processing" => Self::Processing,
            "requires_capture" => Self::RequiresCapture,
            "canceled" => Self::Canceled,
            "succeeded" => Self::Succeeded,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresAction => "requires_action",
            Self::Processing => "processing",
            Self::RequiresCapture => "requires_capture",
            Self::Canceled => "canceled",
            Self::Succeeded => "succeeded",
            Self::Other(other) => other,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gateway payment intent.
#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    intent: GatewayPaymentIntent,
}

impl Payment {
    #[must_use]
    pub fn new(intent: GatewayPaymentIntent) -> Self {
        Self { intent }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.intent.id
    }

    #[must_use]
    pub fn status(&self) -> PaymentStatus {
        PaymentStatus::from_gateway(&self.intent.status)
    }

    /// Amount in minor units.
    #[must_use]
    pub fn raw_amount(&self) -> i64 {
        self.intent.amount
    }

    #[must_use]
    pub fn currency(&self) -> &str {
        &self.intent.currency
    }

    /// Secret the client needs to finish a confirmation step.
    #[must_use]
    pub fn client_secret(&self) -> Option<&str> {
        self.intent.client_secret.as_deref()
    }

    #[must_use]
    pub fn requires_payment_method(&self) -> bool {
        self.status() == PaymentStatus::RequiresPaymentMethod
    }

    #[must_use]
    pub fn requires_action(&self) -> bool {
        self.status() == PaymentStatus::RequiresAction
    }

    #[must_use]
    pub fn requires_confirmation(&self) -> bool {
        self.status() == PaymentStatus::RequiresConfirmation
    }

    #[must_use]
    pub fn requires_capture(&self) -> bool {
        self.status() == PaymentStatus::RequiresCapture
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.status() == PaymentStatus::Processing
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.status() == PaymentStatus::Succeeded
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status() == PaymentStatus::Canceled
    }

    #[must_use]
    pub fn intent(&self) -> &GatewayPaymentIntent {
        &self.intent
    }

    #[must_use]
    pub fn into_intent(self) -> GatewayPaymentIntent {
        self.intent
    }

    /// Raise the typed error for intents that need the customer.
    ///
    /// # Errors
    ///
    /// - [`CashierError::PaymentFailure`] when a new payment method is needed
    /// - [`CashierError::PaymentActionRequired`] when a confirmation step is needed
    pub fn validate(&self) -> Result<()> {
        match self.status() {
            PaymentStatus::RequiresPaymentMethod => {
                Err(CashierError::PaymentFailure(Box::new(self.clone())))
            }
            PaymentStatus::RequiresAction | PaymentStatus::RequiresConfirmation => {
                Err(CashierError::PaymentActionRequired(Box::new(self.clone())))
            }
            _ => Ok(()),
        }
    }
}

impl From<GatewayPaymentIntent> for Payment {
    fn from(intent: GatewayPaymentIntent) -> Self {
        Self::new(intent)
    }
}

/// The payment of a remote subscription's latest invoice, if any.
///
/// Uses the expanded intent when present and fetches it otherwise.
pub async fn latest_payment_of<G: Gateway>(
    gateway: &G,
    remote: &GatewaySubscription,
) -> Result<Option<Payment>> {
    if let Some(intent) = remote.latest_payment_intent() {
        return Ok(Some(Payment::new(intent.clone())));
    }
    match remote.latest_payment_intent_id() {
        Some(id) => Ok(Some(Payment::new(gateway.retrieve_payment_intent(id).await?))),
        None => Ok(None),
    }
}

/// Fetch the latest payment of a gateway subscription.
pub async fn latest_payment<G: Gateway>(gateway: &G, gateway_id: &str) -> Result<Option<Payment>> {
    let remote = gateway.retrieve_subscription(gateway_id).await?;
    latest_payment_of(gateway, &remote).await
}

// =============================================================================
// Failure handling
// =============================================================================

/// Settles an incomplete payment left behind by a lifecycle operation.
pub struct PaymentFailureHandler<'a, S: SubscriptionStore, G: Gateway> {
    store: &'a S,
    gateway: &'a G,
}

impl<'a, S: SubscriptionStore, G: Gateway> PaymentFailureHandler<'a, S, G> {
    #[must_use]
    pub fn new(store: &'a S, gateway: &'a G) -> Self {
        Self { store, gateway }
    }

    /// Validate the latest payment and try to confirm it when it needs action.
    ///
    /// Does nothing unless the subscription has an incomplete payment. A
    /// payment that needs a new payment method fails immediately. One that
    /// needs action is confirmed with `payment_method` (or the customer's
    /// default); the local status is then refreshed from the gateway and, if
    /// the payment is still incomplete, the confirmed intent is validated.
    pub async fn handle(
        &self,
        subscription: &mut Subscription,
        payment_method: Option<&str>,
    ) -> Result<()> {
        if !subscription.has_incomplete_payment() {
            return Ok(());
        }

        let Some(payment) = latest_payment(self.gateway, &subscription.gateway_id).await? else {
            return Ok(());
        };

        let payment = match payment.validate() {
            Ok(()) => return Ok(()),
            Err(CashierError::PaymentActionRequired(payment)) => payment,
            Err(err) => return Err(err),
        };

        tracing::info!(
            target: "cashier::payment",
            subscription_id = %subscription.id,
            payment_id = payment.id(),
            status = %payment.status(),
            "Confirming incomplete payment"
        );

        let intent = match self
            .gateway
            .confirm_payment_intent(payment.id(), payment_method)
            .await
        {
            Ok(intent) => intent,
            Err(CashierError::Gateway(err)) if err.is_card_error() => {
                tracing::warn!(
                    target: "cashier::payment",
                    payment_id = payment.id(),
                    error = %err,
                    "Confirmation declined, refreshing payment"
                );
                self.gateway.retrieve_payment_intent(payment.id()).await?
            }
            Err(err) => return Err(err),
        };

        let remote = self
            .gateway
            .retrieve_subscription(&subscription.gateway_id)
            .await?;
        subscription.status = remote.subscription_status();
        subscription.updated_at = Utc::now();
        save_after_remote(self.store, subscription).await?;

        if subscription.has_incomplete_payment() {
            Payment::new(intent).validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::gateway::{CreateCustomerRequest, CreateSubscriptionRequest, SubscriptionItemParams};
    use crate::storage::test::InMemorySubscriptionStore;

    fn create_test_intent(status: &str) -> GatewayPaymentIntent {
        GatewayPaymentIntent {
            id: "pi_123".to_string(),
            amount: 2500,
            currency: "usd".to_string(),
            status: status.to_string(),
            client_secret: Some("pi_123_secret".to_string()),
            customer: None,
            invoice: None,
            payment_method: None,
        }
    }

    async fn create_incomplete_subscription(
        store: &InMemorySubscriptionStore,
        gateway: &MockGateway,
        status: &str,
    ) -> Subscription {
        let customer = gateway
            .create_customer(CreateCustomerRequest {
                payment_method: Some("pm_card_visa".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        gateway.set_next_payment_status(status);
        let remote = gateway
            .create_subscription(CreateSubscriptionRequest {
                customer: customer.id,
                items: vec![SubscriptionItemParams {
                    price: "price_basic".to_string(),
                    quantity: Some(1),
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        let sub = Subscription::from_gateway("user_1", "user", "default", &remote);
        store.save_subscription(&sub).await.unwrap();
        sub
    }

    #[test]
    fn test_validate() {
        assert!(Payment::new(create_test_intent("succeeded")).validate().is_ok());
        assert!(Payment::new(create_test_intent("processing")).validate().is_ok());

        let err = Payment::new(create_test_intent("requires_payment_method"))
            .validate()
            .unwrap_err();
        assert!(matches!(err, CashierError::PaymentFailure(_)));

        for status in ["requires_action", "requires_confirmation"] {
            let err = Payment::new(create_test_intent(status)).validate().unwrap_err();
            let payment = err.payment().unwrap();
            assert_eq!(payment.client_secret(), Some("pi_123_secret"));
            assert!(matches!(err, CashierError::PaymentActionRequired(_)));
        }
    }

    #[test]
    fn test_payment_helpers() {
        let payment = Payment::new(create_test_intent("requires_action"));
        assert!(payment.requires_action());
        assert!(!payment.requires_payment_method());
        assert!(!payment.is_succeeded());
        assert_eq!(payment.raw_amount(), 2500);
        assert_eq!(payment.currency(), "usd");
        assert_eq!(
            PaymentStatus::from_gateway("mystery"),
            PaymentStatus::Other("mystery".to_string())
        );
    }

    #[tokio::test]
    async fn test_handler_ignores_complete_subscriptions() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockGateway::new();
        let mut sub = create_incomplete_subscription(&store, &gateway, "succeeded").await;
        assert!(!sub.has_incomplete_payment());

        PaymentFailureHandler::new(&store, &gateway)
            .handle(&mut sub, None)
            .await
            .unwrap();
        assert!(!gateway.calls().contains(&"confirm_payment_intent".to_string()));
    }

    #[tokio::test]
    async fn test_handler_confirms_and_resolves() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockGateway::new();
        let mut sub = create_incomplete_subscription(&store, &gateway, "requires_confirmation").await;
        assert!(sub.incomplete());

        PaymentFailureHandler::new(&store, &gateway)
            .handle(&mut sub, None)
            .await
            .unwrap();

        assert_eq!(sub.status.as_str(), "active");
        let stored = store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status.as_str(), "active");
    }

    #[tokio::test]
    async fn test_handler_raises_when_action_still_required() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockGateway::new();
        let mut sub = create_incomplete_subscription(&store, &gateway, "requires_action").await;

        let err = PaymentFailureHandler::new(&store, &gateway)
            .handle(&mut sub, None)
            .await
            .unwrap_err();

        let payment = err.payment().unwrap();
        assert!(payment.requires_action());
        assert!(sub.incomplete());
    }

    #[tokio::test]
    async fn test_handler_falls_back_to_fetch_on_decline() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockGateway::new();
        let mut sub = create_incomplete_subscription(&store, &gateway, "requires_confirmation").await;
        gateway.set_next_confirm_status("requires_payment_method");

        let err = PaymentFailureHandler::new(&store, &gateway)
            .handle(&mut sub, Some("pm_card_chargeDeclined"))
            .await
            .unwrap_err();

        assert!(matches!(err, CashierError::PaymentFailure(_)));
        assert!(gateway.calls().contains(&"retrieve_payment_intent".to_string()));
    }

    #[tokio::test]
    async fn test_handler_fails_fast_on_missing_payment_method() {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockGateway::new();
        let mut sub =
            create_incomplete_subscription(&store, &gateway, "requires_payment_method").await;

        let err = PaymentFailureHandler::new(&store, &gateway)
            .handle(&mut sub, None)
            .await
            .unwrap_err();

        assert!(matches!(err, CashierError::PaymentFailure(_)));
        assert!(!gateway.calls().contains(&"confirm_payment_intent".to_string()));
    }
}
