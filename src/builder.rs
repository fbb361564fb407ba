//! Subscription creation.
//!
//! [`SubscriptionBuilder`] collects prices, trial and discount settings,
//! creates the remote subscription and persists the local record, even when
//! the first payment is incomplete.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::customer::{Billable, CustomerOptions};
use crate::error::{CashierError, Result, SubscriptionUpdateFailure};
use crate::gateway::{
    CreateSubscriptionRequest, Gateway, PaymentBehavior, ProrationBehavior,
    SubscriptionItemParams, TrialEnd,
};
use crate::manager::SubscriptionManager;
use crate::payment::{Payment, latest_payment_of};
use crate::storage::{SubscriptionStore, save_created_after_remote};
use crate::subscription::Subscription;

/// Metadata key carrying the subscription name on the gateway.
pub const META_SUBSCRIPTION_NAME: &str = "name";

/// Result of creating a subscription.
///
/// The local record exists in every variant.
#[derive(Debug, Clone)]
pub enum SubscriptionOutcome {
    /// The subscription is paid for, on trial, or needs no payment.
    Complete(Subscription),
    /// The first payment needs a confirmation step (3D Secure etc).
    RequiresAction {
        subscription: Subscription,
        payment: Payment,
    },
    /// The first payment needs a new payment method.
    PaymentFailed {
        subscription: Subscription,
        payment: Payment,
    },
}

impl SubscriptionOutcome {
    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        match self {
            Self::Complete(subscription)
            | Self::RequiresAction { subscription, .. }
            | Self::PaymentFailed { subscription, .. } => subscription,
        }
    }

    #[must_use]
    pub fn into_subscription(self) -> Subscription {
        match self {
            Self::Complete(subscription)
            | Self::RequiresAction { subscription, .. }
            | Self::PaymentFailed { subscription, .. } => subscription,
        }
    }

    #[must_use]
    pub fn payment(&self) -> Option<&Payment> {
        match self {
            Self::Complete(_) => None,
            Self::RequiresAction { payment, .. } | Self::PaymentFailed { payment, .. } => {
                Some(payment)
            }
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// Convert incomplete outcomes into payment errors.
    ///
    /// The local record is persisted either way.
    pub fn into_result(self) -> Result<Subscription> {
        match self {
            Self::Complete(subscription) => Ok(subscription),
            Self::RequiresAction { payment, .. } => {
                Err(CashierError::PaymentActionRequired(Box::new(payment)))
            }
            Self::PaymentFailed { payment, .. } => {
                Err(CashierError::PaymentFailure(Box::new(payment)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrialSetting {
    None,
    Until(DateTime<Utc>),
    Days(u32),
    Skip,
}

/// Builder for a new subscription.
///
/// # Example
///
/// ```rust,ignore
/// let subscription = manager
///     .new_subscription(&user, "default")
///     .price("price_monthly")
///     .trial_days(14)
///     .create(Some("pm_card_visa"), CustomerOptions::default())
///     .await?
///     .into_result()?;
/// ```
#[must_use = "a builder does nothing until `create` or `add` is awaited"]
pub struct SubscriptionBuilder<'a, S: SubscriptionStore, G: Gateway> {
    manager: &'a SubscriptionManager<S, G>,
    owner: &'a dyn Billable,
    name: String,
    items: Vec<SubscriptionItemParams>,
    quantity: Option<u64>,
    trial: TrialSetting,
    coupon: Option<String>,
    promotion_code: Option<String>,
    metadata: HashMap<String, String>,
    billing_cycle_anchor: Option<DateTime<Utc>>,
    proration: Option<ProrationBehavior>,
    payment_behavior: PaymentBehavior,
}

impl<'a, S: SubscriptionStore, G: Gateway> SubscriptionBuilder<'a, S, G> {
    pub(crate) fn new(
        manager: &'a SubscriptionManager<S, G>,
        owner: &'a dyn Billable,
        name: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            owner,
            name: name.into(),
            items: Vec::new(),
            quantity: None,
            trial: TrialSetting::None,
            coupon: None,
            promotion_code: None,
            metadata: HashMap::new(),
            billing_cycle_anchor: None,
            proration: None,
            payment_behavior: PaymentBehavior::DefaultIncomplete,
        }
    }

    /// Add a licensed price with quantity 1.
    pub fn price(self, price: impl Into<String>) -> Self {
        self.price_with_quantity(price, 1)
    }

    pub fn price_with_quantity(mut self, price: impl Into<String>, quantity: u64) -> Self {
        self.items.push(SubscriptionItemParams {
            price: price.into(),
            quantity: Some(quantity),
        });
        self
    }

    /// Add a usage-based price. Metered items carry no quantity.
    pub fn metered_price(mut self, price: impl Into<String>) -> Self {
        self.items.push(SubscriptionItemParams {
            price: price.into(),
            quantity: None,
        });
        self
    }

    /// Quantity for a single-price subscription.
    pub fn quantity(mut self, quantity: u64) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn trial_days(mut self, days: u32) -> Self {
        self.trial = TrialSetting::Days(days);
        self
    }

    pub fn trial_until(mut self, until: DateTime<Utc>) -> Self {
        self.trial = TrialSetting::Until(until);
        self
    }

    /// Start billing immediately, even if the price defines a trial.
    pub fn skip_trial(mut self) -> Self {
        self.trial = TrialSetting::Skip;
        self
    }

    pub fn with_coupon(mut self, coupon: impl Into<String>) -> Self {
        self.coupon = Some(coupon.into());
        self
    }

    pub fn with_promotion_code(mut self, promotion_code: impl Into<String>) -> Self {
        self.promotion_code = Some(promotion_code.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn anchor_billing_cycle_on(mut self, anchor: DateTime<Utc>) -> Self {
        self.billing_cycle_anchor = Some(anchor);
        self
    }

    /// Don't prorate the partial first period of an anchored cycle.
    pub fn no_prorate(mut self) -> Self {
        self.proration = Some(ProrationBehavior::None);
        self
    }

    /// Have the gateway reject the subscription if the first payment fails.
    ///
    /// Nothing is persisted in that case.
    pub fn error_if_payment_fails(mut self) -> Self {
        self.payment_behavior = PaymentBehavior::ErrorIfIncomplete;
        self
    }

    /// Create the subscription for a customer without a new payment method.
    pub async fn add(self) -> Result<SubscriptionOutcome> {
        self.create(None, CustomerOptions::default()).await
    }

    /// Create the customer if needed, then the remote subscription, then the
    /// local record.
    ///
    /// Structural problems are rejected before any remote call. An incomplete
    /// first payment still persists the subscription and is reported through
    /// the returned [`SubscriptionOutcome`].
    pub async fn create(
        mut self,
        payment_method: Option<&str>,
        customer_options: CustomerOptions,
    ) -> Result<SubscriptionOutcome> {
        let now = Utc::now();
        self.validate(now)?;
        self.ensure_name_is_free(now).await?;

        let customer_id = self
            .manager
            .customers()
            .get_or_create_customer(self.owner, payment_method, customer_options)
            .await?;

        let (trial_param, trial_ends_at) = match self.trial {
            TrialSetting::None => (None, None),
            TrialSetting::Skip => (Some(TrialEnd::Now), None),
            TrialSetting::Until(until) => (Some(TrialEnd::At(until)), Some(until)),
            TrialSetting::Days(days) => {
                let until = now + Duration::days(i64::from(days));
                (Some(TrialEnd::At(until)), Some(until))
            }
        };

        let mut metadata = std::mem::take(&mut self.metadata);
        metadata.insert(META_SUBSCRIPTION_NAME.to_string(), self.name.clone());

        let remote = self
            .manager
            .gateway()
            .create_subscription(CreateSubscriptionRequest {
                customer: customer_id,
                items: std::mem::take(&mut self.items),
                trial_end: trial_param,
                coupon: self.coupon.take(),
                promotion_code: self.promotion_code.take(),
                metadata,
                billing_cycle_anchor: self.billing_cycle_anchor,
                proration_behavior: self.proration,
                payment_behavior: self.payment_behavior,
                default_payment_method: None,
            })
            .await?;

        let mut subscription = Subscription::from_gateway(
            self.owner.billable_id(),
            self.owner.billable_type(),
            self.name.clone(),
            &remote,
        );
        subscription.trial_ends_at = trial_ends_at;

        save_created_after_remote(self.manager.store(), &mut subscription).await?;

        tracing::info!(
            target: "cashier::builder",
            subscription_id = %subscription.id,
            gateway_id = %subscription.gateway_id,
            owner_id = %subscription.owner_id,
            name = %subscription.name,
            status = %subscription.status,
            "Created subscription"
        );

        if !subscription.has_incomplete_payment() {
            return Ok(SubscriptionOutcome::Complete(subscription));
        }

        let Some(payment) = latest_payment_of(self.manager.gateway(), &remote).await? else {
            return Ok(SubscriptionOutcome::Complete(subscription));
        };
        Ok(match payment.validate() {
            Err(CashierError::PaymentActionRequired(payment)) => SubscriptionOutcome::RequiresAction {
                subscription,
                payment: *payment,
            },
            Err(CashierError::PaymentFailure(payment)) => SubscriptionOutcome::PaymentFailed {
                subscription,
                payment: *payment,
            },
            _ => SubscriptionOutcome::Complete(subscription),
        })
    }

    /// Reject requests the gateway would refuse or that break local invariants.
    fn validate(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.items.is_empty() {
            return Err(SubscriptionUpdateFailure::NoPrices.into());
        }

        if let Some(quantity) = self.quantity {
            if self.items.len() > 1 {
                return Err(CashierError::logic(
                    "A price is required when setting the quantity of a subscription with multiple prices",
                ));
            }
            let item = &mut self.items[0];
            if item.quantity.is_none() {
                return Err(SubscriptionUpdateFailure::MeteredQuantity {
                    price: item.price.clone(),
                }
                .into());
            }
            item.quantity = Some(quantity);
        }

        for (i, item) in self.items.iter().enumerate() {
            if self.items[..i].iter().any(|other| other.price == item.price) {
                return Err(SubscriptionUpdateFailure::DuplicatePrice {
                    price: item.price.clone(),
                }
                .into());
            }
            if item.quantity == Some(0) {
                return Err(SubscriptionUpdateFailure::InvalidQuantity {
                    price: item.price.clone(),
                    quantity: 0,
                }
                .into());
            }
        }

        if let TrialSetting::Until(until) = self.trial {
            if until <= now {
                return Err(CashierError::logic("The trial end must be in the future"));
            }
        }

        Ok(())
    }

    /// A live subscription with the same name blocks; ended ones stay as history.
    async fn ensure_name_is_free(&self, now: DateTime<Utc>) -> Result<()> {
        let existing = self
            .manager
            .store()
            .find_subscription_by_name(self.owner.billable_id(), &self.name)
            .await?;

        match existing {
            Some(existing) if !existing.ended_at(now) && !existing.status.is_terminal() => {
                Err(CashierError::logic(format!(
                    "Owner '{}' already has a subscription named '{}'",
                    existing.owner_id, existing.name
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::storage::test::InMemorySubscriptionStore;
    use crate::subscription::SubscriptionStatus;

    struct TestUser;

    impl Billable for TestUser {
        fn billable_id(&self) -> &str {
            "user_123"
        }

        fn billable_type(&self) -> &str {
            "user"
        }

        fn email(&self) -> Option<&str> {
            Some("test@example.com")
        }
    }

    fn create_test_manager() -> (
        SubscriptionManager<InMemorySubscriptionStore, MockGateway>,
        InMemorySubscriptionStore,
        MockGateway,
    ) {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockGateway::new();
        let manager = SubscriptionManager::new(store.clone(), gateway.clone());
        (manager, store, gateway)
    }

    #[tokio::test]
    async fn test_create_single_price() {
        let (manager, store, gateway) = create_test_manager();

        let sub = manager
            .new_subscription(&TestUser, "default")
            .price_with_quantity("price_basic", 3)
            .create(Some("pm_card_visa"), CustomerOptions::default())
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.gateway_price.as_deref(), Some("price_basic"));
        assert_eq!(sub.quantity, Some(3));
        assert_eq!(sub.items.len(), 1);
        assert!(sub.recurring());

        let stored = store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored, sub);

        let remote = gateway.subscription(&sub.gateway_id).unwrap();
        assert_eq!(remote.metadata.get("name").map(String::as_str), Some("default"));
    }

    #[tokio::test]
    async fn test_create_multi_price_with_metered_item() {
        let (manager, _store, gateway) = create_test_manager();
        gateway.register_metered_price("price_api_calls");

        let sub = manager
            .new_subscription(&TestUser, "default")
            .price_with_quantity("price_seats", 10)
            .metered_price("price_api_calls")
            .add()
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert!(sub.has_multiple_prices());
        assert_eq!(sub.gateway_price, None);
        assert_eq!(sub.quantity, None);
        assert!(sub.find_item("price_api_calls").unwrap().is_metered());
        assert_eq!(sub.find_item("price_seats").unwrap().quantity, Some(10));
    }

    #[tokio::test]
    async fn test_trial_days_sets_local_trial() {
        let (manager, _store, _gateway) = create_test_manager();

        let sub = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .trial_days(7)
            .add()
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert!(sub.on_trial());
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        let expected = Utc::now() + Duration::days(7);
        assert!((sub.trial_ends_at.unwrap() - expected).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn test_skip_trial_sends_now() {
        let (manager, _store, _gateway) = create_test_manager();

        let sub = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .trial_days(7)
            .skip_trial()
            .add()
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert!(!sub.on_trial());
        assert_eq!(sub.trial_ends_at, None);
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_validation_happens_before_remote_calls() {
        let (manager, _store, gateway) = create_test_manager();

        let err = manager
            .new_subscription(&TestUser, "default")
            .add()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CashierError::SubscriptionUpdateFailure(SubscriptionUpdateFailure::NoPrices)
        ));

        let err = manager
            .new_subscription(&TestUser, "default")
            .price_with_quantity("price_basic", 0)
            .add()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CashierError::SubscriptionUpdateFailure(SubscriptionUpdateFailure::InvalidQuantity { .. })
        ));

        let err = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .price("price_basic")
            .add()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CashierError::SubscriptionUpdateFailure(SubscriptionUpdateFailure::DuplicatePrice { .. })
        ));

        let err = manager
            .new_subscription(&TestUser, "default")
            .price("price_a")
            .price("price_b")
            .quantity(2)
            .add()
            .await
            .unwrap_err();
        assert!(matches!(err, CashierError::Logic(_)));

        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_quantity_applies_to_single_price() {
        let (manager, _store, _gateway) = create_test_manager();

        let sub = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .quantity(4)
            .add()
            .await
            .unwrap()
            .into_subscription();

        assert_eq!(sub.quantity, Some(4));
    }

    #[tokio::test]
    async fn test_payment_failure_still_persists() {
        let (manager, store, gateway) = create_test_manager();
        gateway.set_next_payment_status("requires_payment_method");

        let outcome = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .add()
            .await
            .unwrap();

        assert!(matches!(outcome, SubscriptionOutcome::PaymentFailed { .. }));
        assert!(outcome.payment().unwrap().requires_payment_method());
        assert!(outcome.subscription().incomplete());
        assert_eq!(store.all_subscriptions().len(), 1);
        assert!(matches!(
            outcome.into_result().unwrap_err(),
            CashierError::PaymentFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_error_if_payment_fails_persists_nothing() {
        let (manager, store, gateway) = create_test_manager();
        gateway.set_next_payment_status("requires_payment_method");

        let err = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .error_if_payment_fails()
            .add()
            .await
            .unwrap_err();

        assert!(matches!(err, CashierError::Gateway(ref e) if e.is_card_error()));
        assert!(store.all_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_save_failure_is_inconsistent() {
        let (manager, store, gateway) = create_test_manager();
        store.fail_next_save();

        let err = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .add()
            .await
            .unwrap_err();

        assert!(matches!(err, CashierError::Inconsistent { .. }));
        assert!(gateway.calls().contains(&"create_subscription".to_string()));
    }

    #[tokio::test]
    async fn test_name_must_be_free_unless_ended() {
        let (manager, store, _gateway) = create_test_manager();

        let first = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .add()
            .await
            .unwrap()
            .into_subscription();

        let err = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .add()
            .await
            .unwrap_err();
        assert!(matches!(err, CashierError::Logic(_)));

        let mut ended = first.clone();
        ended.status = SubscriptionStatus::Canceled;
        ended.ends_at = Some(Utc::now() - Duration::days(1));
        store.save_subscription(&ended).await.unwrap();

        let second = manager
            .new_subscription(&TestUser, "default")
            .price("price_pro")
            .add()
            .await
            .unwrap()
            .into_subscription();

        assert_ne!(second.id, first.id);
        assert_ne!(second.gateway_id, first.gateway_id);
        assert_eq!(second.gateway_price.as_deref(), Some("price_pro"));
        assert_eq!(store.all_subscriptions().len(), 2);
        assert_eq!(store.find_subscription(first.id).await.unwrap(), Some(ended));
        assert_eq!(
            manager.subscription("user_123", "default").await.unwrap().map(|s| s.id),
            Some(second.id)
        );
    }
}
