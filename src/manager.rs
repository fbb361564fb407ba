//! Subscription lifecycle management.
//!
//! [`SubscriptionManager`] is the entry point: it creates subscriptions through
//! [`SubscriptionBuilder`], answers owner-level queries, and hands out a
//! [`SubscriptionEditor`] for changes to an existing subscription.
//!
//! Every editor operation follows the same order: validate locally, call the
//! gateway, then persist what the gateway returned. A rejected remote call
//! leaves the local record untouched; a failed local write after an accepted
//! remote call surfaces as [`CashierError::Inconsistent`].

use chrono::{DateTime, Utc};

use crate::builder::SubscriptionBuilder;
use crate::config::{ActivePolicy, CashierConfig};
use crate::customer::{Billable, CustomerManager};
use crate::error::{CashierError, Result, SubscriptionUpdateFailure};
use crate::gateway::{
    BillingCycleAnchor, CancelSubscriptionRequest, CreateSubscriptionItemRequest,
    DeleteSubscriptionItemRequest, Gateway, PaymentBehavior, ProrationBehavior, TrialEnd,
    UpdateSubscriptionItemRequest, UpdateSubscriptionRequest,
};
use crate::payment::{Payment, PaymentFailureHandler, latest_payment};
use crate::storage::{SubscriptionStore, save_after_remote};
use crate::subscription::{Subscription, SubscriptionItem};

/// Subscription manager.
///
/// Generic over the store and the gateway so tests can run against the
/// in-memory implementations.
pub struct SubscriptionManager<S: SubscriptionStore, G: Gateway> {
    store: S,
    gateway: G,
    customers: CustomerManager<S, G>,
    policy: ActivePolicy,
}

impl<S: SubscriptionStore + Clone, G: Gateway + Clone> SubscriptionManager<S, G> {
    /// Create a new subscription manager with the default active policy.
    #[must_use]
    pub fn new(store: S, gateway: G) -> Self {
        Self {
            customers: CustomerManager::new(store.clone(), gateway.clone()),
            store,
            gateway,
            policy: ActivePolicy::default(),
        }
    }

    /// Create a manager using the configured active policy.
    #[must_use]
    pub fn from_config(store: S, gateway: G, config: &CashierConfig) -> Self {
        Self::new(store, gateway).with_active_policy(config.active_policy)
    }
}

impl<S: SubscriptionStore, G: Gateway> SubscriptionManager<S, G> {
    #[must_use]
    pub fn with_active_policy(mut self, policy: ActivePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn customers(&self) -> &CustomerManager<S, G> {
        &self.customers
    }

    pub fn active_policy(&self) -> ActivePolicy {
        self.policy
    }

    /// Start building a new subscription for an owner.
    pub fn new_subscription<'a>(
        &'a self,
        owner: &'a dyn Billable,
        name: impl Into<String>,
    ) -> SubscriptionBuilder<'a, S, G> {
        SubscriptionBuilder::new(self, owner, name)
    }

    /// Start changing an existing subscription.
    pub fn edit<'a>(&'a self, subscription: &'a mut Subscription) -> SubscriptionEditor<'a, S, G> {
        SubscriptionEditor::new(self, subscription)
    }

    // =========================================================================
    // Owner queries
    // =========================================================================

    /// Get an owner's subscription by name.
    pub async fn subscription(&self, owner_id: &str, name: &str) -> Result<Option<Subscription>> {
        self.store.find_subscription_by_name(owner_id, name).await
    }

    /// Get an owner's subscription by name, failing if it does not exist.
    pub async fn subscription_or_fail(&self, owner_id: &str, name: &str) -> Result<Subscription> {
        self.subscription(owner_id, name).await?.ok_or_else(|| {
            CashierError::not_found(format!(
                "Owner '{owner_id}' has no subscription named '{name}'"
            ))
        })
    }

    /// All subscriptions of an owner, oldest first.
    pub async fn subscriptions(&self, owner_id: &str) -> Result<Vec<Subscription>> {
        self.store.list_subscriptions(owner_id).await
    }

    /// Check if the owner has a valid subscription, optionally on a given price.
    pub async fn subscribed(&self, owner_id: &str, name: &str, price: Option<&str>) -> Result<bool> {
        let Some(sub) = self.subscription(owner_id, name).await? else {
            return Ok(false);
        };
        if !sub.valid_at(Utc::now(), self.policy) {
            return Ok(false);
        }
        Ok(price.is_none_or(|price| sub.has_price(price)))
    }

    /// Check if the owner's named subscription is on trial.
    pub async fn on_trial(&self, owner_id: &str, name: &str) -> Result<bool> {
        Ok(self
            .subscription(owner_id, name)
            .await?
            .is_some_and(|sub| sub.on_trial()))
    }

    /// Check if the owner's named subscription waits on a payment.
    pub async fn has_incomplete_payment(&self, owner_id: &str, name: &str) -> Result<bool> {
        Ok(self
            .subscription(owner_id, name)
            .await?
            .is_some_and(|sub| sub.has_incomplete_payment()))
    }

    /// Check a subscription against this manager's active policy.
    #[must_use]
    pub fn is_active(&self, subscription: &Subscription) -> bool {
        subscription.active_at(Utc::now(), self.policy)
    }
}

// =============================================================================
// Editor
// =============================================================================

/// Changes to one existing subscription.
///
/// Setters configure how the following operations talk to the gateway. The
/// billing cycle anchor applies to the next operation only.
///
/// # Example
///
/// ```rust,ignore
/// manager.edit(&mut subscription).no_prorate().swap("price_pro").await?;
/// ```
pub struct SubscriptionEditor<'a, S: SubscriptionStore, G: Gateway> {
    manager: &'a SubscriptionManager<S, G>,
    subscription: &'a mut Subscription,
    proration: ProrationBehavior,
    billing_cycle_anchor: Option<BillingCycleAnchor>,
    payment_behavior: PaymentBehavior,
    handle_payment_failures: bool,
    payment_method: Option<String>,
}

impl<'a, S: SubscriptionStore, G: Gateway> SubscriptionEditor<'a, S, G> {
    fn new(manager: &'a SubscriptionManager<S, G>, subscription: &'a mut Subscription) -> Self {
        Self {
            manager,
            subscription,
            proration: ProrationBehavior::default(),
            billing_cycle_anchor: None,
            payment_behavior: PaymentBehavior::default(),
            handle_payment_failures: true,
            payment_method: None,
        }
    }

    /// The subscription as of the last operation.
    pub fn subscription(&self) -> &Subscription {
        &*self.subscription
    }

    // =========================================================================
    // Settings
    // =========================================================================

    #[must_use]
    pub fn no_prorate(mut self) -> Self {
        self.proration = ProrationBehavior::None;
        self
    }

    #[must_use]
    pub fn prorate(mut self) -> Self {
        self.proration = ProrationBehavior::CreateProrations;
        self
    }

    /// Invoice prorations immediately instead of on the next cycle.
    #[must_use]
    pub fn always_invoice(mut self) -> Self {
        self.proration = ProrationBehavior::AlwaysInvoice;
        self
    }

    #[must_use]
    pub fn anchor_billing_cycle_on(mut self, anchor: BillingCycleAnchor) -> Self {
        self.billing_cycle_anchor = Some(anchor);
        self
    }

    /// Have the gateway reject changes whose payment fails.
    #[must_use]
    pub fn error_if_payment_fails(mut self) -> Self {
        self.payment_behavior = PaymentBehavior::ErrorIfIncomplete;
        self
    }

    /// Keep changes pending on the gateway until their payment succeeds.
    #[must_use]
    pub fn pending_if_payment_fails(mut self) -> Self {
        self.payment_behavior = PaymentBehavior::PendingIfIncomplete;
        self
    }

    /// Apply changes even when their payment fails, without raising payment
    /// errors.
    #[must_use]
    pub fn allow_payment_failures(mut self) -> Self {
        self.payment_behavior = PaymentBehavior::AllowIncomplete;
        self.handle_payment_failures = false;
        self
    }

    /// Payment method used to confirm payments that need action.
    #[must_use]
    pub fn with_payment_method(mut self, payment_method: impl Into<String>) -> Self {
        self.payment_method = Some(payment_method.into());
        self
    }

    // =========================================================================
    // Prices
    // =========================================================================

    /// Move a single-price subscription to another price.
    ///
    /// The change is persisted before prorations are invoiced out of cycle.
    pub async fn swap(&mut self, price: &str) -> Result<()> {
        self.swap_inner(price, None, false).await?;
        self.invoice_out_of_cycle().await?;
        self.settle_payment().await
    }

    /// Swap with an explicit quantity.
    pub async fn swap_with_quantity(&mut self, price: &str, quantity: u64) -> Result<()> {
        self.swap_inner(price, Some(quantity), false).await?;
        self.invoice_out_of_cycle().await?;
        self.settle_payment().await
    }

    /// Swap and have the gateway invoice the prorations as part of the update.
    pub async fn swap_and_invoice(&mut self, price: &str) -> Result<()> {
        self.swap_inner(price, None, true).await?;
        self.settle_payment().await
    }

    async fn swap_inner(&mut self, price: &str, quantity: Option<u64>, invoice_now: bool) -> Result<()> {
        if self.subscription.has_multiple_prices() {
            return Err(SubscriptionUpdateFailure::MultiplePrices.into());
        }
        self.guard_against_incomplete()?;
        if quantity == Some(0) {
            return Err(SubscriptionUpdateFailure::InvalidQuantity {
                price: price.to_string(),
                quantity: 0,
            }
            .into());
        }

        let now = Utc::now();
        let remote = self
            .manager
            .gateway
            .retrieve_subscription(&self.subscription.gateway_id)
            .await?;
        let item = match remote.items.data.as_slice() {
            [item] => item,
            [] => {
                return Err(CashierError::Inconsistent {
                    gateway_id: remote.id.clone(),
                    message: "remote subscription has no items".to_string(),
                });
            }
            _ => return Err(SubscriptionUpdateFailure::MultiplePrices.into()),
        };
        let quantity = quantity.or_else(|| item.local_quantity());

        let proration = if invoice_now {
            ProrationBehavior::AlwaysInvoice
        } else {
            self.proration
        };
        let request = UpdateSubscriptionRequest::new()
            .item(item.id.clone(), Some(price.to_string()), quantity)
            .trial_end(self.trial_end_param(now))
            .cancel_at_period_end(false)
            .proration_behavior(proration)
            .billing_cycle_anchor(self.billing_cycle_anchor.take())
            .payment_behavior(self.payment_behavior);
        let updated = self
            .manager
            .gateway
            .update_subscription(&self.subscription.gateway_id, request)
            .await?;

        let previous = self.subscription.gateway_price.clone();
        self.subscription.status = updated.subscription_status();
        self.subscription.apply_items(&updated.items.data);
        self.subscription.ends_at = None;
        self.subscription.updated_at = now;
        self.save().await?;

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            from = previous.as_deref().unwrap_or_default(),
            to = price,
            status = %self.subscription.status,
            "Swapped subscription price"
        );
        Ok(())
    }

    /// Add a licensed price with quantity 1.
    pub async fn add_price(&mut self, price: &str) -> Result<()> {
        self.add_price_with_quantity(price, 1).await
    }

    pub async fn add_price_with_quantity(&mut self, price: &str, quantity: u64) -> Result<()> {
        if quantity == 0 {
            return Err(SubscriptionUpdateFailure::InvalidQuantity {
                price: price.to_string(),
                quantity,
            }
            .into());
        }
        self.add_price_inner(price, Some(quantity), self.proration).await?;
        self.settle_payment().await
    }

    /// Add a usage-based price.
    pub async fn add_metered_price(&mut self, price: &str) -> Result<()> {
        self.add_price_inner(price, None, self.proration).await?;
        self.settle_payment().await
    }

    /// Add a price and invoice the prorations immediately.
    pub async fn add_price_and_invoice(&mut self, price: &str, quantity: u64) -> Result<()> {
        if quantity == 0 {
            return Err(SubscriptionUpdateFailure::InvalidQuantity {
                price: price.to_string(),
                quantity,
            }
            .into());
        }
        self.add_price_inner(price, Some(quantity), ProrationBehavior::AlwaysInvoice)
            .await?;
        self.settle_payment().await
    }

    async fn add_price_inner(
        &mut self,
        price: &str,
        quantity: Option<u64>,
        proration: ProrationBehavior,
    ) -> Result<()> {
        self.guard_against_incomplete()?;
        if self.subscription.has_price(price) {
            return Err(SubscriptionUpdateFailure::DuplicatePrice {
                price: price.to_string(),
            }
            .into());
        }

        let item = self
            .manager
            .gateway
            .create_subscription_item(CreateSubscriptionItemRequest {
                subscription: self.subscription.gateway_id.clone(),
                price: price.to_string(),
                quantity,
                proration_behavior: proration,
                payment_behavior: self.payment_behavior,
            })
            .await?;

        self.subscription.push_item(&item);
        self.subscription.updated_at = Utc::now();
        self.save().await?;

        self.refresh_status().await?;

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            price,
            status = %self.subscription.status,
            "Added price to subscription"
        );
        Ok(())
    }

    /// Remove a price from a multi-price subscription.
    pub async fn remove_price(&mut self, price: &str) -> Result<()> {
        if self.subscription.has_single_price() {
            return Err(SubscriptionUpdateFailure::CannotDeleteLastPrice.into());
        }
        let item = self.find_item_or_fail(price)?.clone();

        self.manager
            .gateway
            .delete_subscription_item(
                &item.gateway_id,
                DeleteSubscriptionItemRequest {
                    proration_behavior: self.proration,
                    clear_usage: item.is_metered(),
                },
            )
            .await?;

        self.subscription.remove_item(price);
        self.subscription.updated_at = Utc::now();
        self.save().await?;

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            price,
            "Removed price from subscription"
        );
        Ok(())
    }

    // =========================================================================
    // Quantities
    // =========================================================================

    /// Set the quantity of the only item, or of the item for `price`.
    pub async fn update_quantity(&mut self, quantity: u64, price: Option<&str>) -> Result<()> {
        self.update_quantity_inner(quantity, price).await?;
        self.settle_payment().await
    }

    pub async fn increment_quantity(&mut self, count: u64, price: Option<&str>) -> Result<()> {
        let current = self.current_quantity(price)?;
        self.update_quantity(current.saturating_add(count), price).await
    }

    /// Increment and invoice the prorations out of cycle.
    pub async fn increment_and_invoice(&mut self, count: u64, price: Option<&str>) -> Result<()> {
        self.guard_against_incomplete()?;
        let current = self.current_quantity(price)?;
        self.update_quantity_inner(current.saturating_add(count), price)
            .await?;
        self.invoice_out_of_cycle().await?;
        self.settle_payment().await
    }

    /// Decrement, never going below 1.
    pub async fn decrement_quantity(&mut self, count: u64, price: Option<&str>) -> Result<()> {
        let current = self.current_quantity(price)?;
        self.update_quantity(current.saturating_sub(count).max(1), price)
            .await
    }

    async fn update_quantity_inner(&mut self, quantity: u64, price: Option<&str>) -> Result<()> {
        self.guard_against_incomplete()?;
        let item = self.resolve_item(price)?.clone();
        if item.is_metered() {
            return Err(SubscriptionUpdateFailure::MeteredQuantity {
                price: item.gateway_price,
            }
            .into());
        }
        if quantity == 0 {
            return Err(SubscriptionUpdateFailure::InvalidQuantity {
                price: item.gateway_price,
                quantity,
            }
            .into());
        }

        let now = Utc::now();
        // The item endpoint has no billing cycle anchor.
        let item_update = price.is_some()
            && self.subscription.has_multiple_prices()
            && self.billing_cycle_anchor.is_none();
        if item_update {
            self.manager
                .gateway
                .update_subscription_item(
                    &item.gateway_id,
                    UpdateSubscriptionItemRequest {
                        price: None,
                        quantity: Some(quantity),
                        proration_behavior: Some(self.proration),
                        payment_behavior: Some(self.payment_behavior),
                    },
                )
                .await?;
            self.subscription
                .set_item_quantity(Some(&item.gateway_price), quantity);
            self.subscription.updated_at = now;
            self.save().await?;
            self.refresh_status().await?;
        } else {
            let request = UpdateSubscriptionRequest::new()
                .item(item.gateway_id.clone(), None, Some(quantity))
                .proration_behavior(self.proration)
                .billing_cycle_anchor(self.billing_cycle_anchor.take())
                .payment_behavior(self.payment_behavior);
            let updated = self
                .manager
                .gateway
                .update_subscription(&self.subscription.gateway_id, request)
                .await?;
            self.subscription.status = updated.subscription_status();
            self.subscription.apply_items(&updated.items.data);
            self.subscription.updated_at = now;
            self.save().await?;
        }

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            price = %item.gateway_price,
            quantity,
            "Updated subscription quantity"
        );
        Ok(())
    }

    fn current_quantity(&self, price: Option<&str>) -> Result<u64> {
        let item = self.resolve_item(price)?;
        match item.quantity {
            Some(quantity) => Ok(quantity),
            None => Err(SubscriptionUpdateFailure::MeteredQuantity {
                price: item.gateway_price.clone(),
            }
            .into()),
        }
    }

    fn resolve_item(&self, price: Option<&str>) -> Result<&SubscriptionItem> {
        match price {
            Some(price) => self.find_item_or_fail(price),
            None if self.subscription.has_multiple_prices() => Err(CashierError::logic(
                "A price is required when changing the quantity of a subscription with multiple prices",
            )),
            None => self.subscription.items.first().ok_or_else(|| {
                CashierError::not_found(format!(
                    "Subscription '{}' has no items",
                    self.subscription.gateway_id
                ))
            }),
        }
    }

    fn find_item_or_fail(&self, price: &str) -> Result<&SubscriptionItem> {
        self.subscription.find_item(price).ok_or_else(|| {
            CashierError::not_found(format!(
                "Subscription '{}' has no item for price '{price}'",
                self.subscription.gateway_id
            ))
        })
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel at the end of the current period (or trial).
    pub async fn cancel(&mut self) -> Result<()> {
        let now = Utc::now();
        let remote = self
            .manager
            .gateway
            .cancel_subscription(
                &self.subscription.gateway_id,
                CancelSubscriptionRequest::at_period_end(),
            )
            .await?;

        self.subscription.status = remote.subscription_status();
        let ends_at = if self.subscription.on_trial_at(now) {
            self.subscription.trial_ends_at
        } else {
            remote.current_period_ends_at()
        };
        self.subscription.ends_at = Some(ends_at.unwrap_or_else(|| {
            tracing::warn!(
                target: "cashier::manager",
                gateway_id = %remote.id,
                "Gateway reported no period end, ending the subscription now"
            );
            now
        }));
        self.subscription.updated_at = now;
        self.save().await?;

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            ends_at = ?self.subscription.ends_at,
            "Cancelled subscription at period end"
        );
        Ok(())
    }

    /// Cancel at a given instant.
    pub async fn cancel_at(&mut self, at: DateTime<Utc>) -> Result<()> {
        let now = Utc::now();
        if at <= now {
            return Err(CashierError::logic(
                "A scheduled cancellation requires a date in the future",
            ));
        }

        let request = UpdateSubscriptionRequest::new()
            .cancel_at(at)
            .proration_behavior(self.proration);
        let remote = self
            .manager
            .gateway
            .update_subscription(&self.subscription.gateway_id, request)
            .await?;

        self.subscription.status = remote.subscription_status();
        self.subscription.ends_at = Some(remote.cancel_at_datetime().unwrap_or(at));
        self.subscription.updated_at = now;
        self.save().await?;

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            ends_at = %at,
            "Scheduled subscription cancellation"
        );
        Ok(())
    }

    /// Cancel immediately.
    pub async fn cancel_now(&mut self) -> Result<()> {
        self.cancel_immediately(false).await
    }

    /// Cancel immediately and invoice pending usage and prorations.
    pub async fn cancel_now_and_invoice(&mut self) -> Result<()> {
        self.cancel_immediately(true).await
    }

    async fn cancel_immediately(&mut self, invoice_now: bool) -> Result<()> {
        let remote = self
            .manager
            .gateway
            .cancel_subscription(
                &self.subscription.gateway_id,
                CancelSubscriptionRequest {
                    at_period_end: false,
                    invoice_now,
                    prorate: self.proration != ProrationBehavior::None,
                },
            )
            .await?;

        let now = Utc::now();
        self.subscription.status = remote.subscription_status();
        self.subscription.ends_at = Some(now);
        self.subscription.updated_at = now;
        self.save().await?;

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            invoice_now,
            "Cancelled subscription immediately"
        );
        Ok(())
    }

    /// Undo a cancellation during the grace period.
    pub async fn resume(&mut self) -> Result<()> {
        let now = Utc::now();
        if !self.subscription.on_grace_period_at(now) {
            return Err(CashierError::logic(
                "Unable to resume a subscription that is not within its grace period",
            ));
        }

        let request = UpdateSubscriptionRequest::new()
            .cancel_at_period_end(false)
            .trial_end(self.trial_end_param(now));
        let remote = self
            .manager
            .gateway
            .update_subscription(&self.subscription.gateway_id, request)
            .await?;

        self.subscription.status = remote.subscription_status();
        self.subscription.ends_at = None;
        self.subscription.updated_at = now;
        self.save().await?;

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            status = %self.subscription.status,
            "Resumed subscription"
        );
        Ok(())
    }

    // =========================================================================
    // Trials
    // =========================================================================

    /// Move the trial end to a later instant.
    pub async fn extend_trial(&mut self, until: DateTime<Utc>) -> Result<()> {
        let now = Utc::now();
        if until <= now {
            return Err(CashierError::logic(
                "Extending a subscription's trial requires a date in the future",
            ));
        }

        let request = UpdateSubscriptionRequest::new()
            .trial_end(TrialEnd::At(until))
            .proration_behavior(self.proration);
        let remote = self
            .manager
            .gateway
            .update_subscription(&self.subscription.gateway_id, request)
            .await?;

        self.subscription.status = remote.subscription_status();
        self.subscription.trial_ends_at = Some(until);
        self.subscription.updated_at = now;
        self.save().await?;

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            trial_ends_at = %until,
            "Extended subscription trial"
        );
        Ok(())
    }

    /// End the trial now and start billing. Does nothing without a trial.
    pub async fn end_trial(&mut self) -> Result<()> {
        if self.subscription.trial_ends_at.is_none() {
            return Ok(());
        }

        let request = UpdateSubscriptionRequest::new()
            .trial_end(TrialEnd::Now)
            .proration_behavior(self.proration)
            .payment_behavior(self.payment_behavior);
        let remote = self
            .manager
            .gateway
            .update_subscription(&self.subscription.gateway_id, request)
            .await?;

        let now = Utc::now();
        self.subscription.status = remote.subscription_status();
        self.subscription.trial_ends_at = Some(now);
        self.subscription.updated_at = now;
        self.save().await?;

        tracing::info!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            status = %self.subscription.status,
            "Ended subscription trial"
        );
        self.settle_payment().await
    }

    // =========================================================================
    // Sync and payments
    // =========================================================================

    /// Overwrite the local record with the gateway's current state.
    pub async fn sync_from_gateway(&mut self) -> Result<()> {
        let remote = self
            .manager
            .gateway
            .retrieve_subscription(&self.subscription.gateway_id)
            .await?;
        self.subscription.reconcile_with(&remote, Utc::now());
        self.save().await?;

        tracing::debug!(
            target: "cashier::manager",
            subscription_id = %self.subscription.id,
            status = %self.subscription.status,
            "Synced subscription from gateway"
        );
        Ok(())
    }

    /// The payment of the latest invoice, if any.
    pub async fn latest_payment(&self) -> Result<Option<Payment>> {
        latest_payment(&self.manager.gateway, &self.subscription.gateway_id).await
    }

    /// Invoice pending prorations for this subscription and pay the invoice.
    ///
    /// Having nothing to invoice is not an error. A declined payment refreshes
    /// the local status; when that leaves the subscription waiting on a
    /// payment, the failure is reported by the payment step instead.
    pub async fn invoice_out_of_cycle(&mut self) -> Result<()> {
        let customer_id = self
            .manager
            .customers
            .customer_id(&self.subscription.owner_id)
            .await?;

        let invoice = match self
            .manager
            .gateway
            .create_invoice(&customer_id, Some(&self.subscription.gateway_id))
            .await
        {
            Ok(invoice) => invoice,
            Err(CashierError::Gateway(err)) if err.is_nothing_to_invoice() => {
                tracing::debug!(
                    target: "cashier::manager",
                    subscription_id = %self.subscription.id,
                    "Nothing to invoice"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match self.manager.gateway.pay_invoice(&invoice.id).await {
            Ok(_) => Ok(()),
            Err(CashierError::Gateway(err)) if err.is_card_error() => {
                tracing::warn!(
                    target: "cashier::manager",
                    subscription_id = %self.subscription.id,
                    invoice_id = %invoice.id,
                    error = %err,
                    "Out-of-cycle invoice payment failed"
                );
                self.refresh_status().await?;
                if self.subscription.has_incomplete_payment() {
                    Ok(())
                } else {
                    Err(CashierError::Gateway(err))
                }
            }
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn guard_against_incomplete(&self) -> Result<()> {
        if self.subscription.incomplete() {
            return Err(SubscriptionUpdateFailure::IncompleteSubscription {
                name: self.subscription.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Keep an active trial, otherwise end any trial now.
    fn trial_end_param(&self, now: DateTime<Utc>) -> TrialEnd {
        match self.subscription.trial_ends_at {
            Some(trial_end) if trial_end > now => TrialEnd::At(trial_end),
            _ => TrialEnd::Now,
        }
    }

    async fn refresh_status(&mut self) -> Result<()> {
        let remote = self
            .manager
            .gateway
            .retrieve_subscription(&self.subscription.gateway_id)
            .await?;
        let status = remote.subscription_status();
        if status != self.subscription.status {
            self.subscription.status = status;
            self.subscription.updated_at = Utc::now();
            self.save().await?;
        }
        Ok(())
    }

    async fn settle_payment(&mut self) -> Result<()> {
        if !self.handle_payment_failures {
            return Ok(());
        }
        PaymentFailureHandler::new(&self.manager.store, &self.manager.gateway)
            .handle(self.subscription, self.payment_method.as_deref())
            .await
    }

    async fn save(&self) -> Result<()> {
        save_after_remote(&self.manager.store, &*self.subscription).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SubscriptionOutcome;
    use crate::customer::CustomerOptions;
    use crate::gateway::mock::MockGateway;
    use crate::storage::test::InMemorySubscriptionStore;
    use crate::subscription::SubscriptionStatus;
    use chrono::Duration;

    struct TestUser;

    impl Billable for TestUser {
        fn billable_id(&self) -> &str {
            "user_123"
        }

        fn billable_type(&self) -> &str {
            "user"
        }
    }

    type TestManager = SubscriptionManager<InMemorySubscriptionStore, MockGateway>;

    fn create_test_manager() -> (TestManager, InMemorySubscriptionStore, MockGateway) {
        let store = InMemorySubscriptionStore::new();
        let gateway = MockGateway::new();
        let manager = SubscriptionManager::new(store.clone(), gateway.clone());
        (manager, store, gateway)
    }

    async fn create_test_subscription(manager: &TestManager, price: &str) -> Subscription {
        manager
            .new_subscription(&TestUser, "default")
            .price(price)
            .create(Some("pm_card_visa"), CustomerOptions::default())
            .await
            .unwrap()
            .into_result()
            .unwrap()
    }

    async fn create_multi_price_subscription(manager: &TestManager) -> Subscription {
        manager
            .new_subscription(&TestUser, "default")
            .price_with_quantity("price_a", 10)
            .price("price_b")
            .create(Some("pm_card_visa"), CustomerOptions::default())
            .await
            .unwrap()
            .into_result()
            .unwrap()
    }

    #[tokio::test]
    async fn test_swap_updates_price_and_clears_cancellation() {
        let (manager, store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        manager.edit(&mut sub).cancel().await.unwrap();
        assert!(sub.on_grace_period());

        manager.edit(&mut sub).swap("price_pro").await.unwrap();

        assert_eq!(sub.gateway_price.as_deref(), Some("price_pro"));
        assert_eq!(sub.ends_at, None);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(store.find_subscription(sub.id).await.unwrap().unwrap(), sub);

        let update = gateway.last_update().unwrap();
        assert_eq!(update.cancel_at_period_end, Some(false));
        assert_eq!(update.trial_end, Some(TrialEnd::Now));
        assert!(gateway.invoices().iter().any(|i| i.amount_due == 1000
            && i.status.as_deref() == Some("paid")
            && i.subscription.as_deref() == Some(sub.gateway_id.as_str())));
    }

    #[tokio::test]
    async fn test_swap_to_same_price_tolerates_nothing_to_invoice() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        let invoices_before = gateway.invoices().len();

        manager.edit(&mut sub).swap("price_basic").await.unwrap();

        assert_eq!(sub.gateway_price.as_deref(), Some("price_basic"));
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(gateway.invoices().len(), invoices_before);
        assert!(gateway.calls().contains(&"create_invoice".to_string()));
    }

    #[tokio::test]
    async fn test_swap_keeps_active_trial() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .trial_days(7)
            .add()
            .await
            .unwrap()
            .into_subscription();
        let trial_end = sub.trial_ends_at.unwrap();

        manager.edit(&mut sub).swap("price_pro").await.unwrap();

        assert_eq!(gateway.last_update().unwrap().trial_end, Some(TrialEnd::At(trial_end)));
        assert!(sub.on_trial());
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
    }

    #[tokio::test]
    async fn test_swap_rejects_multiple_prices_and_incomplete() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_multi_price_subscription(&manager).await;

        let err = manager.edit(&mut sub).swap("price_c").await.unwrap_err();
        assert!(matches!(
            err,
            CashierError::SubscriptionUpdateFailure(SubscriptionUpdateFailure::MultiplePrices)
        ));

        let mut incomplete = sub.clone();
        incomplete.items.truncate(1);
        incomplete.status = SubscriptionStatus::Incomplete;
        let calls_before = gateway.calls().len();
        let err = manager.edit(&mut incomplete).swap("price_c").await.unwrap_err();
        assert!(matches!(
            err,
            CashierError::SubscriptionUpdateFailure(
                SubscriptionUpdateFailure::IncompleteSubscription { .. }
            )
        ));
        assert_eq!(gateway.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_swap_payment_requiring_action() {
        let (manager, store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        gateway.set_next_payment_status("requires_action");

        let err = manager.edit(&mut sub).swap("price_pro").await.unwrap_err();

        assert!(matches!(err, CashierError::PaymentActionRequired(ref p) if p.requires_action()));
        assert_eq!(sub.gateway_price.as_deref(), Some("price_pro"));
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        let stored = store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_swap_payment_confirmed_automatically() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        gateway.set_next_payment_status("requires_confirmation");

        manager.edit(&mut sub).swap("price_pro").await.unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(gateway.calls().contains(&"confirm_payment_intent".to_string()));
    }

    #[tokio::test]
    async fn test_allow_payment_failures_skips_payment_errors() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        gateway.set_next_payment_status("requires_payment_method");

        manager
            .edit(&mut sub)
            .allow_payment_failures()
            .swap("price_pro")
            .await
            .unwrap();

        assert!(sub.past_due());
        assert!(!gateway.calls().contains(&"confirm_payment_intent".to_string()));
    }

    #[tokio::test]
    async fn test_swap_and_invoice_uses_always_invoice() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;

        manager.edit(&mut sub).swap_and_invoice("price_pro").await.unwrap();

        assert_eq!(
            gateway.last_update().unwrap().proration_behavior,
            Some(ProrationBehavior::AlwaysInvoice)
        );
        assert!(!gateway.calls().contains(&"create_invoice".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_and_resume() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        let period_end = gateway
            .subscription(&sub.gateway_id)
            .unwrap()
            .current_period_ends_at();

        manager.edit(&mut sub).cancel().await.unwrap();
        assert_eq!(sub.ends_at, period_end);
        assert!(sub.cancelled());
        assert!(sub.on_grace_period());
        assert!(sub.valid());
        assert!(!sub.recurring());

        manager.edit(&mut sub).resume().await.unwrap();
        assert_eq!(sub.ends_at, None);
        assert!(sub.recurring());
        assert!(!gateway.subscription(&sub.gateway_id).unwrap().cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_cancel_on_trial_ends_with_trial() {
        let (manager, _store, _gateway) = create_test_manager();
        let mut sub = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .trial_days(7)
            .add()
            .await
            .unwrap()
            .into_subscription();

        manager.edit(&mut sub).cancel().await.unwrap();

        assert_eq!(sub.ends_at, sub.trial_ends_at);
        assert!(sub.on_trial());
        assert!(sub.on_grace_period());
    }

    #[tokio::test]
    async fn test_resume_requires_grace_period() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        let calls_before = gateway.calls().len();

        let err = manager.edit(&mut sub).resume().await.unwrap_err();
        assert!(matches!(err, CashierError::Logic(_)));
        assert_eq!(gateway.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_cancel_now_ends_subscription() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;

        manager.edit(&mut sub).cancel_now().await.unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(sub.cancelled());
        assert!(sub.ended());
        assert!(!sub.on_grace_period());
        assert!(!sub.valid());

        let (_, request) = gateway.cancellations().pop().unwrap();
        assert!(!request.at_period_end);
        assert!(request.prorate);
        assert!(!request.invoice_now);
    }

    #[tokio::test]
    async fn test_cancel_now_and_invoice() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;

        manager
            .edit(&mut sub)
            .no_prorate()
            .cancel_now_and_invoice()
            .await
            .unwrap();

        let (_, request) = gateway.cancellations().pop().unwrap();
        assert!(request.invoice_now);
        assert!(!request.prorate);
        assert!(sub.ended());
    }

    #[tokio::test]
    async fn test_cancel_at() {
        let (manager, _store, _gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        let at = Utc::now() + Duration::days(10);

        manager.edit(&mut sub).cancel_at(at).await.unwrap();
        assert_eq!(sub.ends_at.unwrap().timestamp(), at.timestamp());
        assert!(sub.on_grace_period());

        let err = manager
            .edit(&mut sub)
            .cancel_at(Utc::now() - Duration::days(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CashierError::Logic(_)));
    }

    #[tokio::test]
    async fn test_quantity_changes() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;

        manager.edit(&mut sub).increment_quantity(2, None).await.unwrap();
        assert_eq!(sub.quantity, Some(3));

        manager.edit(&mut sub).decrement_quantity(5, None).await.unwrap();
        assert_eq!(sub.quantity, Some(1));
        assert_eq!(
            gateway.subscription(&sub.gateway_id).unwrap().items.data[0].quantity,
            Some(1)
        );

        let err = manager.edit(&mut sub).update_quantity(0, None).await.unwrap_err();
        assert!(matches!(
            err,
            CashierError::SubscriptionUpdateFailure(SubscriptionUpdateFailure::InvalidQuantity { .. })
        ));
    }

    #[tokio::test]
    async fn test_increment_and_invoice() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        let invoices_before = gateway.invoices().len();

        manager.edit(&mut sub).increment_and_invoice(1, None).await.unwrap();

        assert_eq!(sub.quantity, Some(2));
        assert_eq!(gateway.invoices().len(), invoices_before + 1);
    }

    #[tokio::test]
    async fn test_multi_price_quantity_needs_price() {
        let (manager, store, _gateway) = create_test_manager();
        let mut sub = create_multi_price_subscription(&manager).await;

        let err = manager.edit(&mut sub).increment_quantity(1, None).await.unwrap_err();
        assert!(matches!(err, CashierError::Logic(_)));

        manager
            .edit(&mut sub)
            .increment_quantity(5, Some("price_a"))
            .await
            .unwrap();
        assert_eq!(sub.find_item("price_a").unwrap().quantity, Some(15));
        assert_eq!(sub.quantity, None);

        let stored = store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.find_item("price_a").unwrap().quantity, Some(15));
    }

    #[tokio::test]
    async fn test_multi_price_quantity_keeps_pending_anchor() {
        let (manager, store, gateway) = create_test_manager();
        let mut sub = create_multi_price_subscription(&manager).await;

        manager
            .edit(&mut sub)
            .anchor_billing_cycle_on(BillingCycleAnchor::Now)
            .update_quantity(3, Some("price_b"))
            .await
            .unwrap();

        assert_eq!(
            gateway.calls().last().map(String::as_str),
            Some("update_subscription")
        );
        let update = gateway.last_update().unwrap();
        assert_eq!(update.billing_cycle_anchor, Some(BillingCycleAnchor::Now));
        assert_eq!(update.items.len(), 1);
        let item_id = sub.find_item("price_b").unwrap().gateway_id.clone();
        assert_eq!(update.items[0].id.as_deref(), Some(item_id.as_str()));
        assert_eq!(update.items[0].quantity, Some(3));

        assert_eq!(sub.find_item("price_b").unwrap().quantity, Some(3));
        assert_eq!(sub.find_item("price_a").unwrap().quantity, Some(10));
        let stored = store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.find_item("price_b").unwrap().quantity, Some(3));
    }

    #[tokio::test]
    async fn test_metered_quantity_rejected() {
        let (manager, _store, gateway) = create_test_manager();
        gateway.register_metered_price("price_usage");
        let mut sub = manager
            .new_subscription(&TestUser, "default")
            .metered_price("price_usage")
            .add()
            .await
            .unwrap()
            .into_subscription();

        let err = manager.edit(&mut sub).increment_quantity(1, None).await.unwrap_err();
        assert!(matches!(
            err,
            CashierError::SubscriptionUpdateFailure(SubscriptionUpdateFailure::MeteredQuantity { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_and_remove_prices() {
        let (manager, store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;

        manager
            .edit(&mut sub)
            .add_price_with_quantity("price_addon", 2)
            .await
            .unwrap();
        assert!(sub.has_multiple_prices());
        assert_eq!(sub.gateway_price, None);
        assert_eq!(sub.find_item("price_addon").unwrap().quantity, Some(2));

        let err = manager.edit(&mut sub).add_price("price_addon").await.unwrap_err();
        assert!(matches!(
            err,
            CashierError::SubscriptionUpdateFailure(SubscriptionUpdateFailure::DuplicatePrice { .. })
        ));

        manager.edit(&mut sub).remove_price("price_basic").await.unwrap();
        assert_eq!(sub.gateway_price.as_deref(), Some("price_addon"));
        assert_eq!(sub.quantity, Some(2));
        assert_eq!(gateway.subscription(&sub.gateway_id).unwrap().items.data.len(), 1);

        let stored = store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.items.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_last_price_rejected_before_lookup() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_multi_price_subscription(&manager).await;

        manager.edit(&mut sub).remove_price("price_a").await.unwrap();

        let calls_before = gateway.calls().len();
        for price in ["price_b", "price_missing"] {
            let err = manager.edit(&mut sub).remove_price(price).await.unwrap_err();
            assert!(matches!(
                err,
                CashierError::SubscriptionUpdateFailure(SubscriptionUpdateFailure::CannotDeleteLastPrice)
            ));
        }
        assert_eq!(gateway.calls().len(), calls_before);
        assert_eq!(sub.items.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_price_not_found() {
        let (manager, _store, _gateway) = create_test_manager();
        let mut sub = create_multi_price_subscription(&manager).await;

        let err = manager.edit(&mut sub).remove_price("price_missing").await.unwrap_err();
        assert!(matches!(err, CashierError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_add_metered_price_clears_usage_on_removal() {
        let (manager, _store, gateway) = create_test_manager();
        gateway.register_metered_price("price_usage");
        let mut sub = create_test_subscription(&manager, "price_basic").await;

        manager.edit(&mut sub).add_metered_price("price_usage").await.unwrap();
        assert!(sub.find_item("price_usage").unwrap().is_metered());

        manager.edit(&mut sub).remove_price("price_usage").await.unwrap();
        assert!(!sub.has_price("price_usage"));
    }

    #[tokio::test]
    async fn test_extend_and_end_trial() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .trial_days(3)
            .add()
            .await
            .unwrap()
            .into_subscription();

        let until = Utc::now() + Duration::days(14);
        manager.edit(&mut sub).extend_trial(until).await.unwrap();
        assert_eq!(sub.trial_ends_at, Some(until));

        let err = manager
            .edit(&mut sub)
            .extend_trial(Utc::now() - Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CashierError::Logic(_)));

        manager.edit(&mut sub).end_trial().await.unwrap();
        assert!(!sub.on_trial());
        assert!(sub.has_expired_trial());
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(gateway.last_update().unwrap().trial_end, Some(TrialEnd::Now));
    }

    #[tokio::test]
    async fn test_end_trial_without_trial_is_noop() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        let calls_before = gateway.calls().len();

        manager.edit(&mut sub).end_trial().await.unwrap();

        assert_eq!(gateway.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_remote_failure_leaves_local_untouched() {
        let (manager, store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        let before = sub.clone();
        gateway.fail_next(
            "cancel_subscription",
            crate::error::GatewayError::new(
                crate::error::GatewayErrorKind::Api,
                "cancel_subscription",
                "boom",
            ),
        );

        let err = manager.edit(&mut sub).cancel().await.unwrap_err();

        assert!(matches!(err, CashierError::Gateway(_)));
        assert_eq!(sub, before);
        assert_eq!(store.find_subscription(sub.id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_local_failure_after_remote_is_inconsistent() {
        let (manager, store, _gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        store.fail_next_save();

        let err = manager.edit(&mut sub).cancel().await.unwrap_err();

        assert!(matches!(err, CashierError::Inconsistent { ref gateway_id, .. } if *gateway_id == sub.gateway_id));
    }

    #[tokio::test]
    async fn test_sync_from_gateway() {
        let (manager, _store, gateway) = create_test_manager();
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        gateway.set_subscription_status(&sub.gateway_id, "past_due");

        manager.edit(&mut sub).sync_from_gateway().await.unwrap();

        assert!(sub.past_due());
        assert!(sub.has_incomplete_payment());
        assert!(!manager.is_active(&sub));
    }

    #[tokio::test]
    async fn test_owner_queries() {
        let (manager, _store, _gateway) = create_test_manager();
        assert!(!manager.subscribed("user_123", "default", None).await.unwrap());

        let outcome = manager
            .new_subscription(&TestUser, "default")
            .price("price_basic")
            .trial_days(5)
            .add()
            .await
            .unwrap();
        assert!(matches!(outcome, SubscriptionOutcome::Complete(_)));

        assert!(manager.subscribed("user_123", "default", None).await.unwrap());
        assert!(manager.subscribed("user_123", "default", Some("price_basic")).await.unwrap());
        assert!(!manager.subscribed("user_123", "default", Some("price_pro")).await.unwrap());
        assert!(manager.on_trial("user_123", "default").await.unwrap());
        assert!(!manager.has_incomplete_payment("user_123", "default").await.unwrap());
        assert_eq!(manager.subscriptions("user_123").await.unwrap().len(), 1);
        assert!(matches!(
            manager.subscription_or_fail("user_123", "other").await.unwrap_err(),
            CashierError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_active_policy_keeps_past_due_active() {
        let (manager, _store, _gateway) = create_test_manager();
        let manager = manager.with_active_policy(ActivePolicy {
            keep_past_due_active: true,
            ..Default::default()
        });
        let mut sub = create_test_subscription(&manager, "price_basic").await;
        sub.status = SubscriptionStatus::PastDue;

        assert!(manager.is_active(&sub));
        assert!(!sub.active());
    }
}
