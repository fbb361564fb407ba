//! The local subscription record.
//!
//! A [`Subscription`] is a cache of one remote gateway subscription. Its
//! predicates are pure functions of the stored fields and an instant, so every
//! check has an `_at(now)` form for deterministic tests.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ActivePolicy;
use crate::gateway::{GatewaySubscription, GatewaySubscriptionItem};

/// The label used when no subscription name is given.
pub const DEFAULT_SUBSCRIPTION_NAME: &str = "default";

// =============================================================================
// Status
// =============================================================================

/// Subscription status, mirroring the gateway vocabulary.
///
/// Unknown statuses are kept verbatim in [`SubscriptionStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    /// Payment failed; the gateway keeps retrying.
    PastDue,
    Canceled,
    /// The first payment has not succeeded yet.
    Incomplete,
    /// The first payment never succeeded and the subscription was abandoned.
    IncompleteExpired,
    Paused,
    Unpaid,
    Other(String),
}

impl SubscriptionStatus {
    /// Parse a gateway status string.
    #[must_use]
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "paused" => Self::Paused,
            "unpaid" => Self::Unpaid,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
            Self::Unpaid => "unpaid",
            Self::Other(other) => other,
        }
    }

    /// The gateway will never bill this subscription again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for SubscriptionStatus {
    fn from(status: String) -> Self {
        Self::from_gateway(&status)
    }
}

impl From<SubscriptionStatus> for String {
    fn from(status: SubscriptionStatus) -> Self {
        status.as_str().to_string()
    }
}

// =============================================================================
// Records
// =============================================================================

/// One priced line item of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: Uuid,
    pub subscription_id: Uuid,
    /// Remote subscription item ID.
    pub gateway_id: String,
    pub gateway_price: String,
    /// `None` for metered prices.
    pub quantity: Option<u64>,
}

impl SubscriptionItem {
    #[must_use]
    pub fn new(
        subscription_id: Uuid,
        gateway_id: impl Into<String>,
        gateway_price: impl Into<String>,
        quantity: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            gateway_id: gateway_id.into(),
            gateway_price: gateway_price.into(),
            quantity,
        }
    }

    /// Metered items have their quantity computed by the gateway.
    #[must_use]
    pub fn is_metered(&self) -> bool {
        self.quantity.is_none()
    }
}

/// A local mirror of a gateway subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub owner_id: String,
    pub owner_type: String,
    /// Application label ("default", "main", ...). An owner holds at most one
    /// live subscription per name; ended ones stay as history.
    pub name: String,
    /// Remote subscription ID.
    pub gateway_id: String,
    pub status: SubscriptionStatus,
    /// Set only for single-price subscriptions.
    pub gateway_price: Option<String>,
    /// Set only for single-price, licensed subscriptions.
    pub quantity: Option<u64>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// Non-null means cancelled: a grace period while in the future, ended after.
    pub ends_at: Option<DateTime<Utc>>,
    pub items: Vec<SubscriptionItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Create a record with no items.
    #[must_use]
    pub fn new(
        owner_id: impl Into<String>,
        owner_type: impl Into<String>,
        name: impl Into<String>,
        gateway_id: impl Into<String>,
        status: SubscriptionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            owner_type: owner_type.into(),
            name: name.into(),
            gateway_id: gateway_id.into(),
            status,
            gateway_price: None,
            quantity: None,
            trial_ends_at: None,
            ends_at: None,
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a record from a remote subscription, taking its status, items
    /// and trial end.
    #[must_use]
    pub fn from_gateway(
        owner_id: impl Into<String>,
        owner_type: impl Into<String>,
        name: impl Into<String>,
        remote: &GatewaySubscription,
    ) -> Self {
        let mut sub = Self::new(
            owner_id,
            owner_type,
            name,
            remote.id.clone(),
            remote.subscription_status(),
        );
        sub.trial_ends_at = remote.trial_ends_at();
        sub.apply_items(&remote.items.data);
        sub
    }

    /// Take over the identity of an existing row for the same remote subscription.
    ///
    /// Keeps the row ID, the creation time and the IDs of items the row
    /// already knows.
    pub fn adopt_row(&mut self, existing: &Subscription) {
        self.id = existing.id;
        self.created_at = existing.created_at;
        for item in &mut self.items {
            item.subscription_id = existing.id;
            if let Some(known) = existing.items.iter().find(|i| i.gateway_id == item.gateway_id) {
                item.id = known.id;
            }
        }
    }

    // =========================================================================
    // Items
    // =========================================================================

    /// Replace the items with the remote item list.
    ///
    /// Local IDs survive for items the gateway still reports.
    pub fn apply_items(&mut self, remote_items: &[GatewaySubscriptionItem]) {
        let items = remote_items
            .iter()
            .map(|remote| {
                let quantity = remote.local_quantity();
                match self.items.iter().find(|i| i.gateway_id == remote.id) {
                    Some(existing) => SubscriptionItem {
                        gateway_price: remote.price.id.clone(),
                        quantity,
                        ..existing.clone()
                    },
                    None => SubscriptionItem::new(
                        self.id,
                        remote.id.clone(),
                        remote.price.id.clone(),
                        quantity,
                    ),
                }
            })
            .collect();
        self.items = items;
        self.sync_single_price();
    }

    /// Add one remote item to the local list.
    pub fn push_item(&mut self, remote: &GatewaySubscriptionItem) {
        self.items.retain(|i| i.gateway_id != remote.id);
        self.items.push(SubscriptionItem::new(
            self.id,
            remote.id.clone(),
            remote.price.id.clone(),
            remote.local_quantity(),
        ));
        self.sync_single_price();
    }

    /// Drop the item for `price`, returning it.
    pub fn remove_item(&mut self, price: &str) -> Option<SubscriptionItem> {
        let pos = self.items.iter().position(|i| i.gateway_price == price)?;
        let item = self.items.remove(pos);
        self.sync_single_price();
        Some(item)
    }

    /// Set the quantity of the item for `price` (or the only item).
    pub fn set_item_quantity(&mut self, price: Option<&str>, quantity: u64) {
        let item = match price {
            Some(price) => self.items.iter_mut().find(|i| i.gateway_price == price),
            None if self.items.len() == 1 => self.items.first_mut(),
            None => None,
        };
        if let Some(item) = item {
            item.quantity = Some(quantity);
        }
        self.sync_single_price();
    }

    /// Derive the denormalized price and quantity from the items.
    fn sync_single_price(&mut self) {
        match self.items.as_slice() {
            [item] => {
                self.gateway_price = Some(item.gateway_price.clone());
                self.quantity = item.quantity;
            }
            _ => {
                self.gateway_price = None;
                self.quantity = None;
            }
        }
    }

    #[must_use]
    pub fn has_price(&self, price: &str) -> bool {
        self.items.iter().any(|i| i.gateway_price == price)
    }

    #[must_use]
    pub fn find_item(&self, price: &str) -> Option<&SubscriptionItem> {
        self.items.iter().find(|i| i.gateway_price == price)
    }

    #[must_use]
    pub fn has_multiple_prices(&self) -> bool {
        self.items.len() > 1
    }

    #[must_use]
    pub fn has_single_price(&self) -> bool {
        !self.has_multiple_prices()
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Overwrite status, items, trial and cancellation with gateway truth.
    ///
    /// A missing remote trial end keeps the local one. A cancellation at
    /// period end ends with the trial while on trial, otherwise with the
    /// period; an explicit cancellation instant is taken as-is; neither
    /// clears `ends_at`.
    pub fn reconcile_with(&mut self, remote: &GatewaySubscription, now: DateTime<Utc>) {
        self.status = remote.subscription_status();
        self.apply_items(&remote.items.data);

        if let Some(trial_end) = remote.trial_ends_at() {
            self.trial_ends_at = Some(trial_end);
        }

        self.ends_at = if remote.cancel_at_period_end {
            if self.on_trial_at(now) {
                self.trial_ends_at
            } else {
                remote.current_period_ends_at()
            }
        } else {
            remote.cancel_at_datetime()
        };

        self.updated_at = now;
    }

    // =========================================================================
    // Predicates
    // =========================================================================

    /// Check if the subscription is active under the default policy.
    #[must_use]
    pub fn active(&self) -> bool {
        self.active_at(Utc::now(), ActivePolicy::default())
    }

    #[must_use]
    pub fn active_with(&self, policy: ActivePolicy) -> bool {
        self.active_at(Utc::now(), policy)
    }

    #[must_use]
    pub fn active_at(&self, now: DateTime<Utc>, policy: ActivePolicy) -> bool {
        if self.ended_at(now) {
            return false;
        }
        match self.status {
            SubscriptionStatus::Incomplete => policy.keep_incomplete_active,
            SubscriptionStatus::PastDue => policy.keep_past_due_active,
            SubscriptionStatus::IncompleteExpired | SubscriptionStatus::Unpaid => false,
            _ => true,
        }
    }

    /// Check if the subscription is active, on trial, or on a grace period.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid_at(Utc::now(), ActivePolicy::default())
    }

    #[must_use]
    pub fn valid_at(&self, now: DateTime<Utc>, policy: ActivePolicy) -> bool {
        self.active_at(now, policy) || self.on_trial_at(now) || self.on_grace_period_at(now)
    }

    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.ends_at.is_some()
    }

    #[must_use]
    pub fn on_grace_period(&self) -> bool {
        self.on_grace_period_at(Utc::now())
    }

    #[must_use]
    pub fn on_grace_period_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|ends_at| ends_at > now)
    }

    /// Cancelled and past the grace period.
    #[must_use]
    pub fn ended(&self) -> bool {
        self.ended_at(Utc::now())
    }

    #[must_use]
    pub fn ended_at(&self, now: DateTime<Utc>) -> bool {
        self.cancelled() && !self.on_grace_period_at(now)
    }

    #[must_use]
    pub fn on_trial(&self) -> bool {
        self.on_trial_at(Utc::now())
    }

    #[must_use]
    pub fn on_trial_at(&self, now: DateTime<Utc>) -> bool {
        self.trial_ends_at.is_some_and(|trial_end| trial_end > now)
    }

    #[must_use]
    pub fn has_expired_trial(&self) -> bool {
        self.has_expired_trial_at(Utc::now())
    }

    #[must_use]
    pub fn has_expired_trial_at(&self, now: DateTime<Utc>) -> bool {
        self.trial_ends_at.is_some_and(|trial_end| trial_end <= now)
    }

    /// Neither on trial nor cancelled.
    #[must_use]
    pub fn recurring(&self) -> bool {
        self.recurring_at(Utc::now())
    }

    #[must_use]
    pub fn recurring_at(&self, now: DateTime<Utc>) -> bool {
        !self.on_trial_at(now) && !self.cancelled()
    }

    #[must_use]
    pub fn incomplete(&self) -> bool {
        self.status == SubscriptionStatus::Incomplete
    }

    #[must_use]
    pub fn past_due(&self) -> bool {
        self.status == SubscriptionStatus::PastDue
    }

    /// Check if a payment needs a new payment method or a confirmation step.
    #[must_use]
    pub fn has_incomplete_payment(&self) -> bool {
        self.incomplete() || self.past_due()
    }
}
