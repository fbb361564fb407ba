//! Gateway data transfer objects.
//!
//! Responses are deserialized into these explicit types; nothing downstream
//! reads raw JSON. Timestamps are unix seconds, amounts are minor units.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subscription::SubscriptionStatus;

/// Convert a unix timestamp from the gateway into a UTC instant.
#[inline]
pub(crate) fn timestamp_to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}

// =============================================================================
// Expandable references
// =============================================================================

/// Objects that carry a gateway identifier.
pub trait GatewayObject {
    fn object_id(&self) -> &str;
}

/// A reference that is either a bare ID or the expanded object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T: GatewayObject> Expandable<T> {
    /// The referenced object's ID, expanded or not.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object(object) => object.object_id(),
        }
    }

    /// The expanded object, if the gateway returned it.
    #[must_use]
    pub fn as_object(&self) -> Option<&T> {
        match self {
            Self::Id(_) => None,
            Self::Object(object) => Some(object),
        }
    }
}

/// A paginated list envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
        }
    }
}

impl<T> From<Vec<T>> for List<T> {
    fn from(data: Vec<T>) -> Self {
        Self {
            data,
            has_more: false,
        }
    }
}

// =============================================================================
// Resources
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRecurring {
    #[serde(default)]
    pub interval: Option<String>,
    /// "licensed" or "metered".
    #[serde(default)]
    pub usage_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPrice {
    pub id: String,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub recurring: Option<GatewayRecurring>,
}

impl GatewayPrice {
    /// Usage-based prices have no client-set quantity.
    #[must_use]
    pub fn is_metered(&self) -> bool {
        self.recurring
            .as_ref()
            .and_then(|r| r.usage_type.as_deref())
            == Some("metered")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySubscriptionItem {
    pub id: String,
    pub price: GatewayPrice,
    #[serde(default)]
    pub quantity: Option<u64>,
    /// Newer API versions report the billing period per item.
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl GatewaySubscriptionItem {
    /// Quantity as the local record stores it: `None` for metered prices.
    #[must_use]
    pub fn local_quantity(&self) -> Option<u64> {
        if self.price.is_metered() {
            None
        } else {
            Some(self.quantity.unwrap_or(1))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    pub customer: String,
    /// Status string, verbatim.
    pub status: String,
    #[serde(default)]
    pub items: List<GatewaySubscriptionItem>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub latest_invoice: Option<Expandable<GatewayInvoice>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl GatewaySubscription {
    #[must_use]
    pub fn subscription_status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_gateway(&self.status)
    }

    #[must_use]
    pub fn trial_ends_at(&self) -> Option<DateTime<Utc>> {
        self.trial_end.and_then(timestamp_to_datetime)
    }

    /// End of the current billing period.
    ///
    /// Falls back to the first item's period for API versions that moved the
    /// field onto items.
    #[must_use]
    pub fn current_period_ends_at(&self) -> Option<DateTime<Utc>> {
        self.current_period_end
            .or_else(|| self.items.data.first().and_then(|i| i.current_period_end))
            .and_then(timestamp_to_datetime)
    }

    /// Scheduled cancellation instant, or when the cancellation was requested.
    #[must_use]
    pub fn cancel_at_datetime(&self) -> Option<DateTime<Utc>> {
        self.cancel_at
            .or(self.canceled_at)
            .and_then(timestamp_to_datetime)
    }

    /// The latest invoice's payment intent, when both were expanded.
    #[must_use]
    pub fn latest_payment_intent(&self) -> Option<&GatewayPaymentIntent> {
        self.latest_invoice
            .as_ref()
            .and_then(Expandable::as_object)
            .and_then(|invoice| invoice.payment_intent.as_ref())
            .and_then(Expandable::as_object)
    }

    /// The latest invoice's payment intent ID, expanded or not.
    #[must_use]
    pub fn latest_payment_intent_id(&self) -> Option<&str> {
        self.latest_invoice
            .as_ref()
            .and_then(Expandable::as_object)
            .and_then(|invoice| invoice.payment_intent.as_ref())
            .map(Expandable::id)
    }
}

impl GatewayObject for GatewaySubscription {
    fn object_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayInvoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub payment_intent: Option<Expandable<GatewayPaymentIntent>>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
}

impl GatewayObject for GatewayInvoice {
    fn object_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
}

impl GatewayObject for GatewayPaymentIntent {
    fn object_id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Request options
// =============================================================================

/// When the trial should end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialEnd {
    /// End the trial immediately.
    Now,
    At(DateTime<Utc>),
}

/// How to handle proration on price or quantity changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProrationBehavior {
    /// Create prorations for any changes (default).
    #[default]
    CreateProrations,
    /// Don't create prorations.
    None,
    /// Create prorations and invoice them immediately.
    AlwaysInvoice,
}

impl ProrationBehavior {
    /// Convert to the gateway's string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProrations => "create_prorations",
            Self::None => "none",
            Self::AlwaysInvoice => "always_invoice",
        }
    }
}

/// What the gateway does when a change needs a payment that fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PaymentBehavior {
    /// Apply the change and leave the subscription past due / incomplete.
    #[default]
    AllowIncomplete,
    /// Create the subscription incomplete until the first payment succeeds.
    DefaultIncomplete,
    /// Reject the change if the payment fails.
    ErrorIfIncomplete,
    /// Keep the change pending until the payment succeeds.
    PendingIfIncomplete,
}

impl PaymentBehavior {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllowIncomplete => "allow_incomplete",
            Self::DefaultIncomplete => "default_incomplete",
            Self::ErrorIfIncomplete => "error_if_incomplete",
            Self::PendingIfIncomplete => "pending_if_incomplete",
        }
    }
}

/// Billing cycle anchor for an existing subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingCycleAnchor {
    /// Restart the billing cycle now.
    Now,
    Unchanged,
}

impl BillingCycleAnchor {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::Unchanged => "unchanged",
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Request to create a gateway customer.
#[derive(Debug, Clone, Default)]
pub struct CreateCustomerRequest {
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Attached and set as the invoice default when present.
    pub payment_method: Option<String>,
}

/// One line item of a new subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionItemParams {
    pub price: String,
    /// `None` for metered prices.
    pub quantity: Option<u64>,
}

/// Request to create a subscription.
#[derive(Debug, Clone, Default)]
pub struct CreateSubscriptionRequest {
    pub customer: String,
    pub items: Vec<SubscriptionItemParams>,
    pub trial_end: Option<TrialEnd>,
    pub coupon: Option<String>,
    pub promotion_code: Option<String>,
    pub metadata: HashMap<String, String>,
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    pub proration_behavior: Option<ProrationBehavior>,
    pub payment_behavior: PaymentBehavior,
    pub default_payment_method: Option<String>,
}

/// An item change within a subscription update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSubscriptionItem {
    /// Existing item to change; `None` adds a new item.
    pub id: Option<String>,
    pub price: Option<String>,
    pub quantity: Option<u64>,
    pub deleted: bool,
}

/// Request to update a subscription.
#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionRequest {
    pub items: Vec<UpdateSubscriptionItem>,
    pub trial_end: Option<TrialEnd>,
    pub proration_behavior: Option<ProrationBehavior>,
    pub billing_cycle_anchor: Option<BillingCycleAnchor>,
    pub cancel_at_period_end: Option<bool>,
    pub cancel_at: Option<DateTime<Utc>>,
    pub payment_behavior: Option<PaymentBehavior>,
}

impl UpdateSubscriptionRequest {
    /// Create a new update request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Change an existing item's price and/or quantity.
    #[must_use]
    pub fn item(
        mut self,
        id: impl Into<String>,
        price: Option<String>,
        quantity: Option<u64>,
    ) -> Self {
        self.items.push(UpdateSubscriptionItem {
            id: Some(id.into()),
            price,
            quantity,
            deleted: false,
        });
        self
    }

    #[must_use]
    pub fn trial_end(mut self, trial_end: TrialEnd) -> Self {
        self.trial_end = Some(trial_end);
        self
    }

    #[must_use]
    pub fn proration_behavior(mut self, behavior: ProrationBehavior) -> Self {
        self.proration_behavior = Some(behavior);
        self
    }

    #[must_use]
    pub fn billing_cycle_anchor(mut self, anchor: Option<BillingCycleAnchor>) -> Self {
        self.billing_cycle_anchor = anchor;
        self
    }

    #[must_use]
    pub fn cancel_at_period_end(mut self, cancel: bool) -> Self {
        self.cancel_at_period_end = Some(cancel);
        self
    }

    #[must_use]
    pub fn cancel_at(mut self, at: DateTime<Utc>) -> Self {
        self.cancel_at = Some(at);
        self
    }

    #[must_use]
    pub fn payment_behavior(mut self, behavior: PaymentBehavior) -> Self {
        self.payment_behavior = Some(behavior);
        self
    }
}

/// Request to cancel a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelSubscriptionRequest {
    /// Keep the subscription until the end of the paid period.
    pub at_period_end: bool,
    /// Invoice pending usage and prorations immediately (immediate cancel only).
    pub invoice_now: bool,
    /// Credit unused time (immediate cancel only).
    pub prorate: bool,
}

impl CancelSubscriptionRequest {
    #[must_use]
    pub fn at_period_end() -> Self {
        Self {
            at_period_end: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn immediately() -> Self {
        Self::default()
    }
}

/// Request to add an item to a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionItemRequest {
    pub subscription: String,
    pub price: String,
    pub quantity: Option<u64>,
    pub proration_behavior: ProrationBehavior,
    pub payment_behavior: PaymentBehavior,
}

/// Request to change a single subscription item.
#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionItemRequest {
    pub price: Option<String>,
    pub quantity: Option<u64>,
    pub proration_behavior: Option<ProrationBehavior>,
    pub payment_behavior: Option<PaymentBehavior>,
}

/// Request to remove an item from a subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteSubscriptionItemRequest {
    pub proration_behavior: ProrationBehavior,
    /// Drop reported usage of metered items.
    pub clear_usage: bool,
}
