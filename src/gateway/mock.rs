//! In-memory gateway for tests.
//!
//! Models the parts of gateway behavior the reconciliation core depends on:
//! trials, incomplete first payments, pending prorations that make an
//! out-of-cycle invoice possible, payment behaviors, and confirmation of
//! payment intents. Knobs let tests script the next payment outcome or fail
//! the next call of a given operation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};

use super::Gateway;
use super::types::*;
use crate::error::{CashierError, GatewayError, GatewayErrorKind, Result};

const PERIOD_DAYS: i64 = 30;
/// Charge per licensed unit, in minor units.
const UNIT_AMOUNT: i64 = 1000;

fn missing(operation: &str, resource: &str, id: &str) -> CashierError {
    GatewayError::new(
        GatewayErrorKind::InvalidRequest,
        operation,
        format!("No such {resource}: '{id}'"),
    )
    .with_code("resource_missing")
    .with_status(404)
    .into()
}

fn invalid(operation: &str, message: &str) -> CashierError {
    GatewayError::new(GatewayErrorKind::InvalidRequest, operation, message)
        .with_status(400)
        .into()
}

/// The error the gateway raises when a charge does not go through.
fn payment_error(operation: &str, intent_status: &str) -> CashierError {
    if intent_status == "requires_payment_method" {
        GatewayError::card_declined(operation, "Your card was declined.").into()
    } else {
        GatewayError::new(
            GatewayErrorKind::Card,
            operation,
            "This payment requires additional user action before it can be completed successfully.",
        )
        .with_code("invoice_payment_intent_requires_action")
        .with_status(402)
        .into()
    }
}

fn licensed_amount(items: &[GatewaySubscriptionItem]) -> i64 {
    items
        .iter()
        .filter_map(GatewaySubscriptionItem::local_quantity)
        .map(|q| q as i64 * UNIT_AMOUNT)
        .sum()
}

struct Charge {
    invoice_id: String,
    /// Intent status, `None` when nothing was charged.
    status: Option<String>,
}

impl Charge {
    fn succeeded(&self) -> bool {
        self.status.as_deref().is_none_or(|s| s == "succeeded")
    }
}

#[derive(Default)]
struct MockState {
    counter: u64,
    customers: HashMap<String, GatewayCustomer>,
    default_payment_methods: HashMap<String, String>,
    subscriptions: HashMap<String, GatewaySubscription>,
    /// Invoices with their payment intent stored as an ID.
    invoices: HashMap<String, GatewayInvoice>,
    invoice_order: Vec<String>,
    payment_intents: HashMap<String, GatewayPaymentIntent>,
    metered_prices: HashSet<String>,
    /// Customers with prorations waiting for the next invoice.
    pending_charges: HashSet<String>,
    next_payment_status: Option<String>,
    next_confirm_status: Option<String>,
    failures: HashMap<String, GatewayError>,
    force_nothing_to_invoice: bool,
    calls: Vec<String>,
    updates: Vec<(String, UpdateSubscriptionRequest)>,
    cancellations: Vec<(String, CancelSubscriptionRequest)>,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_mock{:04}", prefix, self.counter)
    }

    /// Record the call and fail it if a failure was scripted.
    fn enter(&mut self, operation: &str) -> Result<()> {
        self.calls.push(operation.to_string());
        match self.failures.remove(operation) {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn price(&self, id: &str) -> GatewayPrice {
        let usage_type = if self.metered_prices.contains(id) {
            "metered"
        } else {
            "licensed"
        };
        GatewayPrice {
            id: id.to_string(),
            product: None,
            recurring: Some(GatewayRecurring {
                interval: Some("month".to_string()),
                usage_type: Some(usage_type.to_string()),
            }),
        }
    }

    fn new_item(&mut self, price: &str, quantity: Option<u64>) -> GatewaySubscriptionItem {
        let price = self.price(price);
        let quantity = if price.is_metered() {
            None
        } else {
            Some(quantity.unwrap_or(1))
        };
        GatewaySubscriptionItem {
            id: self.next_id("si"),
            price,
            quantity,
            current_period_end: None,
        }
    }

    fn create_intent(&mut self, customer: &str, invoice_id: &str, amount: i64) -> GatewayPaymentIntent {
        let id = self.next_id("pi");
        let status = self
            .next_payment_status
            .take()
            .unwrap_or_else(|| "succeeded".to_string());
        let intent = GatewayPaymentIntent {
            client_secret: Some(format!("{id}_secret_mock")),
            id: id.clone(),
            amount,
            currency: "usd".to_string(),
            status,
            customer: Some(customer.to_string()),
            invoice: Some(invoice_id.to_string()),
            payment_method: self.default_payment_methods.get(customer).cloned(),
        };
        self.payment_intents.insert(id, intent.clone());
        intent
    }

    fn insert_invoice(&mut self, invoice: GatewayInvoice) {
        self.invoice_order.push(invoice.id.clone());
        self.invoices.insert(invoice.id.clone(), invoice);
    }

    /// Create an invoice for `amount` and try to pay it.
    fn charge(&mut self, customer: &str, subscription: Option<&str>, amount: i64) -> Charge {
        let invoice_id = self.next_id("in");
        let intent = (amount > 0).then(|| self.create_intent(customer, &invoice_id, amount));
        let status = intent.as_ref().map(|i| i.status.clone());
        let paid = status.as_deref().is_none_or(|s| s == "succeeded");

        self.insert_invoice(GatewayInvoice {
            id: invoice_id.clone(),
            customer: Some(customer.to_string()),
            subscription: subscription.map(str::to_string),
            status: Some(if paid { "paid" } else { "open" }.to_string()),
            amount_due: amount,
            currency: "usd".to_string(),
            payment_intent: intent.map(|i| Expandable::Id(i.id)),
            hosted_invoice_url: None,
        });

        Charge { invoice_id, status }
    }

    /// Charge for a change and apply the payment behavior.
    ///
    /// Returns `false` when the change must stay pending.
    fn settle(
        &mut self,
        sub: &mut GatewaySubscription,
        behavior: PaymentBehavior,
        operation: &str,
    ) -> Result<bool> {
        let amount = licensed_amount(&sub.items.data);
        let (customer, id) = (sub.customer.clone(), sub.id.clone());
        let charge = self.charge(&customer, Some(id.as_str()), amount);
        sub.latest_invoice = Some(Expandable::Id(charge.invoice_id.clone()));

        if charge.succeeded() {
            return Ok(true);
        }
        let status = charge.status.unwrap_or_default();
        match behavior {
            PaymentBehavior::ErrorIfIncomplete => Err(payment_error(operation, &status)),
            PaymentBehavior::PendingIfIncomplete => Ok(false),
            PaymentBehavior::AllowIncomplete | PaymentBehavior::DefaultIncomplete => {
                sub.status = "past_due".to_string();
                Ok(true)
            }
        }
    }

    fn note_proration(&mut self, sub: &GatewaySubscription, proration: ProrationBehavior) {
        if sub.status != "trialing" && proration == ProrationBehavior::CreateProrations {
            self.pending_charges.insert(sub.customer.clone());
        }
    }

    fn expand_invoice(&self, invoice_id: &str) -> Option<GatewayInvoice> {
        let mut invoice = self.invoices.get(invoice_id)?.clone();
        if let Some(Expandable::Id(pi)) = &invoice.payment_intent {
            if let Some(intent) = self.payment_intents.get(pi) {
                invoice.payment_intent = Some(Expandable::Object(Box::new(intent.clone())));
            }
        }
        Some(invoice)
    }

    fn expand_subscription(&self, sub: &GatewaySubscription) -> GatewaySubscription {
        let mut sub = sub.clone();
        if let Some(reference) = &sub.latest_invoice {
            if let Some(invoice) = self.expand_invoice(reference.id()) {
                sub.latest_invoice = Some(Expandable::Object(Box::new(invoice)));
            }
        }
        sub
    }

    fn find_item_owner(&self, item_id: &str) -> Option<String> {
        self.subscriptions
            .values()
            .find(|s| s.items.data.iter().any(|i| i.id == item_id))
            .map(|s| s.id.clone())
    }
}

/// In-memory [`Gateway`] with scriptable outcomes.
///
/// Clones share state, so a test can keep a handle after passing the gateway
/// to a manager.
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<RwLock<MockState>>,
}

impl MockGateway {
    /// Create a new mock gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `price` as usage-based.
    pub fn register_metered_price(&self, price: impl Into<String>) {
        self.state.write().unwrap().metered_prices.insert(price.into());
    }

    /// Status of the next payment intent created (e.g. "requires_action").
    pub fn set_next_payment_status(&self, status: impl Into<String>) {
        self.state.write().unwrap().next_payment_status = Some(status.into());
    }

    /// Status the next confirmation moves its intent to.
    pub fn set_next_confirm_status(&self, status: impl Into<String>) {
        self.state.write().unwrap().next_confirm_status = Some(status.into());
    }

    /// Fail the next call of `operation` (e.g. "update_subscription").
    pub fn fail_next(&self, operation: impl Into<String>, error: GatewayError) {
        self.state
            .write()
            .unwrap()
            .failures
            .insert(operation.into(), error);
    }

    /// Make every invoice creation report nothing to invoice.
    pub fn set_nothing_to_invoice(&self, nothing: bool) {
        self.state.write().unwrap().force_nothing_to_invoice = nothing;
    }

    /// Change a subscription's status as if it happened at the gateway.
    pub fn set_subscription_status(&self, subscription_id: &str, status: impl Into<String>) {
        if let Some(sub) = self
            .state
            .write()
            .unwrap()
            .subscriptions
            .get_mut(subscription_id)
        {
            sub.status = status.into();
        }
    }

    /// A subscription with its latest invoice and payment intent expanded.
    #[must_use]
    pub fn subscription(&self, subscription_id: &str) -> Option<GatewaySubscription> {
        let state = self.state.read().unwrap();
        state
            .subscriptions
            .get(subscription_id)
            .map(|s| state.expand_subscription(s))
    }

    #[must_use]
    pub fn customer(&self, customer_id: &str) -> Option<GatewayCustomer> {
        self.state.read().unwrap().customers.get(customer_id).cloned()
    }

    #[must_use]
    pub fn default_payment_method(&self, customer_id: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .default_payment_methods
            .get(customer_id)
            .cloned()
    }

    #[must_use]
    pub fn payment_intent(&self, payment_intent_id: &str) -> Option<GatewayPaymentIntent> {
        self.state
            .read()
            .unwrap()
            .payment_intents
            .get(payment_intent_id)
            .cloned()
    }

    /// All invoices in creation order.
    #[must_use]
    pub fn invoices(&self) -> Vec<GatewayInvoice> {
        let state = self.state.read().unwrap();
        state
            .invoice_order
            .iter()
            .filter_map(|id| state.expand_invoice(id))
            .collect()
    }

    #[must_use]
    pub fn updates(&self) -> Vec<(String, UpdateSubscriptionRequest)> {
        self.state.read().unwrap().updates.clone()
    }

    #[must_use]
    pub fn last_update(&self) -> Option<UpdateSubscriptionRequest> {
        self.state
            .read()
            .unwrap()
            .updates
            .last()
            .map(|(_, request)| request.clone())
    }

    #[must_use]
    pub fn cancellations(&self) -> Vec<(String, CancelSubscriptionRequest)> {
        self.state.read().unwrap().cancellations.clone()
    }

    /// Names of every operation called so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.read().unwrap().calls.clone()
    }
}

impl Gateway for MockGateway {
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<GatewayCustomer> {
        let mut state = self.state.write().unwrap();
        state.enter("create_customer")?;

        let customer = GatewayCustomer {
            id: state.next_id("cus"),
            email: request.email,
            name: request.name,
            metadata: request.metadata,
        };
        if let Some(pm) = request.payment_method {
            state.default_payment_methods.insert(customer.id.clone(), pm);
        }
        state.customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<()> {
        let operation = "set_default_payment_method";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        if !state.customers.contains_key(customer_id) {
            return Err(missing(operation, "customer", customer_id));
        }
        state
            .default_payment_methods
            .insert(customer_id.to_string(), payment_method_id.to_string());
        Ok(())
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<GatewaySubscription> {
        let operation = "create_subscription";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        if request.items.is_empty() {
            return Err(invalid(operation, "Missing required param: items."));
        }
        if !state.customers.contains_key(&request.customer) {
            return Err(missing(operation, "customer", &request.customer));
        }

        let now = Utc::now();
        let id = state.next_id("sub");
        let mut items = Vec::with_capacity(request.items.len());
        for params in &request.items {
            items.push(state.new_item(&params.price, params.quantity));
        }

        let trial_end = match request.trial_end {
            Some(TrialEnd::At(at)) if at > now => Some(at),
            _ => None,
        };
        let period_end = trial_end
            .or(request.billing_cycle_anchor.filter(|at| *at > now))
            .unwrap_or(now + Duration::days(PERIOD_DAYS));

        let mut sub = GatewaySubscription {
            id: id.clone(),
            customer: request.customer.clone(),
            status: if trial_end.is_some() { "trialing" } else { "active" }.to_string(),
            items: items.into(),
            trial_end: trial_end.map(|at| at.timestamp()),
            current_period_end: Some(period_end.timestamp()),
            cancel_at_period_end: false,
            cancel_at: None,
            canceled_at: None,
            ended_at: None,
            latest_invoice: None,
            metadata: request.metadata.clone(),
        };

        let amount = if trial_end.is_some() {
            0
        } else {
            licensed_amount(&sub.items.data)
        };
        let charge = state.charge(&request.customer, Some(id.as_str()), amount);
        if !charge.succeeded() {
            if request.payment_behavior == PaymentBehavior::ErrorIfIncomplete {
                return Err(payment_error(operation, charge.status.as_deref().unwrap_or_default()));
            }
            sub.status = "incomplete".to_string();
        }
        sub.latest_invoice = Some(Expandable::Id(charge.invoice_id));

        state.subscriptions.insert(id, sub.clone());
        Ok(state.expand_subscription(&sub))
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
        let operation = "retrieve_subscription";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        let sub = state
            .subscriptions
            .get(subscription_id)
            .ok_or_else(|| missing(operation, "subscription", subscription_id))?;
        Ok(state.expand_subscription(sub))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        request: UpdateSubscriptionRequest,
    ) -> Result<GatewaySubscription> {
        let operation = "update_subscription";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;
        state
            .updates
            .push((subscription_id.to_string(), request.clone()));

        let original = state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| missing(operation, "subscription", subscription_id))?;
        if matches!(original.status.as_str(), "canceled" | "incomplete_expired") {
            return Err(invalid(
                operation,
                "A canceled subscription can only update its cancellation details and metadata.",
            ));
        }

        let now = Utc::now();
        let mut sub = original.clone();
        let mut billable_change = false;

        for change in &request.items {
            match &change.id {
                Some(item_id) => {
                    let pos = sub
                        .items
                        .data
                        .iter()
                        .position(|i| &i.id == item_id)
                        .ok_or_else(|| missing(operation, "subscription item", item_id))?;
                    if change.deleted {
                        sub.items.data.remove(pos);
                        billable_change = true;
                        continue;
                    }
                    if let Some(price) = &change.price {
                        if sub.items.data[pos].price.id != *price {
                            sub.items.data[pos].price = state.price(price);
                            billable_change = true;
                        }
                    }
                    if let Some(quantity) = change.quantity {
                        if sub.items.data[pos].quantity != Some(quantity) {
                            sub.items.data[pos].quantity = Some(quantity);
                            billable_change = true;
                        }
                    }
                }
                None => {
                    let Some(price) = &change.price else {
                        return Err(invalid(operation, "Missing required param: items[price]."));
                    };
                    let item = state.new_item(price, change.quantity);
                    sub.items.data.push(item);
                    billable_change = true;
                }
            }
        }

        let was_trialing = sub.status == "trialing";
        match request.trial_end {
            Some(TrialEnd::Now) => {
                sub.trial_end = None;
                if was_trialing {
                    sub.status = "active".to_string();
                    sub.current_period_end = Some((now + Duration::days(PERIOD_DAYS)).timestamp());
                }
            }
            Some(TrialEnd::At(at)) if at > now => {
                sub.trial_end = Some(at.timestamp());
                sub.status = "trialing".to_string();
                sub.current_period_end = Some(at.timestamp());
            }
            Some(TrialEnd::At(_)) => {
                return Err(invalid(
                    operation,
                    "Invalid timestamp: must be an integer Unix timestamp in the future.",
                ));
            }
            None => {}
        }

        let mut needs_charge = was_trialing && sub.status == "active";
        if request.billing_cycle_anchor == Some(BillingCycleAnchor::Now) && sub.status != "trialing" {
            sub.current_period_end = Some((now + Duration::days(PERIOD_DAYS)).timestamp());
            needs_charge = true;
        }

        let proration = request.proration_behavior.unwrap_or_default();
        if billable_change {
            if proration == ProrationBehavior::AlwaysInvoice && sub.status != "trialing" {
                needs_charge = true;
            } else {
                state.note_proration(&sub, proration);
            }
        }

        if let Some(cancel) = request.cancel_at_period_end {
            sub.cancel_at_period_end = cancel;
            sub.cancel_at = if cancel { sub.current_period_end } else { None };
        }
        if let Some(at) = request.cancel_at {
            sub.cancel_at = Some(at.timestamp());
            sub.cancel_at_period_end = false;
        }

        if needs_charge {
            let behavior = request.payment_behavior.unwrap_or_default();
            if !state.settle(&mut sub, behavior, operation)? {
                let latest_invoice = sub.latest_invoice.take();
                sub = original;
                sub.latest_invoice = latest_invoice;
            }
        }

        state
            .subscriptions
            .insert(subscription_id.to_string(), sub.clone());
        Ok(state.expand_subscription(&sub))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        request: CancelSubscriptionRequest,
    ) -> Result<GatewaySubscription> {
        let operation = "cancel_subscription";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;
        state
            .cancellations
            .push((subscription_id.to_string(), request));

        let mut sub = state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| missing(operation, "subscription", subscription_id))?;
        if sub.status == "canceled" {
            return Err(invalid(operation, "The subscription is already canceled."));
        }

        if request.at_period_end {
            sub.cancel_at_period_end = true;
            sub.cancel_at = sub.current_period_end;
        } else {
            let now = Utc::now().timestamp();
            sub.status = "canceled".to_string();
            sub.canceled_at = Some(now);
            sub.ended_at = Some(now);
            sub.cancel_at_period_end = false;
            if request.invoice_now && state.pending_charges.remove(&sub.customer) {
                let (customer, id) = (sub.customer.clone(), sub.id.clone());
                let charge = state.charge(&customer, Some(id.as_str()), UNIT_AMOUNT);
                sub.latest_invoice = Some(Expandable::Id(charge.invoice_id));
            }
        }

        state
            .subscriptions
            .insert(subscription_id.to_string(), sub.clone());
        Ok(state.expand_subscription(&sub))
    }

    async fn create_subscription_item(
        &self,
        request: CreateSubscriptionItemRequest,
    ) -> Result<GatewaySubscriptionItem> {
        let operation = "create_subscription_item";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        let mut sub = state
            .subscriptions
            .get(&request.subscription)
            .cloned()
            .ok_or_else(|| missing(operation, "subscription", &request.subscription))?;
        if sub.items.data.iter().any(|i| i.price.id == request.price) {
            return Err(invalid(
                operation,
                "Cannot add multiple subscription items with the same price.",
            ));
        }

        let item = state.new_item(&request.price, request.quantity);
        sub.items.data.push(item.clone());

        let applied = if request.proration_behavior == ProrationBehavior::AlwaysInvoice
            && sub.status != "trialing"
        {
            state.settle(&mut sub, request.payment_behavior, operation)?
        } else {
            state.note_proration(&sub, request.proration_behavior);
            true
        };
        if applied {
            state.subscriptions.insert(sub.id.clone(), sub);
        }
        Ok(item)
    }

    async fn update_subscription_item(
        &self,
        item_id: &str,
        request: UpdateSubscriptionItemRequest,
    ) -> Result<GatewaySubscriptionItem> {
        let operation = "update_subscription_item";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        let sub_id = state
            .find_item_owner(item_id)
            .ok_or_else(|| missing(operation, "subscription item", item_id))?;
        let mut sub = state
            .subscriptions
            .get(&sub_id)
            .cloned()
            .ok_or_else(|| missing(operation, "subscription", &sub_id))?;

        let pos = sub
            .items
            .data
            .iter()
            .position(|i| i.id == item_id)
            .ok_or_else(|| missing(operation, "subscription item", item_id))?;
        if let Some(price) = &request.price {
            sub.items.data[pos].price = state.price(price);
        }
        if request.quantity.is_some() {
            sub.items.data[pos].quantity = request.quantity;
        }
        let item = sub.items.data[pos].clone();

        let proration = request.proration_behavior.unwrap_or_default();
        let applied = if proration == ProrationBehavior::AlwaysInvoice && sub.status != "trialing" {
            let behavior = request.payment_behavior.unwrap_or_default();
            state.settle(&mut sub, behavior, operation)?
        } else {
            state.note_proration(&sub, proration);
            true
        };
        if applied {
            state.subscriptions.insert(sub_id, sub);
        }
        Ok(item)
    }

    async fn delete_subscription_item(
        &self,
        item_id: &str,
        request: DeleteSubscriptionItemRequest,
    ) -> Result<()> {
        let operation = "delete_subscription_item";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        let sub_id = state
            .find_item_owner(item_id)
            .ok_or_else(|| missing(operation, "subscription item", item_id))?;
        let mut sub = state
            .subscriptions
            .get(&sub_id)
            .cloned()
            .ok_or_else(|| missing(operation, "subscription", &sub_id))?;
        if sub.items.data.len() < 2 {
            return Err(invalid(
                operation,
                "A subscription must have at least one active plan.",
            ));
        }

        sub.items.data.retain(|i| i.id != item_id);
        state.note_proration(&sub, request.proration_behavior);
        state.subscriptions.insert(sub_id, sub);
        Ok(())
    }

    async fn create_invoice(
        &self,
        customer_id: &str,
        subscription_id: Option<&str>,
    ) -> Result<GatewayInvoice> {
        let operation = "create_invoice";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        if state.force_nothing_to_invoice || !state.pending_charges.remove(customer_id) {
            return Err(GatewayError::nothing_to_invoice(operation).into());
        }

        let invoice = GatewayInvoice {
            id: state.next_id("in"),
            customer: Some(customer_id.to_string()),
            subscription: subscription_id.map(str::to_string),
            status: Some("draft".to_string()),
            amount_due: UNIT_AMOUNT,
            currency: "usd".to_string(),
            payment_intent: None,
            hosted_invoice_url: None,
        };
        state.insert_invoice(invoice.clone());
        Ok(invoice)
    }

    async fn pay_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice> {
        let operation = "pay_invoice";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        let mut invoice = state
            .invoices
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| missing(operation, "invoice", invoice_id))?;
        if invoice.status.as_deref() == Some("paid") {
            return Err(invalid(operation, "Invoice is already paid."));
        }

        let customer = invoice.customer.clone().unwrap_or_default();
        let intent = state.create_intent(&customer, invoice_id, invoice.amount_due);
        let succeeded = intent.status == "succeeded";
        invoice.status = Some(if succeeded { "paid" } else { "open" }.to_string());
        invoice.payment_intent = Some(Expandable::Id(intent.id.clone()));
        state.invoices.insert(invoice_id.to_string(), invoice.clone());

        if !succeeded {
            if let Some(sub) = invoice
                .subscription
                .as_deref()
                .and_then(|id| state.subscriptions.get_mut(id))
            {
                sub.status = "past_due".to_string();
                sub.latest_invoice = Some(Expandable::Id(invoice_id.to_string()));
            }
            return Err(payment_error(operation, &intent.status));
        }

        Ok(state.expand_invoice(invoice_id).unwrap_or(invoice))
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<GatewayPaymentIntent> {
        let operation = "retrieve_payment_intent";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        state
            .payment_intents
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| missing(operation, "payment_intent", payment_intent_id))
    }

    async fn confirm_payment_intent(
        &self,
        payment_intent_id: &str,
        payment_method: Option<&str>,
    ) -> Result<GatewayPaymentIntent> {
        let operation = "confirm_payment_intent";
        let mut state = self.state.write().unwrap();
        state.enter(operation)?;

        let mut intent = state
            .payment_intents
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| missing(operation, "payment_intent", payment_intent_id))?;
        if intent.status == "succeeded" {
            return Err(GatewayError::new(
                GatewayErrorKind::InvalidRequest,
                operation,
                "This PaymentIntent has already succeeded.",
            )
            .with_code("payment_intent_unexpected_state")
            .with_status(400)
            .into());
        }

        let payment_method = payment_method.map(str::to_string).or_else(|| {
            intent
                .customer
                .as_ref()
                .and_then(|c| state.default_payment_methods.get(c).cloned())
        });
        let status = state.next_confirm_status.take().unwrap_or_else(|| {
            match intent.status.as_str() {
                "requires_confirmation" => "succeeded".to_string(),
                "requires_payment_method" if payment_method.is_some() => "succeeded".to_string(),
                other => other.to_string(),
            }
        });
        intent.status = status;
        intent.payment_method = payment_method;
        state
            .payment_intents
            .insert(intent.id.clone(), intent.clone());

        if intent.status == "requires_payment_method" {
            return Err(GatewayError::card_declined(operation, "Your card was declined.").into());
        }

        if intent.status == "succeeded" {
            if let Some(invoice_id) = intent.invoice.clone() {
                if let Some(invoice) = state.invoices.get_mut(&invoice_id) {
                    invoice.status = Some("paid".to_string());
                }
                for sub in state.subscriptions.values_mut() {
                    let is_latest = sub
                        .latest_invoice
                        .as_ref()
                        .is_some_and(|i| i.id() == invoice_id);
                    if is_latest && matches!(sub.status.as_str(), "incomplete" | "past_due") {
                        sub.status = "active".to_string();
                    }
                }
            }
        }

        Ok(intent)
    }
}
