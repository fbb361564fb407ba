//! Payment gateway abstraction.
//!
//! [`Gateway`] is the seam between the reconciliation core and the remote
//! billing system. [`StripeGateway`] talks to Stripe through the `async-stripe` SDK;
//! [`mock::MockGateway`] keeps everything in memory for tests.

#[cfg(any(test, feature = "test-cashier"))]
pub mod mock;
mod stripe;
mod types;

pub use stripe::StripeGateway;
pub use types::*;

use crate::error::Result;

/// Remote operations the subscription core depends on.
///
/// Subscription responses from [`create_subscription`](Gateway::create_subscription)
/// and [`retrieve_subscription`](Gateway::retrieve_subscription) carry the
/// latest invoice with its payment intent expanded.
#[allow(async_fn_in_trait)]
pub trait Gateway: Send + Sync {
    /// Create a customer, attaching `payment_method` as the invoice default if given.
    async fn create_customer(&self, request: CreateCustomerRequest) -> Result<GatewayCustomer>;

    /// Attach a payment method and make it the customer's invoice default.
    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> Result<()>;

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<GatewaySubscription>;

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        request: UpdateSubscriptionRequest,
    ) -> Result<GatewaySubscription>;

    /// Cancel immediately, or flag for cancellation at period end.
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        request: CancelSubscriptionRequest,
    ) -> Result<GatewaySubscription>;

    async fn create_subscription_item(
        &self,
        request: CreateSubscriptionItemRequest,
    ) -> Result<GatewaySubscriptionItem>;

    async fn update_subscription_item(
        &self,
        item_id: &str,
        request: UpdateSubscriptionItemRequest,
    ) -> Result<GatewaySubscriptionItem>;

    async fn delete_subscription_item(
        &self,
        item_id: &str,
        request: DeleteSubscriptionItemRequest,
    ) -> Result<()>;

    /// Create an invoice for pending items, optionally scoped to one subscription.
    ///
    /// Fails with a "nothing to invoice" gateway error when there is nothing billable.
    async fn create_invoice(
        &self,
        customer_id: &str,
        subscription_id: Option<&str>,
    ) -> Result<GatewayInvoice>;

    /// Attempt to pay an open invoice. The payment intent is expanded.
    async fn pay_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice>;

    async fn retrieve_payment_intent(&self, payment_intent_id: &str)
    -> Result<GatewayPaymentIntent>;

    /// Confirm a payment intent, optionally with a specific payment method.
    async fn confirm_payment_intent(
        &self,
        payment_intent_id: &str,
        payment_method: Option<&str>,
    ) -> Result<GatewayPaymentIntent>;
}
