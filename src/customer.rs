//! Customer management.
//!
//! Creates gateway customers for billable owners and keeps the owner to
//! customer link in the store.

use std::collections::HashMap;

use crate::error::{CashierError, Result};
use crate::gateway::{CreateCustomerRequest, Gateway};
use crate::storage::SubscriptionStore;

/// Metadata key for the owner ID on gateway customers.
pub const META_BILLABLE_ID: &str = "billable_id";
/// Metadata key for the owner type on gateway customers.
pub const META_BILLABLE_TYPE: &str = "billable_type";

/// An application entity that can hold a gateway customer and subscriptions.
///
/// Implement this trait for your User or Team types.
pub trait Billable: Send + Sync {
    /// Get the unique ID of this owner.
    fn billable_id(&self) -> &str;

    /// Get the owner kind ("user", "team", ...).
    fn billable_type(&self) -> &str;

    /// Email used when creating the gateway customer.
    fn email(&self) -> Option<&str> {
        None
    }

    fn name(&self) -> Option<&str> {
        None
    }
}

/// Overrides applied when a gateway customer is created.
#[derive(Debug, Clone, Default)]
pub struct CustomerOptions {
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl CustomerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Customer management operations.
#[derive(Clone)]
pub struct CustomerManager<S: SubscriptionStore, G: Gateway> {
    store: S,
    gateway: G,
}

impl<S: SubscriptionStore, G: Gateway> CustomerManager<S, G> {
    /// Create a new customer manager.
    #[must_use]
    pub fn new(store: S, gateway: G) -> Self {
        Self { store, gateway }
    }

    /// Get the gateway customer ID for an owner, creating one if needed.
    ///
    /// When a payment method is given it becomes the customer's invoice
    /// default, for new and existing customers alike.
    pub async fn get_or_create_customer(
        &self,
        owner: &(impl Billable + ?Sized),
        payment_method: Option<&str>,
        options: CustomerOptions,
    ) -> Result<String> {
        if let Some(customer_id) = self.store.get_customer_id(owner.billable_id()).await? {
            if let Some(pm) = payment_method {
                self.gateway
                    .set_default_payment_method(&customer_id, pm)
                    .await?;
            }
            return Ok(customer_id);
        }

        let mut metadata = options.metadata;
        metadata.insert(META_BILLABLE_ID.to_string(), owner.billable_id().to_string());
        metadata.insert(
            META_BILLABLE_TYPE.to_string(),
            owner.billable_type().to_string(),
        );

        let customer = self
            .gateway
            .create_customer(CreateCustomerRequest {
                email: options.email.or_else(|| owner.email().map(String::from)),
                name: options.name.or_else(|| owner.name().map(String::from)),
                metadata,
                payment_method: payment_method.map(String::from),
            })
            .await?;

        self.store
            .set_customer_id(owner.billable_id(), owner.billable_type(), &customer.id)
            .await?;

        tracing::info!(
            target: "cashier::customer",
            owner_id = owner.billable_id(),
            customer_id = %customer.id,
            "Created gateway customer"
        );

        Ok(customer.id)
    }

    /// Get the gateway customer ID for an owner (without creating).
    pub async fn get_customer_id(&self, owner_id: &str) -> Result<Option<String>> {
        self.store.get_customer_id(owner_id).await
    }

    /// Get the gateway customer ID, failing if the owner has none.
    pub async fn customer_id(&self, owner_id: &str) -> Result<String> {
        self.store
            .get_customer_id(owner_id)
            .await?
            .ok_or_else(|| CashierError::InvalidCustomer {
                owner_id: owner_id.to_string(),
            })
    }

    /// Link an existing gateway customer to an owner.
    pub async fn link_customer(
        &self,
        owner: &(impl Billable + ?Sized),
        customer_id: &str,
    ) -> Result<()> {
        self.store
            .set_customer_id(owner.billable_id(), owner.billable_type(), customer_id)
            .await
    }

    /// Make a payment method the owner's invoice default.
    pub async fn update_default_payment_method(
        &self,
        owner_id: &str,
        payment_method: &str,
    ) -> Result<()> {
        let customer_id = self.customer_id(owner_id).await?;
        self.gateway
            .set_default_payment_method(&customer_id, payment_method)
            .await
    }
}
