//! Storage traits for subscription data.
//!
//! Implement [`SubscriptionStore`] to persist subscriptions to your database.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{CashierError, Result};
use crate::subscription::Subscription;

/// The owner linked to a gateway customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub owner_id: String,
    pub owner_type: String,
}

/// Trait for storing subscription data.
///
/// Writers follow last-write-wins: the store holds a cache of gateway state
/// and every writer overwrites it with what the gateway last reported.
/// An in-memory implementation is provided for testing.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // Customer links

    /// Get the gateway customer ID for an owner.
    async fn get_customer_id(&self, owner_id: &str) -> Result<Option<String>>;

    /// Link an owner to a gateway customer.
    async fn set_customer_id(
        &self,
        owner_id: &str,
        owner_type: &str,
        customer_id: &str,
    ) -> Result<()>;

    /// Remove an owner's customer link.
    async fn clear_customer_id(&self, owner_id: &str) -> Result<()>;

    /// Reverse lookup for webhooks.
    async fn find_owner_by_customer_id(&self, customer_id: &str) -> Result<Option<OwnerRef>>;

    // Subscriptions

    async fn find_subscription(&self, id: Uuid) -> Result<Option<Subscription>>;

    /// The newest subscription of an owner with this name.
    ///
    /// Ended subscriptions keep their rows, so several may share a name.
    async fn find_subscription_by_name(
        &self,
        owner_id: &str,
        name: &str,
    ) -> Result<Option<Subscription>>;

    async fn find_subscription_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> Result<Option<Subscription>>;

    /// All subscriptions of an owner, oldest first.
    async fn list_subscriptions(&self, owner_id: &str) -> Result<Vec<Subscription>>;

    /// Insert or update a subscription together with its items.
    ///
    /// The row and its item list are written atomically; items missing from
    /// `subscription.items` are removed. Fails if another row already mirrors
    /// the same `gateway_id`.
    async fn save_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Delete a subscription and its items.
    async fn delete_subscription(&self, id: Uuid) -> Result<()>;

    // Webhook idempotency

    /// Check if a webhook event has already been processed.
    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Mark a webhook event as processed.
    async fn mark_event_processed(&self, event_id: &str) -> Result<()>;

    /// Clean up old processed events (default: no-op).
    async fn cleanup_old_events(&self, _older_than_days: u32) -> Result<usize> {
        Ok(0)
    }
}

/// Save a subscription whose remote counterpart was already changed.
///
/// A failure here means the local record no longer matches the gateway, so it
/// is reported as [`CashierError::Inconsistent`] rather than a plain database
/// error.
pub(crate) async fn save_after_remote<S: SubscriptionStore + ?Sized>(
    store: &S,
    subscription: &Subscription,
) -> Result<()> {
    store
        .save_subscription(subscription)
        .await
        .map_err(|err| inconsistent(subscription, err))
}

/// Save a subscription the gateway has just created.
///
/// A webhook for the same remote subscription may insert its own row before
/// or while this save runs. That row is adopted instead of being duplicated.
pub(crate) async fn save_created_after_remote<S: SubscriptionStore + ?Sized>(
    store: &S,
    subscription: &mut Subscription,
) -> Result<()> {
    if let Some(existing) = find_by_gateway_id_after_remote(store, subscription).await? {
        subscription.adopt_row(&existing);
    }

    let Err(err) = store.save_subscription(subscription).await else {
        return Ok(());
    };

    match find_by_gateway_id_after_remote(store, subscription).await? {
        Some(existing) if existing.id != subscription.id => {
            tracing::debug!(
                target: "cashier::store",
                subscription_id = %existing.id,
                gateway_id = %subscription.gateway_id,
                "Adopting subscription row written concurrently"
            );
            subscription.adopt_row(&existing);
            save_after_remote(store, subscription).await
        }
        _ => Err(inconsistent(subscription, err)),
    }
}

async fn find_by_gateway_id_after_remote<S: SubscriptionStore + ?Sized>(
    store: &S,
    subscription: &Subscription,
) -> Result<Option<Subscription>> {
    store
        .find_subscription_by_gateway_id(&subscription.gateway_id)
        .await
        .map_err(|err| inconsistent(subscription, err))
}

fn inconsistent(subscription: &Subscription, err: CashierError) -> CashierError {
    tracing::error!(
        target: "cashier::store",
        subscription_id = %subscription.id,
        gateway_id = %subscription.gateway_id,
        error = %err,
        "Gateway accepted the change but the local record was not saved"
    );
    CashierError::Inconsistent {
        gateway_id: subscription.gateway_id.clone(),
        message: err.to_string(),
    }
}

/// In-memory subscription store for testing.
#[cfg(any(test, feature = "test-cashier"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, RwLock};

    /// In-memory subscription store for testing.
    ///
    /// Wraps data in Arc for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemorySubscriptionStore {
        inner: Arc<InMemorySubscriptionStoreInner>,
    }

    #[derive(Default)]
    struct InMemorySubscriptionStoreInner {
        customers: RwLock<HashMap<String, CustomerRecord>>,
        subscriptions: RwLock<HashMap<Uuid, Subscription>>,
        processed_events: RwLock<HashMap<String, u64>>,
        fail_next_save: AtomicBool,
    }

    #[derive(Clone)]
    struct CustomerRecord {
        owner_type: String,
        customer_id: String,
    }

    impl InMemorySubscriptionStore {
        /// Create a new in-memory store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `save_subscription` fail with a database error.
        pub fn fail_next_save(&self) {
            self.inner.fail_next_save.store(true, Ordering::SeqCst);
        }

        /// Get all subscriptions (for testing).
        pub fn all_subscriptions(&self) -> Vec<Subscription> {
            self.inner
                .subscriptions
                .read()
                .unwrap()
                .values()
                .cloned()
                .collect()
        }

        /// Get all processed events (for testing).
        pub fn processed_events(&self) -> Vec<String> {
            self.inner
                .processed_events
                .read()
                .unwrap()
                .keys()
                .cloned()
                .collect()
        }
    }

    fn unix_now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    #[async_trait]
    impl SubscriptionStore for InMemorySubscriptionStore {
        async fn get_customer_id(&self, owner_id: &str) -> Result<Option<String>> {
            Ok(self
                .inner
                .customers
                .read()
                .unwrap()
                .get(owner_id)
                .map(|r| r.customer_id.clone()))
        }

        async fn set_customer_id(
            &self,
            owner_id: &str,
            owner_type: &str,
            customer_id: &str,
        ) -> Result<()> {
            self.inner.customers.write().unwrap().insert(
                owner_id.to_string(),
                CustomerRecord {
                    owner_type: owner_type.to_string(),
                    customer_id: customer_id.to_string(),
                },
            );
            Ok(())
        }

        async fn clear_customer_id(&self, owner_id: &str) -> Result<()> {
            self.inner.customers.write().unwrap().remove(owner_id);
            Ok(())
        }

        async fn find_owner_by_customer_id(&self, customer_id: &str) -> Result<Option<OwnerRef>> {
            Ok(self
                .inner
                .customers
                .read()
                .unwrap()
                .iter()
                .find(|(_, record)| record.customer_id == customer_id)
                .map(|(owner_id, record)| OwnerRef {
                    owner_id: owner_id.clone(),
                    owner_type: record.owner_type.clone(),
                }))
        }

        async fn find_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
            Ok(self.inner.subscriptions.read().unwrap().get(&id).cloned())
        }

        async fn find_subscription_by_name(
            &self,
            owner_id: &str,
            name: &str,
        ) -> Result<Option<Subscription>> {
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .values()
                .filter(|s| s.owner_id == owner_id && s.name == name)
                .max_by_key(|s| s.created_at)
                .cloned())
        }

        async fn find_subscription_by_gateway_id(
            &self,
            gateway_id: &str,
        ) -> Result<Option<Subscription>> {
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .values()
                .find(|s| s.gateway_id == gateway_id)
                .cloned())
        }

        async fn list_subscriptions(&self, owner_id: &str) -> Result<Vec<Subscription>> {
            let mut subs: Vec<_> = self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .values()
                .filter(|s| s.owner_id == owner_id)
                .cloned()
                .collect();
            subs.sort_by_key(|s| s.created_at);
            Ok(subs)
        }

        async fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
            if self.inner.fail_next_save.swap(false, Ordering::SeqCst) {
                return Err(CashierError::database("simulated write failure"));
            }

            let mut subs = self.inner.subscriptions.write().unwrap();
            let conflict = subs
                .values()
                .any(|s| s.id != subscription.id && s.gateway_id == subscription.gateway_id);
            if conflict {
                return Err(CashierError::database(format!(
                    "Subscription '{}' is already stored",
                    subscription.gateway_id
                )));
            }

            subs.insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn delete_subscription(&self, id: Uuid) -> Result<()> {
            self.inner.subscriptions.write().unwrap().remove(&id);
            Ok(())
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self
                .inner
                .processed_events
                .read()
                .unwrap()
                .contains_key(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
            self.inner
                .processed_events
                .write()
                .unwrap()
                .insert(event_id.to_string(), unix_now());
            Ok(())
        }

        async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
            let cutoff = unix_now().saturating_sub(older_than_days as u64 * 86400);
            let mut events = self.inner.processed_events.write().unwrap();
            let initial_len = events.len();
            events.retain(|_, &mut timestamp| timestamp >= cutoff);
            Ok(initial_len - events.len())
        }
    }
}
