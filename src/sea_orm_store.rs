//! SeaORM-backed subscription storage.
//!
//! Tables (the application owns the migrations):
//!
//! - `cashier_customers`: owner → gateway customer link, `customer_id` unique
//! - `cashier_subscriptions`: one row per subscription, unique `gateway_id`,
//!   indexed by `(owner_id, name)`
//! - `cashier_subscription_items`: items keyed by `subscription_id`
//! - `cashier_webhook_events`: processed webhook event ids
//!
//! # Example
//!
//! ```rust,ignore
//! use cashier::SeaOrmSubscriptionStore;
//!
//! let store = SeaOrmSubscriptionStore::new(db.clone());
//! let manager = SubscriptionManager::new(store, gateway);
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    entity::prelude::*, sea_query::OnConflict, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Select, Set, TransactionTrait,
};

use crate::error::{CashierError, Result};
use crate::storage::{OwnerRef, SubscriptionStore};
use crate::subscription::{Subscription, SubscriptionItem, SubscriptionStatus};

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    use sea_orm::entity::prelude::*;

    // -------------------------------------------------------------------------
    // Customer link
    // -------------------------------------------------------------------------
    pub mod cashier_customer {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "cashier_customers")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub owner_id: String,
            pub owner_type: String,
            #[sea_orm(unique)]
            pub customer_id: String,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Subscription
    // -------------------------------------------------------------------------
    pub mod cashier_subscription {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "cashier_subscriptions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            pub owner_id: String,
            pub owner_type: String,
            pub name: String,
            #[sea_orm(unique)]
            pub gateway_id: String,
            pub status: String,
            pub gateway_price: Option<String>,
            pub quantity: Option<i64>,
            pub trial_ends_at: Option<DateTimeWithTimeZone>,
            pub ends_at: Option<DateTimeWithTimeZone>,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Subscription item
    // -------------------------------------------------------------------------
    pub mod cashier_subscription_item {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "cashier_subscription_items")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: Uuid,
            pub subscription_id: Uuid,
            #[sea_orm(unique)]
            pub gateway_id: String,
            pub gateway_price: String,
            pub quantity: Option<i64>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Processed webhook event
    // -------------------------------------------------------------------------
    pub mod cashier_webhook_event {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "cashier_webhook_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub event_id: String,
            pub processed_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{cashier_customer, cashier_subscription, cashier_subscription_item, cashier_webhook_event};

// =============================================================================
// Helper Functions
// =============================================================================

/// Convert i64 to u64 safely (negative values become 0).
#[inline]
fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Convert u64 to i64 safely (values > i64::MAX become i64::MAX).
#[inline]
fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[inline]
fn u64_to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn db_err(err: DbErr) -> CashierError {
    CashierError::Database(err.to_string())
}

fn to_utc(value: DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

fn model_to_item(model: cashier_subscription_item::Model) -> SubscriptionItem {
    SubscriptionItem {
        id: model.id,
        subscription_id: model.subscription_id,
        gateway_id: model.gateway_id,
        gateway_price: model.gateway_price,
        quantity: model.quantity.map(i64_to_u64),
    }
}

fn item_to_active_model(item: &SubscriptionItem) -> cashier_subscription_item::ActiveModel {
    cashier_subscription_item::ActiveModel {
        id: Set(item.id),
        subscription_id: Set(item.subscription_id),
        gateway_id: Set(item.gateway_id.clone()),
        gateway_price: Set(item.gateway_price.clone()),
        quantity: Set(item.quantity.map(u64_to_i64)),
    }
}

/// Convert a subscription row and its item rows to a [`Subscription`].
fn model_to_subscription(
    model: cashier_subscription::Model,
    items: Vec<cashier_subscription_item::Model>,
) -> Subscription {
    Subscription {
        id: model.id,
        owner_id: model.owner_id,
        owner_type: model.owner_type,
        name: model.name,
        gateway_id: model.gateway_id,
        status: SubscriptionStatus::from_gateway(&model.status),
        gateway_price: model.gateway_price,
        quantity: model.quantity.map(i64_to_u64),
        trial_ends_at: model.trial_ends_at.map(to_utc),
        ends_at: model.ends_at.map(to_utc),
        items: items.into_iter().map(model_to_item).collect(),
        created_at: to_utc(model.created_at),
        updated_at: to_utc(model.updated_at),
    }
}

fn subscription_to_active_model(subscription: &Subscription) -> cashier_subscription::ActiveModel {
    cashier_subscription::ActiveModel {
        id: Set(subscription.id),
        owner_id: Set(subscription.owner_id.clone()),
        owner_type: Set(subscription.owner_type.clone()),
        name: Set(subscription.name.clone()),
        gateway_id: Set(subscription.gateway_id.clone()),
        status: Set(subscription.status.as_str().to_string()),
        gateway_price: Set(subscription.gateway_price.clone()),
        quantity: Set(subscription.quantity.map(u64_to_i64)),
        trial_ends_at: Set(subscription.trial_ends_at.map(|at| at.fixed_offset())),
        ends_at: Set(subscription.ends_at.map(|at| at.fixed_offset())),
        created_at: Set(subscription.created_at.fixed_offset()),
        updated_at: Set(subscription.updated_at.fixed_offset()),
    }
}

// =============================================================================
// SeaOrmSubscriptionStore
// =============================================================================

/// SeaORM-backed store implementing [`SubscriptionStore`].
///
/// A subscription row and its items are written in one transaction.
#[derive(Clone, Debug)]
pub struct SeaOrmSubscriptionStore {
    db: DatabaseConnection,
}

impl SeaOrmSubscriptionStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Attach item rows to subscription rows, preserving row order.
    async fn hydrate(&self, rows: Vec<cashier_subscription::Model>) -> Result<Vec<Subscription>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut items: HashMap<Uuid, Vec<cashier_subscription_item::Model>> = HashMap::new();
        for item in cashier_subscription_item::Entity::find()
            .filter(cashier_subscription_item::Column::SubscriptionId.is_in(ids))
            .order_by_asc(cashier_subscription_item::Column::GatewayId)
            .all(&self.db)
            .await
            .map_err(db_err)?
        {
            items.entry(item.subscription_id).or_default().push(item);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let row_items = items.remove(&row.id).unwrap_or_default();
                model_to_subscription(row, row_items)
            })
            .collect())
    }

    async fn find_one(
        &self,
        query: Select<cashier_subscription::Entity>,
    ) -> Result<Option<Subscription>> {
        let Some(row) = query.one(&self.db).await.map_err(db_err)? else {
            return Ok(None);
        };
        Ok(self.hydrate(vec![row]).await?.pop())
    }

    /// Delete old processed events in batches to avoid locking the table.
    ///
    /// `None` deletes everything older than the cutoff in one statement.
    pub async fn cleanup_old_events_batched(
        &self,
        older_than_days: u32,
        batch_size: Option<u32>,
    ) -> Result<usize> {
        tracing::debug!(
            target: "cashier::store",
            older_than_days = older_than_days,
            batch_size = ?batch_size,
            "cleaning up old webhook events"
        );

        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(older_than_days))).fixed_offset();

        let batch_size = match batch_size {
            Some(0) => return Ok(0),
            Some(size) => size,
            None => {
                let result = cashier_webhook_event::Entity::delete_many()
                    .filter(cashier_webhook_event::Column::ProcessedAt.lt(cutoff))
                    .exec(&self.db)
                    .await
                    .map_err(db_err)?;
                let deleted = u64_to_usize(result.rows_affected);
                tracing::info!(target: "cashier::store", deleted = deleted, "cleaned up old webhook events");
                return Ok(deleted);
            }
        };

        let mut total_deleted: usize = 0;
        loop {
            let batch: Vec<String> = cashier_webhook_event::Entity::find()
                .filter(cashier_webhook_event::Column::ProcessedAt.lt(cutoff))
                .limit(u64::from(batch_size))
                .all(&self.db)
                .await
                .map_err(db_err)?
                .into_iter()
                .map(|event| event.event_id)
                .collect();

            if batch.is_empty() {
                break;
            }

            let batch_count = batch.len();
            cashier_webhook_event::Entity::delete_many()
                .filter(cashier_webhook_event::Column::EventId.is_in(batch))
                .exec(&self.db)
                .await
                .map_err(db_err)?;
            total_deleted = total_deleted.saturating_add(batch_count);

            if batch_count < batch_size as usize {
                break;
            }
        }

        tracing::info!(target: "cashier::store", deleted = total_deleted, "cleaned up old webhook events");
        Ok(total_deleted)
    }
}

#[async_trait]
impl SubscriptionStore for SeaOrmSubscriptionStore {
    // -------------------------------------------------------------------------
    // Customer links
    // -------------------------------------------------------------------------

    async fn get_customer_id(&self, owner_id: &str) -> Result<Option<String>> {
        let customer = cashier_customer::Entity::find_by_id(owner_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(customer.map(|c| c.customer_id))
    }

    async fn set_customer_id(
        &self,
        owner_id: &str,
        owner_type: &str,
        customer_id: &str,
    ) -> Result<()> {
        tracing::debug!(
            target: "cashier::store",
            owner_id = %owner_id,
            customer_id = %customer_id,
            "linking gateway customer"
        );

        let now = Utc::now().fixed_offset();
        let customer = cashier_customer::ActiveModel {
            owner_id: Set(owner_id.to_string()),
            owner_type: Set(owner_type.to_string()),
            customer_id: Set(customer_id.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        cashier_customer::Entity::insert(customer)
            .on_conflict(
                OnConflict::column(cashier_customer::Column::OwnerId)
                    .update_columns([
                        cashier_customer::Column::OwnerType,
                        cashier_customer::Column::CustomerId,
                        cashier_customer::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn clear_customer_id(&self, owner_id: &str) -> Result<()> {
        cashier_customer::Entity::delete_by_id(owner_id)
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn find_owner_by_customer_id(&self, customer_id: &str) -> Result<Option<OwnerRef>> {
        let customer = cashier_customer::Entity::find()
            .filter(cashier_customer::Column::CustomerId.eq(customer_id))
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(customer.map(|c| OwnerRef {
            owner_id: c.owner_id,
            owner_type: c.owner_type,
        }))
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    async fn find_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        self.find_one(cashier_subscription::Entity::find_by_id(id)).await
    }

    async fn find_subscription_by_name(
        &self,
        owner_id: &str,
        name: &str,
    ) -> Result<Option<Subscription>> {
        self.find_one(
            cashier_subscription::Entity::find()
                .filter(cashier_subscription::Column::OwnerId.eq(owner_id))
                .filter(cashier_subscription::Column::Name.eq(name))
                .order_by_desc(cashier_subscription::Column::CreatedAt),
        )
        .await
    }

    async fn find_subscription_by_gateway_id(
        &self,
        gateway_id: &str,
    ) -> Result<Option<Subscription>> {
        self.find_one(
            cashier_subscription::Entity::find()
                .filter(cashier_subscription::Column::GatewayId.eq(gateway_id)),
        )
        .await
    }

    async fn list_subscriptions(&self, owner_id: &str) -> Result<Vec<Subscription>> {
        let rows = cashier_subscription::Entity::find()
            .filter(cashier_subscription::Column::OwnerId.eq(owner_id))
            .order_by_asc(cashier_subscription::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_err)?;
        self.hydrate(rows).await
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        tracing::debug!(
            target: "cashier::store",
            subscription_id = %subscription.id,
            gateway_id = %subscription.gateway_id,
            status = %subscription.status,
            items = subscription.items.len(),
            "saving subscription"
        );

        let txn = self.db.begin().await.map_err(db_err)?;

        cashier_subscription::Entity::insert(subscription_to_active_model(subscription))
            .on_conflict(
                OnConflict::column(cashier_subscription::Column::Id)
                    .update_columns([
                        cashier_subscription::Column::OwnerId,
                        cashier_subscription::Column::OwnerType,
                        cashier_subscription::Column::Name,
                        cashier_subscription::Column::GatewayId,
                        cashier_subscription::Column::Status,
                        cashier_subscription::Column::GatewayPrice,
                        cashier_subscription::Column::Quantity,
                        cashier_subscription::Column::TrialEndsAt,
                        cashier_subscription::Column::EndsAt,
                        cashier_subscription::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&txn)
            .await
            .map_err(db_err)?;

        // The item list is replaced wholesale.
        cashier_subscription_item::Entity::delete_many()
            .filter(cashier_subscription_item::Column::SubscriptionId.eq(subscription.id))
            .exec(&txn)
            .await
            .map_err(db_err)?;

        if !subscription.items.is_empty() {
            cashier_subscription_item::Entity::insert_many(
                subscription.items.iter().map(item_to_active_model),
            )
            .exec(&txn)
            .await
            .map_err(db_err)?;
        }

        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<()> {
        tracing::debug!(target: "cashier::store", subscription_id = %id, "deleting subscription");

        let txn = self.db.begin().await.map_err(db_err)?;
        cashier_subscription_item::Entity::delete_many()
            .filter(cashier_subscription_item::Column::SubscriptionId.eq(id))
            .exec(&txn)
            .await
            .map_err(db_err)?;
        cashier_subscription::Entity::delete_by_id(id)
            .exec(&txn)
            .await
            .map_err(db_err)?;
        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Webhook idempotency
    // -------------------------------------------------------------------------

    async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
        let event = cashier_webhook_event::Entity::find_by_id(event_id)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(event.is_some())
    }

    async fn mark_event_processed(&self, event_id: &str) -> Result<()> {
        let event = cashier_webhook_event::ActiveModel {
            event_id: Set(event_id.to_string()),
            processed_at: Set(Utc::now().fixed_offset()),
        };

        cashier_webhook_event::Entity::insert(event)
            .on_conflict(
                OnConflict::column(cashier_webhook_event::Column::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
        self.cleanup_old_events_batched(older_than_days, None).await
    }
}

// =============================================================================
// Tests
// =============================================================================
