//! Cashier - subscription billing reconciliation for Rust services
//!
//! Cashier keeps a local cache of remote gateway subscriptions and keeps it
//! in sync from two directions: your code changing a subscription through a
//! [`SubscriptionManager`], and the gateway reporting changes through signed
//! webhooks handled by a [`WebhookHandler`].
//!
//! # Features
//!
//! - **Subscriptions**: create, swap, quantity, multi-price, trials, cancel and resume
//! - **Payments**: incomplete payment detection with 3D Secure confirmation
//! - **Webhooks**: signature verification, idempotency and local reconciliation
//! - **Storage**: pluggable [`SubscriptionStore`], SeaORM backend behind `seaorm`
//! - **HTTP**: Axum webhook route behind `axum`
//! - **Testing**: in-memory store and mock gateway behind `test-cashier`
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cashier::{ConfigBuilder, CustomerOptions, StripeGateway, SubscriptionManager};
//!
//! cashier::init_tracing();
//!
//! let config = ConfigBuilder::new().from_env().build()?;
//! let gateway = StripeGateway::from_config(&config)?;
//! let manager = SubscriptionManager::from_config(store, gateway, &config);
//!
//! let outcome = manager
//!     .new_subscription(&user, "default")
//!     .price("price_monthly")
//!     .trial_days(14)
//!     .create(Some("pm_card_visa"), CustomerOptions::new())
//!     .await?;
//! ```

#![allow(async_fn_in_trait)] // async_trait macro handles Send/Sync bounds properly

mod builder;
mod config;
mod customer;
mod error;
pub mod gateway;
#[cfg(feature = "axum")]
pub mod http;
mod manager;
mod payment;
#[cfg(feature = "seaorm")]
mod sea_orm_store;
pub mod storage;
pub mod subscription;
mod utils;
pub mod webhook;

// Re-exports for public API
pub use builder::{SubscriptionBuilder, SubscriptionOutcome, META_SUBSCRIPTION_NAME};
pub use config::{ActivePolicy, CashierConfig, ConfigBuilder, GatewayConfig, LoggingConfig, WebhookConfig};
pub use customer::{Billable, CustomerManager, CustomerOptions};
pub use error::{CashierError, GatewayError, GatewayErrorKind, Result, SubscriptionUpdateFailure};
pub use gateway::{
    BillingCycleAnchor, Gateway, PaymentBehavior, ProrationBehavior, StripeGateway, TrialEnd,
};
pub use manager::{SubscriptionEditor, SubscriptionManager};
pub use payment::{Payment, PaymentFailureHandler, PaymentStatus};
#[cfg(feature = "seaorm")]
pub use sea_orm_store::SeaOrmSubscriptionStore;
pub use storage::{OwnerRef, SubscriptionStore};
pub use subscription::{Subscription, SubscriptionItem, SubscriptionStatus, DEFAULT_SUBSCRIPTION_NAME};
pub use webhook::{
    NoopNotifier, PaymentActionNotice, PaymentNotifier, WebhookEvent, WebhookEventType,
    WebhookHandler, WebhookOutcome,
};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// Call this early in `main()` if the host application does not install its
/// own subscriber. Cashier logs under the `cashier::*` targets.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "cashier=debug")
/// - `CASHIER_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("CASHIER_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &CashierConfig) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
