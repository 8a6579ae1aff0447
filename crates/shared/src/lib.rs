#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NNAudio Shared Types
//!
//! Types and helpers used by both the API server and the billing crate:
//! the subscription plan enum, profile/product row models, cart item shape,
//! and database pool construction.

pub mod models;
pub mod plan;
pub mod pool;

pub use models::{CartItem, DownloadEntry, ProductRow, Profile};
pub use plan::SubscriptionPlan;
pub use pool::create_pool;
