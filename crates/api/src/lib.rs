// API crate clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! NNAudio API Library
//!
//! HTTP layer for the NNAudio storefront backend: checkout and webhook
//! routes, customer account endpoints, the desktop installer protocol,
//! and the admin grant surface.

pub mod auth;
pub mod config;
pub mod email;
pub mod entitlements;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
