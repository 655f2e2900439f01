// API crate clippy configuration
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
#![allow(clippy::len_without_is_empty)] // In-memory test stores only expose len
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ChoreQuest API Library
//!
//! The trust boundary of the ChoreQuest server: configuration checks,
//! session tokens, the two authentication providers, refresh credentials,
//! rate limiting and the subscription gate, plus the routes that use them.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod security;
pub mod state;
#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
