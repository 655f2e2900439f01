// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ChoreQuest Shared
//!
//! Building blocks used by both the API server and the background worker:
//! the in-memory sliding-window rate limiter and Postgres pool setup.

pub mod db;
pub mod rate_limit;

pub use db::{create_pool, run_migrations};
pub use rate_limit::{RateLimited, RateLimiter};
