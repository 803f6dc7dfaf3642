//! Database module for sitewatch.
//!
//! Provides SQLite storage for targets, metric samples, alarm states and
//! alarm history.

mod models;
mod store;

pub use models::*;
pub use store::*;
