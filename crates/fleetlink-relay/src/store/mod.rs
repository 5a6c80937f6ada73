//! SQLite storage for the Fleetlink relay.
//!
//! Provides persistence for devices, sessions, and session recordings,
//! with per-tenant namespace separation.

mod db;
mod models;
mod queries;

#[cfg(test)]
mod tests;

pub use db::{default_db_name, RelayStore, StoreError, TenantDbName};
pub use models::*;
