//! Database module for pingwatch.
//!
//! Provides SQLite storage with embedded migrations, and the gateway
//! contract the ping cycle commits through.

mod gateway;
mod models;
mod store;

pub use gateway::*;
pub use models::*;
pub use store::*;
