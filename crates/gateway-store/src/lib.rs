//! # Gateway Store
//!
//! SQLite persistence for providers, caller keys and auxiliary key pools.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gateway_store::{PoolConfig, SqlStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqlStore::connect("sqlite://aibalance.db", &PoolConfig::default()).await?;
//!     store.close().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod pool;
pub mod schema;
pub mod sql_store;

pub use error::{Result, StoreError};
pub use pool::{PoolConfig, PoolConfigBuilder};
pub use sql_store::SqlStore;

/// Re-export sqlx types for convenience
pub use sqlx;
