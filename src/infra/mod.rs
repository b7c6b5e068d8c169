//! Infrastructure - configuration, metrics, and persistence
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `store` - Document store contract and in-memory implementation

pub mod config;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use metrics::Metrics;
pub use store::{DocumentStore, Filter, MemoryStore, StoreError};
