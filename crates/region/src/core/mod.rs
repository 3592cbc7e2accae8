//! Core types and configuration for nebula-region

pub mod config;
pub mod types;

pub use config::{AllocatorConfig, PoolConfig, PoolMode, SystemConfig};
pub use types::{alignment, boundary};
