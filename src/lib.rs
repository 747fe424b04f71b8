//! High-availability layer for MySQL backends
//!
//! Pooled connections, periodic health checking and staged primary
//! failover, driven through [`service::HaService`].

pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
pub mod failover;
pub mod health;
pub mod instance;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod service;

pub use error::HaError;
pub use service::HaService;
