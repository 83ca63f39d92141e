//! orchestrad - the Orchestra kernel
//!
//! Service registry, health sweeps, navigation aggregation, admin config,
//! audit trail and backup coordination over one SQLite database.

pub mod audit;
pub mod backup;
pub mod config;
pub mod config_store;
pub mod db;
pub mod downstream;
pub mod health;
pub mod kernel;
pub mod metrics;
pub mod nav;
pub mod registry;
pub mod routes;
pub mod server;

pub use config::KernelConfig;
pub use kernel::Kernel;
pub use server::AppState;
