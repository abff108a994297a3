//! Library entrypoint: re‑export modules

pub mod config;
pub mod dolt;
pub mod errors;
pub mod importer;
pub mod loader;
pub mod metrics;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod table;
pub mod workflow;
