pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hashing;
pub mod health;
pub mod inference;
pub mod merkle;
pub mod metrics;
pub mod prometheus_metrics;
pub mod queue;
pub mod receipt;
pub mod report;
pub mod sampler;
pub mod server;
pub mod signing;
pub mod slots;
pub mod store;
pub mod types;
