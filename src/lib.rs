pub mod catalog;
pub mod codec;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod envelope;
pub mod liveness;
pub mod models;
pub mod reconciler;
pub mod store;
pub mod strategy;
pub mod worker_runtime;
pub mod worker_slot;
