//! Library crate for http-scan-jobs exposing reusable modules.
pub mod engine;
pub mod error;
pub mod events;
pub mod message;
pub mod server;
pub mod settings;
pub mod store;
pub mod templates;
pub mod types;
pub mod worker;
