//! HTTP 402 settlement server for live stages.
//!
//! Paywalled actions (effects, questions, donations, memberships) are priced
//! from a catalog, settled through an external oracle exactly once per payment
//! proof, and announced to connected viewers over server-sent events.

pub mod broker;
pub mod catalog;
pub mod config;
pub mod context;
pub mod cors;
pub mod db;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod routes;
pub mod state;
pub mod store;

pub use broker::EventBroker;
pub use config::ServerConfig;
pub use db::Database;
pub use error::{PaymentError, SeedError, StoreError};
pub use orchestrator::SettlementOrchestrator;
pub use state::AppState;
pub use store::PaymentStore;
