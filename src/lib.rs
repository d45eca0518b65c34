pub mod changelog;
pub mod cli;
pub mod comparator;
pub mod config;
pub mod error;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod remote;
pub mod resolver;
pub mod rules;
pub mod store;
pub mod transfer;

pub use error::ReconcileError;
pub use model::{Account, Category, Field, Transaction};
pub use orchestrator::Orchestrator;
