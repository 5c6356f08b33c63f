//! Core data models for distillery.
//!
//! - `function`: function identity, model assignment, persisted training state
//! - `example`: dataset records and size bookkeeping
//! - `config`: runtime configuration
//! - `error`: error taxonomy

mod config;
mod error;
mod example;
mod function;

pub use config::*;
pub use error::*;
pub use example::*;
pub use function::*;
