//! Core types, errors, configuration and storage boundary for the
//! experiment assignment and inference engine.

pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use error::{ExperimentError, ExperimentResult, ValidationError, ValidationIssue};
pub use store::{ExperimentStore, InMemoryStore};
