//! Experiment definition validation and the lifecycle state machine.

pub mod state_machine;
pub mod validation;

pub use state_machine::ExperimentLifecycle;
pub use validation::{validate_experiment, ValidationReport};
