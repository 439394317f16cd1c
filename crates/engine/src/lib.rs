//! Engine facade tying storage, lifecycle, assignment and analysis together.

pub mod service;

pub use service::ExperimentService;
