//! Deterministic user-to-variant assignment: override resolution, audience
//! filtering and hash bucketing.

pub mod audience;
pub mod engine;
pub mod hashing;

pub use audience::{check_audience, Ineligibility};
pub use engine::{assign, assign_sticky, AssignmentOutcome};
pub use hashing::{audience_bucket, traffic_bucket, BUCKET_COUNT};
