//! The evaluation path: context normalization, bucketing, criteria matching,
//! the assignment cache and the orchestrating [`Evaluator`].

pub mod bucket;
pub mod cache;
pub mod context;
pub mod engine;
pub mod matcher;
mod resolution;

pub use cache::{AssignmentCache, CacheStats};
pub use context::{normalize, AttributeValue, EvaluationContext};
pub use engine::{Evaluation, Evaluator};
pub use resolution::{Reason, Resolution, Variant};
