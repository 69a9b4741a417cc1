//! Domain models for the FluxGate configuration graph.
//!
//! # Core Concepts
//!
//! - [`Team`]: namespace for everything below; feature keys are unique per team.
//! - [`Environment`]: a deployment target. Evaluation always happens for one.
//! - [`Client`]: an application calling the evaluation endpoint, optionally
//!   bound to an environment.
//! - [`Context`]: a named targeting attribute with its allowed values.
//! - [`Pipeline`]: a DAG of environments used as a template for feature stages.
//! - [`Feature`]: a flag with one [`Stage`] per environment. Stages carry the
//!   deployment status and the rollout [`Criterion`] list.

mod context;
mod feature;
mod pipeline;
mod team;

pub use context::*;
pub use feature::*;
pub use pipeline::*;
pub use team::*;
