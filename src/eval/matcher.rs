//! Rollout criteria matching.
//!
//! Criteria are considered in creation order. A criterion applies when the
//! context carries its key; the first applying criterion decides the outcome
//! and later ones are never consulted. A stage with criteria but none that
//! apply falls back to the feature's baseline (`DEFAULT`).

use super::context::EvaluationContext;
use super::resolution::{Reason, Resolution};
use crate::snapshot::{CriterionConfig, StageConfig};

/// Which criterion of a stage applies to a context.
///
/// Determined without bucketing, so it is cheap enough to be part of the
/// assignment cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Applicability {
    /// The stage has no criteria.
    Unconditional,
    /// Index of the first criterion whose key is present.
    Criterion(usize),
    /// The stage has criteria, none of which reference a present key.
    NoneApplies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: bool,
    pub rollout_percentage: u8,
    pub reason: Reason,
}

impl MatchResult {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.matched, self.reason)
    }
}

pub fn applicability(stage: &StageConfig, context: &EvaluationContext) -> Applicability {
    if stage.criteria.is_empty() {
        return Applicability::Unconditional;
    }
    stage
        .criteria
        .iter()
        .position(|c| context.contains(&c.context_key))
        .map(Applicability::Criterion)
        .unwrap_or(Applicability::NoneApplies)
}

/// Decide a stage for a context. `bucket` is called at most once, and only
/// when a criterion applies.
///
/// `baseline` is the feature's own enabled state, served when no criterion
/// applies.
pub fn match_stage<F>(
    stage: &StageConfig,
    context: &EvaluationContext,
    baseline: bool,
    bucket: F,
) -> MatchResult
where
    F: FnOnce() -> u8,
{
    decide(stage, applicability(stage, context), baseline, bucket)
}

/// Same as [`match_stage`] with the applicability already known.
pub fn decide<F>(
    stage: &StageConfig,
    applicability: Applicability,
    baseline: bool,
    bucket: F,
) -> MatchResult
where
    F: FnOnce() -> u8,
{
    match applicability {
        Applicability::Unconditional => MatchResult {
            matched: true,
            rollout_percentage: 100,
            reason: Reason::Static,
        },
        Applicability::NoneApplies => MatchResult {
            matched: baseline,
            rollout_percentage: if baseline { 100 } else { 0 },
            reason: Reason::Default,
        },
        Applicability::Criterion(index) => match stage.criteria.get(index) {
            Some(criterion) => gate(criterion, bucket()),
            None => MatchResult {
                matched: baseline,
                rollout_percentage: 0,
                reason: Reason::Default,
            },
        },
    }
}

fn gate(criterion: &CriterionConfig, bucket: u8) -> MatchResult {
    let percentage = criterion.rollout_percentage;
    MatchResult {
        // Half-open: 0 admits nobody, 100 admits every bucket in [0, 100).
        matched: bucket < percentage,
        rollout_percentage: percentage,
        reason: if percentage >= 100 {
            Reason::TargetingMatch
        } else {
            Reason::Split
        },
    }
}
