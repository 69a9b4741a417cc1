//! End-to-end flag resolution.

use std::sync::Arc;

use uuid::Uuid;

use super::bucket::{bucket_of, BucketSalt};
use super::cache::{AssignmentCache, CacheEntry, CacheKey};
use super::context::EvaluationContext;
use super::matcher::{self, Applicability};
use super::resolution::Resolution;
use crate::error::EvalError;
use crate::models::FeatureType;
use crate::snapshot::{ConfigStore, EnvironmentConfig, FeatureConfig, Snapshot};

/// A resolution together with the snapshot version it was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub resolution: Resolution,
    pub version: u64,
}

/// Resolves flags against the published configuration.
///
/// Shared by every request handler. Resolution only touches in-memory state:
/// the snapshot `Arc` and the assignment cache.
pub struct Evaluator {
    store: Arc<ConfigStore>,
    cache: AssignmentCache,
}

impl Evaluator {
    pub fn new(store: Arc<ConfigStore>, cache: AssignmentCache) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn cache(&self) -> &AssignmentCache {
        &self.cache
    }

    /// The snapshot to evaluate against.
    pub fn snapshot(&self) -> Result<Arc<Snapshot>, EvalError> {
        self.store.current().ok_or(EvalError::ProviderNotReady)
    }

    /// Resolve `flag_key` for `environment_id` against the current snapshot.
    pub fn resolve(
        &self,
        flag_key: &str,
        environment_id: Uuid,
        context: &EvaluationContext,
    ) -> Result<Evaluation, EvalError> {
        let snapshot = self.snapshot()?;
        self.resolve_in(&snapshot, flag_key, environment_id, context)
    }

    /// Resolve against a snapshot the caller already holds.
    pub fn resolve_in(
        &self,
        snapshot: &Snapshot,
        flag_key: &str,
        environment_id: Uuid,
        context: &EvaluationContext,
    ) -> Result<Evaluation, EvalError> {
        let env = active_environment(snapshot, environment_id)?;
        let feature = snapshot.feature(env.team_id, flag_key).ok_or_else(|| {
            EvalError::FlagNotFound(format!("flag '{flag_key}' not found"))
        })?;

        let resolution = self.resolve_feature(snapshot, env, feature, context)?;
        tracing::debug!(
            flag = flag_key,
            environment = %env.name,
            targeting_key = context.targeting_key(),
            variant = resolution.variant.as_str(),
            reason = ?resolution.reason,
            "resolved flag"
        );
        Ok(Evaluation {
            resolution,
            version: snapshot.version(),
        })
    }

    /// Resolve every flag of the environment's team, sorted by key.
    pub fn resolve_all(
        &self,
        snapshot: &Snapshot,
        environment_id: Uuid,
        context: &EvaluationContext,
    ) -> Result<Vec<(String, Result<Resolution, EvalError>)>, EvalError> {
        let env = active_environment(snapshot, environment_id)?;
        Ok(snapshot
            .team_features(env.team_id)
            .into_iter()
            .map(|feature| {
                (
                    feature.key.clone(),
                    self.resolve_feature(snapshot, env, feature, context),
                )
            })
            .collect())
    }

    fn resolve_feature(
        &self,
        snapshot: &Snapshot,
        env: &EnvironmentConfig,
        feature: &FeatureConfig,
        context: &EvaluationContext,
    ) -> Result<Resolution, EvalError> {
        if !feature.enabled {
            return Ok(Resolution::disabled());
        }

        let stage = feature.stage(env.id).ok_or_else(|| {
            EvalError::FlagNotFound(format!(
                "flag '{}' has no stage for environment '{}'",
                feature.key, env.name
            ))
        })?;
        if !stage.is_deployed() {
            return Ok(Resolution::disabled());
        }

        for dependency in &feature.dependencies {
            let Some(dep) = snapshot.feature(feature.team_id, dependency) else {
                return Err(EvalError::General(format!(
                    "flag '{}' depends on missing flag '{dependency}'",
                    feature.key
                )));
            };
            match self.resolve_feature(snapshot, env, dep, context) {
                Ok(r) if r.value() => {}
                Ok(_) | Err(EvalError::FlagNotFound(_)) => return Ok(Resolution::disabled()),
                Err(e) => return Err(e),
            }
        }

        // Simple features carry no targeting; criteria on their stages are inert.
        let applicability = match feature.feature_type {
            FeatureType::Simple => Applicability::Unconditional,
            FeatureType::Contextual => matcher::applicability(stage, context),
        };
        if applicability == Applicability::Unconditional {
            return Ok(matcher::decide(stage, applicability, feature.enabled, || 0).resolution());
        }

        let key = CacheKey {
            flag_key: feature.key.clone(),
            environment_id: env.id,
            targeting_key: context.targeting_key().to_string(),
            applicability,
        };
        let version = snapshot.version();
        if let Some(hit) = self.cache.get(&key, version) {
            return Ok(hit);
        }

        let resolution = matcher::decide(stage, applicability, feature.enabled, || {
            bucket_of(
                context.targeting_key(),
                &BucketSalt::new(&feature.key, env.id),
            )
        })
        .resolution();

        self.cache.put(key, CacheEntry { resolution, version });
        Ok(resolution)
    }
}

fn active_environment(
    snapshot: &Snapshot,
    environment_id: Uuid,
) -> Result<&EnvironmentConfig, EvalError> {
    snapshot
        .environment(environment_id)
        .filter(|e| e.active)
        .ok_or_else(|| EvalError::FlagNotFound(format!("environment '{environment_id}' not found")))
}
