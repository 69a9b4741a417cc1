use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline::{Position, StageRelationship};

/// A feature flag.
///
/// A feature is identified by its `key` within a team and carries one stage per
/// environment it is rolled out to. The flag value is boolean: the `on` variant
/// resolves to `true`, the `off` variant to `false`.
///
/// # Gating
/// A feature serves `on` in an environment only when it is enabled, its stage
/// for that environment is [`DeploymentStatus::Deployed`], every dependency
/// resolves `on`, and (for contextual stages) the caller passes the rollout
/// criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: Uuid,
    pub team_id: Uuid,
    pub key: String,
    pub description: Option<String>,
    pub feature_type: FeatureType,
    pub enabled: bool,
    /// Keys of features (same team) that must resolve `on` first.
    pub dependencies: Vec<String>,
    pub stages: Vec<Stage>,
    pub relationships: Vec<StageRelationship>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// - `Simple`: a single on/off value, no targeting
/// - `Contextual`: value depends on the stage's rollout criteria
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    Simple,
    Contextual,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "SIMPLE",
            Self::Contextual => "CONTEXTUAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SIMPLE" => Some(Self::Simple),
            "CONTEXTUAL" => Some(Self::Contextual),
            _ => None,
        }
    }
}

/// Where a stage sits in the promotion workflow.
///
/// Only `Deployed` stages are served; the other states resolve as disabled.
/// Transitions are driven by the approval workflow, which lives outside this
/// server and reports its outcome through the stage status endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    DeploymentRequested,
    Deployed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::DeploymentRequested => "DEPLOYMENT_REQUESTED",
            Self::Deployed => "DEPLOYED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "DEPLOYMENT_REQUESTED" => Some(Self::DeploymentRequested),
            "DEPLOYED" => Some(Self::Deployed),
            _ => None,
        }
    }
}

/// A feature's configuration for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub environment_id: Uuid,
    pub order_index: u32,
    pub position: Option<Position>,
    pub status: DeploymentStatus,
    /// Contexts associated with the stage.
    pub context_ids: Vec<Uuid>,
    /// Rollout criteria in creation order.
    pub criteria: Vec<Criterion>,
    pub updated_at: DateTime<Utc>,
}

/// A rollout gate: callers carrying `context_key` are admitted when their
/// bucket falls below `rollout_percentage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub id: Uuid,
    pub context_id: Option<Uuid>,
    pub context_key: String,
    pub rollout_percentage: u8,
}

/// Input for creating a feature.
///
/// Stages come either from `pipeline_id` (stages and relationships copied from
/// the pipeline, all `Pending`) or from the explicit `stages` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFeatureInput {
    pub key: String,
    pub description: Option<String>,
    pub feature_type: FeatureType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub pipeline_id: Option<Uuid>,
    #[serde(default)]
    pub stages: Vec<CreateStageInput>,
    #[serde(default)]
    pub relationships: Vec<StageRelationship>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStageInput {
    pub environment_id: Uuid,
    pub order_index: u32,
    #[serde(default)]
    pub position: Option<Position>,
    /// Defaults to `Pending`.
    #[serde(default)]
    pub status: Option<DeploymentStatus>,
}

/// Input for updating a feature. All fields are optional for partial updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFeatureInput {
    pub description: Option<String>,
    pub enabled: Option<bool>,
    /// Replaces the dependency list when present.
    pub dependencies: Option<Vec<String>>,
}

/// Input for one criterion of [`SetStageCriteriaInput`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCriterionInput {
    pub context_key: String,
    #[serde(default)]
    pub context_id: Option<Uuid>,
    pub rollout_percentage: u8,
}

/// Replaces a stage's criteria. List order becomes evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStageCriteriaInput {
    pub criteria: Vec<CreateCriterionInput>,
}

/// Replaces a stage's associated contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStageContextsInput {
    pub context_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStageStatusInput {
    pub status: DeploymentStatus,
}

/// Lightweight feature view for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub id: Uuid,
    pub key: String,
    pub feature_type: FeatureType,
    pub enabled: bool,
    pub stage_count: usize,
}

impl From<Feature> for FeatureSummary {
    fn from(f: Feature) -> Self {
        Self {
            id: f.id,
            key: f.key,
            feature_type: f.feature_type,
            enabled: f.enabled,
            stage_count: f.stages.len(),
        }
    }
}

fn default_true() -> bool {
    true
}
