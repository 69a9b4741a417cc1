use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A promotion template: an ordered set of environments linked into a DAG.
///
/// Features created from a pipeline copy its stages and relationships.
/// Relationships refer to stages by `order_index`; one source may fan out to
/// several targets (e.g. `SIT -> Prod-US-East` and `SIT -> Prod-EU`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub stages: Vec<PipelineStage>,
    pub relationships: Vec<StageRelationship>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub environment_id: Uuid,
    pub order_index: u32,
    #[serde(default)]
    pub position: Option<Position>,
}

/// Canvas coordinates of a stage. Display only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A promotion edge between two stages, identified by their order index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRelationship {
    pub source_id: u32,
    pub target_id: u32,
}

/// Input for creating a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipelineInput {
    pub name: String,
    pub stages: Vec<PipelineStage>,
    #[serde(default)]
    pub relationships: Vec<StageRelationship>,
}
