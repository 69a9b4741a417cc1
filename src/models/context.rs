use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named targeting attribute (e.g. `userTier`) with its allowed values.
///
/// Contexts are scoped to a team and shared by every feature of that team.
/// Entries keep the order they were declared in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: Uuid,
    pub team_id: Uuid,
    pub key: String,
    pub entries: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContextInput {
    pub key: String,
    #[serde(default)]
    pub entries: Vec<String>,
}
