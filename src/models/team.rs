use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A team owning environments, clients, contexts, pipelines and features.
///
/// Feature keys are unique within a team, so the team is the namespace every
/// evaluation request is resolved in (through the caller's environment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a new team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTeamInput {
    pub name: String,
    pub description: Option<String>,
}

/// A deployment target (e.g. `E-Commerce-Dev`) belonging to one team.
///
/// Each feature has at most one stage per environment. Inactive environments
/// are never served.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEnvironmentInput {
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// The kind of application a client represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientType {
    Web,
    Backend,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "WEB",
            Self::Backend => "BACKEND",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WEB" => Some(Self::Web),
            "BACKEND" => Some(Self::Backend),
            _ => None,
        }
    }
}

/// An application calling the evaluation endpoint.
///
/// The client id doubles as its bearer credential. A client bound to an
/// environment has every evaluation it makes resolved against that
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub client_type: ClientType,
    pub enabled: bool,
    pub environment_id: Option<Uuid>,
    /// Allowed browser origins for `WEB` clients.
    pub web_origins: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for registering a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientInput {
    pub name: String,
    pub description: Option<String>,
    pub client_type: ClientType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub environment_id: Option<Uuid>,
    #[serde(default)]
    pub web_origins: Vec<String>,
}

fn default_true() -> bool {
    true
}
