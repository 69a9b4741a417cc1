//! Immutable, versioned configuration snapshots.
//!
//! The evaluation path never reads the database. Administrative changes are
//! committed to the store, then a complete [`Snapshot`] is built off to the
//! side from [`ConfigData`] and published through [`ConfigStore`] with a single
//! pointer swap. A reader holding an `Arc<Snapshot>` keeps a consistent view
//! for as long as it needs one.

mod deps;
mod store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::PublishError;
use crate::models::*;

pub use deps::check_dependencies;
pub use store::ConfigStore;

/// Everything a snapshot is built from, read in one pass from the store.
#[derive(Debug, Clone, Default)]
pub struct ConfigData {
    /// Store revision the data was read at.
    pub revision: u64,
    pub teams: Vec<Team>,
    pub environments: Vec<Environment>,
    pub clients: Vec<Client>,
    pub contexts: Vec<Context>,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub environment_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct CriterionConfig {
    pub context_key: String,
    pub rollout_percentage: u8,
}

#[derive(Debug, Clone)]
pub struct StageConfig {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub status: DeploymentStatus,
    /// Creation order.
    pub criteria: Vec<CriterionConfig>,
}

impl StageConfig {
    pub fn is_deployed(&self) -> bool {
        self.status == DeploymentStatus::Deployed
    }
}

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    pub id: Uuid,
    pub team_id: Uuid,
    pub key: String,
    pub feature_type: FeatureType,
    pub enabled: bool,
    pub dependencies: Vec<String>,
    stages: HashMap<Uuid, StageConfig>,
}

impl FeatureConfig {
    /// The stage for `environment_id`, without walking the promotion graph.
    pub fn stage(&self, environment_id: Uuid) -> Option<&StageConfig> {
        self.stages.get(&environment_id)
    }
}

/// Counts reported by `GET /api/v1/config` and `fluxgate check`.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub version: u64,
    pub revision: u64,
    pub published_at: DateTime<Utc>,
    pub teams: usize,
    pub environments: usize,
    pub clients: usize,
    pub contexts: usize,
    pub features: usize,
    pub stages: usize,
}

/// A published configuration view.
#[derive(Debug)]
pub struct Snapshot {
    version: u64,
    revision: u64,
    published_at: DateTime<Utc>,
    team_count: usize,
    context_count: usize,
    environments: HashMap<Uuid, EnvironmentConfig>,
    environments_by_name: HashMap<String, Vec<Uuid>>,
    clients: HashMap<Uuid, ClientConfig>,
    features: HashMap<Uuid, HashMap<String, FeatureConfig>>,
}

impl Snapshot {
    /// Build a snapshot, rejecting configurations with broken dependencies.
    pub fn build(version: u64, data: ConfigData) -> Result<Self, PublishError> {
        let mut by_team: HashMap<Uuid, Vec<&Feature>> = HashMap::new();
        for feature in &data.features {
            by_team.entry(feature.team_id).or_default().push(feature);
        }
        for features in by_team.values() {
            check_dependencies(
                features
                    .iter()
                    .map(|f| (f.key.as_str(), f.dependencies.as_slice())),
            )?;
        }

        let mut environments = HashMap::new();
        let mut environments_by_name: HashMap<String, Vec<Uuid>> = HashMap::new();
        for env in data.environments {
            environments_by_name
                .entry(env.name.clone())
                .or_default()
                .push(env.id);
            environments.insert(
                env.id,
                EnvironmentConfig {
                    id: env.id,
                    team_id: env.team_id,
                    name: env.name,
                    active: env.active,
                },
            );
        }

        let clients = data
            .clients
            .into_iter()
            .map(|c| {
                (
                    c.id,
                    ClientConfig {
                        id: c.id,
                        team_id: c.team_id,
                        name: c.name,
                        enabled: c.enabled,
                        environment_id: c.environment_id,
                    },
                )
            })
            .collect();

        let mut features: HashMap<Uuid, HashMap<String, FeatureConfig>> = HashMap::new();
        for feature in data.features {
            let stages = feature
                .stages
                .into_iter()
                .map(|s| {
                    (
                        s.environment_id,
                        StageConfig {
                            id: s.id,
                            environment_id: s.environment_id,
                            status: s.status,
                            criteria: s
                                .criteria
                                .into_iter()
                                .map(|c| CriterionConfig {
                                    context_key: c.context_key,
                                    rollout_percentage: c.rollout_percentage.min(100),
                                })
                                .collect(),
                        },
                    )
                })
                .collect();

            features.entry(feature.team_id).or_default().insert(
                feature.key.clone(),
                FeatureConfig {
                    id: feature.id,
                    team_id: feature.team_id,
                    key: feature.key,
                    feature_type: feature.feature_type,
                    enabled: feature.enabled,
                    dependencies: feature.dependencies,
                    stages,
                },
            );
        }

        Ok(Self {
            version,
            revision: data.revision,
            published_at: Utc::now(),
            team_count: data.teams.len(),
            context_count: data.contexts.len(),
            environments,
            environments_by_name,
            clients,
            features,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn environment(&self, id: Uuid) -> Option<&EnvironmentConfig> {
        self.environments.get(&id)
    }

    /// Resolve an environment reference: a UUID, or a name that is unique
    /// across teams.
    pub fn environment_by_ref(&self, reference: &str) -> Option<&EnvironmentConfig> {
        if let Ok(id) = Uuid::parse_str(reference) {
            return self.environment(id);
        }
        match self.environments_by_name.get(reference).map(Vec::as_slice) {
            Some([id]) => self.environment(*id),
            Some(ids) if ids.len() > 1 => {
                tracing::warn!(name = %reference, "environment name is ambiguous across teams");
                None
            }
            _ => None,
        }
    }

    pub fn client(&self, id: Uuid) -> Option<&ClientConfig> {
        self.clients.get(&id)
    }

    pub fn feature(&self, team_id: Uuid, key: &str) -> Option<&FeatureConfig> {
        self.features.get(&team_id)?.get(key)
    }

    /// Features of a team, sorted by key.
    pub fn team_features(&self, team_id: Uuid) -> Vec<&FeatureConfig> {
        let mut features: Vec<_> = self
            .features
            .get(&team_id)
            .map(|m| m.values().collect())
            .unwrap_or_default();
        features.sort_by(|a, b| a.key.cmp(&b.key));
        features
    }

    /// The stage of `feature_key` for `environment_id`, in that environment's team.
    pub fn lookup_stage(&self, feature_key: &str, environment_id: Uuid) -> Option<&StageConfig> {
        let env = self.environment(environment_id)?;
        self.feature(env.team_id, feature_key)?.stage(environment_id)
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            version: self.version,
            revision: self.revision,
            published_at: self.published_at,
            teams: self.team_count,
            environments: self.environments.len(),
            clients: self.clients.len(),
            contexts: self.context_count,
            features: self.features.values().map(HashMap::len).sum(),
            stages: self
                .features
                .values()
                .flat_map(HashMap::values)
                .map(|f| f.stages.len())
                .sum(),
        }
    }
}
