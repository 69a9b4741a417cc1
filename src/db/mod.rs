mod schema;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::*;
use crate::snapshot::{check_dependencies, ConfigData};

/// Persistent configuration store.
///
/// Every mutation bumps the `config_revision` counter in the same transaction,
/// which is how snapshot refreshes notice changes.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// Which features a read should return.
#[derive(Clone, Copy)]
enum FeatureFilter {
    All,
    Team(Uuid),
    Id(Uuid),
}

impl FeatureFilter {
    fn clause(&self, alias: &str) -> String {
        match self {
            Self::All => "1 = 1".to_string(),
            Self::Team(_) => format!("{alias}.team_id = ?1"),
            Self::Id(_) => format!("{alias}.id = ?1"),
        }
    }

    fn param(&self) -> Option<String> {
        match self {
            Self::All => None,
            Self::Team(id) | Self::Id(id) => Some(id.to_string()),
        }
    }
}

/// A stage layout about to be written: (environment, order index) pairs plus
/// the promotion edges between them.
struct StageLayout<'a> {
    stages: Vec<(Uuid, u32)>,
    relationships: &'a [StageRelationship],
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_default() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "fluxgate")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        let db_path = dirs.data_dir().join("fluxgate.db");
        Self::open(db_path)
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // Configuration revision and snapshot loading
    // ============================================================

    pub fn config_revision(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("database lock poisoned");
        read_revision(&conn)
    }

    /// Read the whole configuration graph at one revision.
    pub fn load_config(&self) -> Result<ConfigData> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.unchecked_transaction()?;

        let revision = read_revision(&tx)?;
        let teams = {
            let mut stmt = tx.prepare(
                "SELECT id, name, description, created_at, updated_at FROM teams ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], row_to_team)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let environments = {
            let mut stmt = tx.prepare(
                "SELECT id, team_id, name, active, created_at FROM environments ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], row_to_environment)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let clients = {
            let mut stmt = tx.prepare(
                "SELECT id, team_id, name, description, client_type, enabled, environment_id, web_origins, created_at
                 FROM clients ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], row_to_client)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let contexts = {
            let mut stmt = tx.prepare(
                "SELECT id, team_id, key, entries, created_at FROM contexts ORDER BY key",
            )?;
            let rows = stmt
                .query_map([], row_to_context)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let features = read_features(&tx, FeatureFilter::All)?;

        tx.commit()?;

        Ok(ConfigData {
            revision,
            teams,
            environments,
            clients,
            contexts,
            features,
        })
    }

    // ============================================================
    // Team operations
    // ============================================================

    pub fn get_all_teams(&self) -> Result<Vec<Team>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, description, created_at, updated_at FROM teams ORDER BY name",
        )?;
        let teams = stmt
            .query_map([], row_to_team)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(teams)
    }

    pub fn get_team(&self, id: Uuid) -> Result<Option<Team>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let team = conn
            .query_row(
                "SELECT id, name, description, created_at, updated_at FROM teams WHERE id = ?",
                [id.to_string()],
                row_to_team,
            )
            .optional()?;
        Ok(team)
    }

    pub fn create_team(&self, input: CreateTeamInput) -> Result<Team> {
        require_non_empty("team name", &input.name)?;

        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO teams (id, name, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &input.name,
                &input.description,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;
        bump_revision(&tx)?;
        tx.commit()?;

        Ok(Team {
            id,
            name: input.name,
            description: input.description,
            created_at: now,
            updated_at: now,
        })
    }

    // ============================================================
    // Environment operations
    // ============================================================

    pub fn get_environments(&self, team_id: Uuid) -> Result<Vec<Environment>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, team_id, name, active, created_at
             FROM environments WHERE team_id = ? ORDER BY name",
        )?;
        let envs = stmt
            .query_map([team_id.to_string()], row_to_environment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(envs)
    }

    pub fn get_environment(&self, id: Uuid) -> Result<Option<Environment>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        read_environment(&conn, id)
    }

    pub fn create_environment(
        &self,
        team_id: Uuid,
        input: CreateEnvironmentInput,
    ) -> Result<Environment> {
        require_non_empty("environment name", &input.name)?;

        let conn = self.conn.lock().expect("database lock poisoned");
        require_team(&conn, team_id)?;

        let id = Uuid::new_v4();
        let now = Utc::now();

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO environments (id, team_id, name, active, created_at)
             VALUES (?, ?, ?, ?, ?)",
            (
                id.to_string(),
                team_id.to_string(),
                &input.name,
                input.active,
                now.to_rfc3339(),
            ),
        )?;
        bump_revision(&tx)?;
        tx.commit()?;

        Ok(Environment {
            id,
            team_id,
            name: input.name,
            active: input.active,
            created_at: now,
        })
    }

    // ============================================================
    // Client operations
    // ============================================================

    pub fn get_clients(&self, team_id: Uuid) -> Result<Vec<Client>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, team_id, name, description, client_type, enabled, environment_id, web_origins, created_at
             FROM clients WHERE team_id = ? ORDER BY name",
        )?;
        let clients = stmt
            .query_map([team_id.to_string()], row_to_client)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(clients)
    }

    pub fn create_client(&self, team_id: Uuid, input: CreateClientInput) -> Result<Client> {
        require_non_empty("client name", &input.name)?;

        let conn = self.conn.lock().expect("database lock poisoned");
        require_team(&conn, team_id)?;
        if let Some(env_id) = input.environment_id {
            require_team_environment(&conn, team_id, env_id)?;
        }

        let id = Uuid::new_v4();
        let now = Utc::now();

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO clients (id, team_id, name, description, client_type, enabled, environment_id, web_origins, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                team_id.to_string(),
                &input.name,
                &input.description,
                input.client_type.as_str(),
                input.enabled,
                input.environment_id.map(|u| u.to_string()),
                serde_json::to_string(&input.web_origins)?,
                now.to_rfc3339(),
            ),
        )?;
        bump_revision(&tx)?;
        tx.commit()?;

        Ok(Client {
            id,
            team_id,
            name: input.name,
            description: input.description,
            client_type: input.client_type,
            enabled: input.enabled,
            environment_id: input.environment_id,
            web_origins: input.web_origins,
            created_at: now,
        })
    }

    // ============================================================
    // Context operations
    // ============================================================

    pub fn get_contexts(&self, team_id: Uuid) -> Result<Vec<Context>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, team_id, key, entries, created_at
             FROM contexts WHERE team_id = ? ORDER BY key",
        )?;
        let contexts = stmt
            .query_map([team_id.to_string()], row_to_context)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(contexts)
    }

    pub fn create_context(&self, team_id: Uuid, input: CreateContextInput) -> Result<Context> {
        require_non_empty("context key", &input.key)?;
        let mut seen = HashSet::new();
        if let Some(dup) = input.entries.iter().find(|e| !seen.insert(e.as_str())) {
            anyhow::bail!("context entries must be unique, '{}' is repeated", dup);
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        require_team(&conn, team_id)?;

        let id = Uuid::new_v4();
        let now = Utc::now();

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO contexts (id, team_id, key, entries, created_at) VALUES (?, ?, ?, ?, ?)",
            (
                id.to_string(),
                team_id.to_string(),
                &input.key,
                serde_json::to_string(&input.entries)?,
                now.to_rfc3339(),
            ),
        )?;
        bump_revision(&tx)?;
        tx.commit()?;

        Ok(Context {
            id,
            team_id,
            key: input.key,
            entries: input.entries,
            created_at: now,
        })
    }

    // ============================================================
    // Pipeline operations
    // ============================================================

    pub fn get_pipelines(&self, team_id: Uuid) -> Result<Vec<Pipeline>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let ids = {
            let mut stmt =
                conn.prepare("SELECT id FROM pipelines WHERE team_id = ? ORDER BY name")?;
            let ids = stmt
                .query_map([team_id.to_string()], |row| {
                    Ok(parse_uuid(row.get::<_, String>(0)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut pipelines = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = read_pipeline(&conn, id)? {
                pipelines.push(p);
            }
        }
        Ok(pipelines)
    }

    pub fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        read_pipeline(&conn, id)
    }

    pub fn create_pipeline(&self, team_id: Uuid, input: CreatePipelineInput) -> Result<Pipeline> {
        require_non_empty("pipeline name", &input.name)?;

        let conn = self.conn.lock().expect("database lock poisoned");
        require_team(&conn, team_id)?;
        validate_layout(
            &conn,
            team_id,
            &StageLayout {
                stages: input
                    .stages
                    .iter()
                    .map(|s| (s.environment_id, s.order_index))
                    .collect(),
                relationships: &input.relationships,
            },
        )?;

        let id = Uuid::new_v4();
        let now = Utc::now();

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO pipelines (id, team_id, name, created_at) VALUES (?, ?, ?, ?)",
            (
                id.to_string(),
                team_id.to_string(),
                &input.name,
                now.to_rfc3339(),
            ),
        )?;
        for stage in &input.stages {
            tx.execute(
                "INSERT INTO pipeline_stages (pipeline_id, environment_id, order_index, position)
                 VALUES (?, ?, ?, ?)",
                (
                    id.to_string(),
                    stage.environment_id.to_string(),
                    stage.order_index,
                    encode_position(stage.position)?,
                ),
            )?;
        }
        for rel in &input.relationships {
            tx.execute(
                "INSERT INTO pipeline_relationships (pipeline_id, source_index, target_index)
                 VALUES (?, ?, ?)",
                (id.to_string(), rel.source_id, rel.target_id),
            )?;
        }
        bump_revision(&tx)?;
        tx.commit()?;

        let mut stages = input.stages;
        stages.sort_by_key(|s| s.order_index);

        Ok(Pipeline {
            id,
            team_id,
            name: input.name,
            stages,
            relationships: input.relationships,
            created_at: now,
        })
    }

    // ============================================================
    // Feature operations
    // ============================================================

    pub fn get_features(&self, team_id: Uuid) -> Result<Vec<Feature>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        read_features(&conn, FeatureFilter::Team(team_id))
    }

    pub fn get_feature(&self, id: Uuid) -> Result<Option<Feature>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        Ok(read_features(&conn, FeatureFilter::Id(id))?.into_iter().next())
    }

    /// Create a feature with its stages.
    ///
    /// With `pipeline_id` set, the pipeline's stages and relationships are
    /// copied and every stage starts `Pending`; explicit stages are ignored.
    pub fn create_feature(&self, team_id: Uuid, input: CreateFeatureInput) -> Result<Feature> {
        require_non_empty("feature key", &input.key)?;

        let conn = self.conn.lock().expect("database lock poisoned");
        require_team(&conn, team_id)?;

        let (stages, relationships) = match input.pipeline_id {
            Some(pipeline_id) => {
                let pipeline = read_pipeline(&conn, pipeline_id)?
                    .filter(|p| p.team_id == team_id)
                    .ok_or_else(|| anyhow::anyhow!("Pipeline not found"))?;
                let stages = pipeline
                    .stages
                    .into_iter()
                    .map(|s| CreateStageInput {
                        environment_id: s.environment_id,
                        order_index: s.order_index,
                        position: s.position,
                        status: None,
                    })
                    .collect::<Vec<_>>();
                (stages, pipeline.relationships)
            }
            None => (input.stages, input.relationships),
        };

        validate_layout(
            &conn,
            team_id,
            &StageLayout {
                stages: stages
                    .iter()
                    .map(|s| (s.environment_id, s.order_index))
                    .collect(),
                relationships: &relationships,
            },
        )?;
        validate_dependencies(&conn, team_id, &input.key, &input.dependencies)?;

        let id = Uuid::new_v4();
        let now = Utc::now();

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO features (id, team_id, key, description, feature_type, enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                team_id.to_string(),
                &input.key,
                &input.description,
                input.feature_type.as_str(),
                input.enabled,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;
        write_dependencies(&tx, id, &input.dependencies)?;
        for stage in &stages {
            tx.execute(
                "INSERT INTO feature_stages (id, feature_id, environment_id, order_index, position, status, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    id.to_string(),
                    stage.environment_id.to_string(),
                    stage.order_index,
                    encode_position(stage.position)?,
                    stage.status.unwrap_or(DeploymentStatus::Pending).as_str(),
                    now.to_rfc3339(),
                ),
            )?;
        }
        for rel in &relationships {
            tx.execute(
                "INSERT INTO feature_relationships (feature_id, source_index, target_index)
                 VALUES (?, ?, ?)",
                (id.to_string(), rel.source_id, rel.target_id),
            )?;
        }
        bump_revision(&tx)?;
        tx.commit()?;

        read_features(&conn, FeatureFilter::Id(id))?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Feature not found after insert"))
    }

    pub fn update_feature(&self, id: Uuid, input: UpdateFeatureInput) -> Result<Option<Feature>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let Some(existing) = read_features(&conn, FeatureFilter::Id(id))?.into_iter().next()
        else {
            return Ok(None);
        };

        if let Some(deps) = &input.dependencies {
            validate_dependencies(&conn, existing.team_id, &existing.key, deps)?;
        }

        let description = input.description.or(existing.description);
        let enabled = input.enabled.unwrap_or(existing.enabled);

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE features SET description = ?, enabled = ?, updated_at = ? WHERE id = ?",
            (
                &description,
                enabled,
                Utc::now().to_rfc3339(),
                id.to_string(),
            ),
        )?;
        if let Some(deps) = &input.dependencies {
            tx.execute(
                "DELETE FROM feature_dependencies WHERE feature_id = ?",
                [id.to_string()],
            )?;
            write_dependencies(&tx, id, deps)?;
        }
        bump_revision(&tx)?;
        tx.commit()?;

        Ok(read_features(&conn, FeatureFilter::Id(id))?.into_iter().next())
    }

    /// Delete a feature. Refused while another feature depends on it.
    pub fn delete_feature(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let Some(feature) = read_features(&conn, FeatureFilter::Id(id))?.into_iter().next() else {
            return Ok(false);
        };

        let dependent: Option<String> = conn
            .query_row(
                "SELECT f.key FROM feature_dependencies d JOIN features f ON f.id = d.feature_id
                 WHERE f.team_id = ? AND d.depends_on = ? ORDER BY f.key LIMIT 1",
                (feature.team_id.to_string(), &feature.key),
                |row| row.get(0),
            )
            .optional()?;
        if let Some(dependent) = dependent {
            anyhow::bail!(
                "feature '{}' is a dependency of '{}'",
                feature.key,
                dependent
            );
        }

        let tx = conn.unchecked_transaction()?;
        let rows = tx.execute("DELETE FROM features WHERE id = ?", [id.to_string()])?;
        bump_revision(&tx)?;
        tx.commit()?;
        Ok(rows > 0)
    }

    // ============================================================
    // Stage operations
    // ============================================================

    pub fn get_stage(&self, id: Uuid) -> Result<Option<Stage>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        read_stage(&conn, id)
    }

    /// Replace the contexts associated with a stage.
    pub fn set_stage_contexts(&self, stage_id: Uuid, context_ids: &[Uuid]) -> Result<Option<Stage>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let Some(team_id) = stage_team(&conn, stage_id)? else {
            return Ok(None);
        };

        let team_contexts = context_keys_by_id(&conn, team_id)?;
        if let Some(missing) = context_ids.iter().find(|id| !team_contexts.contains_key(*id)) {
            anyhow::bail!("Context {} not found", missing);
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM stage_contexts WHERE stage_id = ?",
            [stage_id.to_string()],
        )?;
        for (position, context_id) in context_ids.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO stage_contexts (stage_id, context_id, position) VALUES (?, ?, ?)",
                (stage_id.to_string(), context_id.to_string(), position as i64),
            )?;
        }
        touch_stage(&tx, stage_id)?;
        bump_revision(&tx)?;
        tx.commit()?;

        read_stage(&conn, stage_id)
    }

    /// Replace a stage's criteria. Input order becomes evaluation order.
    pub fn set_stage_criteria(
        &self,
        stage_id: Uuid,
        criteria: Vec<CreateCriterionInput>,
    ) -> Result<Option<Stage>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let Some(team_id) = stage_team(&conn, stage_id)? else {
            return Ok(None);
        };

        let team_contexts = context_keys_by_id(&conn, team_id)?;
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            if criterion.rollout_percentage > 100 {
                anyhow::bail!(
                    "rollout percentage must be between 0 and 100, got {}",
                    criterion.rollout_percentage
                );
            }
            if !seen.insert(criterion.context_key.clone()) {
                anyhow::bail!(
                    "criteria must be unique per context, '{}' is repeated",
                    criterion.context_key
                );
            }
            let context_id = match criterion.context_id {
                Some(id) => match team_contexts.get(&id) {
                    Some(key) if *key == criterion.context_key => id,
                    Some(key) => anyhow::bail!(
                        "context {} has key '{}', criterion must use the same key",
                        id,
                        key
                    ),
                    None => anyhow::bail!("Context {} not found", id),
                },
                None => team_contexts
                    .iter()
                    .find(|(_, key)| **key == criterion.context_key)
                    .map(|(id, _)| *id)
                    .ok_or_else(|| {
                        anyhow::anyhow!("Context '{}' not found", criterion.context_key)
                    })?,
            };
            resolved.push((context_id, criterion));
        }

        let now = Utc::now();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM stage_criteria WHERE stage_id = ?",
            [stage_id.to_string()],
        )?;
        for (seq, (context_id, criterion)) in resolved.iter().enumerate() {
            tx.execute(
                "INSERT INTO stage_criteria (id, stage_id, context_id, context_key, rollout_percentage, seq, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    stage_id.to_string(),
                    context_id.to_string(),
                    &criterion.context_key,
                    criterion.rollout_percentage,
                    seq as i64,
                    now.to_rfc3339(),
                ),
            )?;
        }
        touch_stage(&tx, stage_id)?;
        bump_revision(&tx)?;
        tx.commit()?;

        read_stage(&conn, stage_id)
    }

    /// Record the outcome of the external promotion workflow.
    pub fn set_stage_status(&self, stage_id: Uuid, status: DeploymentStatus) -> Result<Option<Stage>> {
        let conn = self.conn.lock().expect("database lock poisoned");

        let tx = conn.unchecked_transaction()?;
        let rows = tx.execute(
            "UPDATE feature_stages SET status = ?, updated_at = ? WHERE id = ?",
            (status.as_str(), Utc::now().to_rfc3339(), stage_id.to_string()),
        )?;
        if rows == 0 {
            return Ok(None);
        }
        bump_revision(&tx)?;
        tx.commit()?;

        read_stage(&conn, stage_id)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

// ============================================================
// Row mapping
// ============================================================

fn row_to_team(row: &Row) -> rusqlite::Result<Team> {
    Ok(Team {
        id: parse_uuid(row.get::<_, String>(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: parse_datetime(row.get::<_, String>(3)?),
        updated_at: parse_datetime(row.get::<_, String>(4)?),
    })
}

fn row_to_environment(row: &Row) -> rusqlite::Result<Environment> {
    Ok(Environment {
        id: parse_uuid(row.get::<_, String>(0)?),
        team_id: parse_uuid(row.get::<_, String>(1)?),
        name: row.get(2)?,
        active: row.get(3)?,
        created_at: parse_datetime(row.get::<_, String>(4)?),
    })
}

fn row_to_client(row: &Row) -> rusqlite::Result<Client> {
    let client_type: String = row.get(4)?;
    let web_origins: String = row.get(7)?;
    Ok(Client {
        id: parse_uuid(row.get::<_, String>(0)?),
        team_id: parse_uuid(row.get::<_, String>(1)?),
        name: row.get(2)?,
        description: row.get(3)?,
        client_type: ClientType::from_str(&client_type).unwrap_or(ClientType::Backend),
        enabled: row.get(5)?,
        environment_id: row.get::<_, Option<String>>(6)?.map(parse_uuid),
        web_origins: serde_json::from_str(&web_origins).unwrap_or_default(),
        created_at: parse_datetime(row.get::<_, String>(8)?),
    })
}

fn row_to_context(row: &Row) -> rusqlite::Result<Context> {
    let entries: String = row.get(3)?;
    Ok(Context {
        id: parse_uuid(row.get::<_, String>(0)?),
        team_id: parse_uuid(row.get::<_, String>(1)?),
        key: row.get(2)?,
        entries: serde_json::from_str(&entries).unwrap_or_default(),
        created_at: parse_datetime(row.get::<_, String>(4)?),
    })
}

fn row_to_stage(row: &Row) -> rusqlite::Result<Stage> {
    let status: String = row.get(5)?;
    Ok(Stage {
        id: parse_uuid(row.get::<_, String>(0)?),
        feature_id: parse_uuid(row.get::<_, String>(1)?),
        environment_id: parse_uuid(row.get::<_, String>(2)?),
        order_index: row.get(3)?,
        position: decode_position(row.get(4)?),
        status: DeploymentStatus::from_str(&status).unwrap_or(DeploymentStatus::Pending),
        context_ids: Vec::new(),
        criteria: Vec::new(),
        updated_at: parse_datetime(row.get::<_, String>(6)?),
    })
}

fn row_to_criterion(row: &Row) -> rusqlite::Result<(Uuid, Criterion)> {
    Ok((
        parse_uuid(row.get::<_, String>(1)?),
        Criterion {
            id: parse_uuid(row.get::<_, String>(0)?),
            context_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
            context_key: row.get(3)?,
            rollout_percentage: row.get::<_, i64>(4)?.clamp(0, 100) as u8,
        },
    ))
}

// ============================================================
// Reads shared by the public operations
// ============================================================

fn read_revision(conn: &Connection) -> Result<u64> {
    let revision: i64 = conn.query_row(
        "SELECT revision FROM config_revision WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(revision.max(0) as u64)
}

fn read_environment(conn: &Connection, id: Uuid) -> Result<Option<Environment>> {
    let env = conn
        .query_row(
            "SELECT id, team_id, name, active, created_at FROM environments WHERE id = ?",
            [id.to_string()],
            row_to_environment,
        )
        .optional()?;
    Ok(env)
}

fn read_pipeline(conn: &Connection, id: Uuid) -> Result<Option<Pipeline>> {
    let header = conn
        .query_row(
            "SELECT id, team_id, name, created_at FROM pipelines WHERE id = ?",
            [id.to_string()],
            |row| {
                Ok((
                    parse_uuid(row.get::<_, String>(1)?),
                    row.get::<_, String>(2)?,
                    parse_datetime(row.get::<_, String>(3)?),
                ))
            },
        )
        .optional()?;
    let Some((team_id, name, created_at)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT environment_id, order_index, position FROM pipeline_stages
         WHERE pipeline_id = ? ORDER BY order_index",
    )?;
    let stages = stmt
        .query_map([id.to_string()], |row| {
            Ok(PipelineStage {
                environment_id: parse_uuid(row.get::<_, String>(0)?),
                order_index: row.get(1)?,
                position: decode_position(row.get(2)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT source_index, target_index FROM pipeline_relationships
         WHERE pipeline_id = ? ORDER BY source_index, target_index",
    )?;
    let relationships = stmt
        .query_map([id.to_string()], |row| {
            Ok(StageRelationship {
                source_id: row.get(0)?,
                target_id: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Pipeline {
        id,
        team_id,
        name,
        stages,
        relationships,
        created_at,
    }))
}

/// Load features with their dependencies, stages, criteria and relationships
/// using one query per table.
fn read_features(conn: &Connection, filter: FeatureFilter) -> Result<Vec<Feature>> {
    let param = filter.param();
    let params = || params_from_iter(param.iter());

    let mut stmt = conn.prepare(&format!(
        "SELECT f.id, f.team_id, f.key, f.description, f.feature_type, f.enabled, f.created_at, f.updated_at
         FROM features f WHERE {} ORDER BY f.key",
        filter.clause("f")
    ))?;
    let mut features = stmt
        .query_map(params(), |row| {
            let feature_type: String = row.get(4)?;
            Ok(Feature {
                id: parse_uuid(row.get::<_, String>(0)?),
                team_id: parse_uuid(row.get::<_, String>(1)?),
                key: row.get(2)?,
                description: row.get(3)?,
                feature_type: FeatureType::from_str(&feature_type).unwrap_or(FeatureType::Simple),
                enabled: row.get(5)?,
                dependencies: Vec::new(),
                stages: Vec::new(),
                relationships: Vec::new(),
                created_at: parse_datetime(row.get::<_, String>(6)?),
                updated_at: parse_datetime(row.get::<_, String>(7)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if features.is_empty() {
        return Ok(features);
    }

    let mut deps: HashMap<Uuid, Vec<String>> = HashMap::new();
    let mut stmt = conn.prepare(&format!(
        "SELECT d.feature_id, d.depends_on FROM feature_dependencies d
         JOIN features f ON f.id = d.feature_id WHERE {} ORDER BY d.position",
        filter.clause("f")
    ))?;
    let rows = stmt.query_map(params(), |row| {
        Ok((parse_uuid(row.get::<_, String>(0)?), row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (feature_id, dep) = row?;
        deps.entry(feature_id).or_default().push(dep);
    }

    let mut relationships: HashMap<Uuid, Vec<StageRelationship>> = HashMap::new();
    let mut stmt = conn.prepare(&format!(
        "SELECT r.feature_id, r.source_index, r.target_index FROM feature_relationships r
         JOIN features f ON f.id = r.feature_id WHERE {} ORDER BY r.source_index, r.target_index",
        filter.clause("f")
    ))?;
    let rows = stmt.query_map(params(), |row| {
        Ok((
            parse_uuid(row.get::<_, String>(0)?),
            StageRelationship {
                source_id: row.get(1)?,
                target_id: row.get(2)?,
            },
        ))
    })?;
    for row in rows {
        let (feature_id, rel) = row?;
        relationships.entry(feature_id).or_default().push(rel);
    }

    let mut stage_contexts: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut stmt = conn.prepare(&format!(
        "SELECT sc.stage_id, sc.context_id FROM stage_contexts sc
         JOIN feature_stages s ON s.id = sc.stage_id
         JOIN features f ON f.id = s.feature_id WHERE {} ORDER BY sc.position",
        filter.clause("f")
    ))?;
    let rows = stmt.query_map(params(), |row| {
        Ok((
            parse_uuid(row.get::<_, String>(0)?),
            parse_uuid(row.get::<_, String>(1)?),
        ))
    })?;
    for row in rows {
        let (stage_id, context_id) = row?;
        stage_contexts.entry(stage_id).or_default().push(context_id);
    }

    let mut criteria: HashMap<Uuid, Vec<Criterion>> = HashMap::new();
    let mut stmt = conn.prepare(&format!(
        "SELECT c.id, c.stage_id, c.context_id, c.context_key, c.rollout_percentage FROM stage_criteria c
         JOIN feature_stages s ON s.id = c.stage_id
         JOIN features f ON f.id = s.feature_id WHERE {} ORDER BY c.seq",
        filter.clause("f")
    ))?;
    for row in stmt.query_map(params(), row_to_criterion)? {
        let (stage_id, criterion) = row?;
        criteria.entry(stage_id).or_default().push(criterion);
    }

    let mut stages: HashMap<Uuid, Vec<Stage>> = HashMap::new();
    let mut stmt = conn.prepare(&format!(
        "SELECT s.id, s.feature_id, s.environment_id, s.order_index, s.position, s.status, s.updated_at
         FROM feature_stages s JOIN features f ON f.id = s.feature_id WHERE {} ORDER BY s.order_index",
        filter.clause("f")
    ))?;
    for row in stmt.query_map(params(), row_to_stage)? {
        let mut stage = row?;
        stage.context_ids = stage_contexts.remove(&stage.id).unwrap_or_default();
        stage.criteria = criteria.remove(&stage.id).unwrap_or_default();
        stages.entry(stage.feature_id).or_default().push(stage);
    }

    for feature in &mut features {
        feature.dependencies = deps.remove(&feature.id).unwrap_or_default();
        feature.relationships = relationships.remove(&feature.id).unwrap_or_default();
        feature.stages = stages.remove(&feature.id).unwrap_or_default();
    }

    Ok(features)
}

fn read_stage(conn: &Connection, id: Uuid) -> Result<Option<Stage>> {
    let stage = conn
        .query_row(
            "SELECT id, feature_id, environment_id, order_index, position, status, updated_at
             FROM feature_stages WHERE id = ?",
            [id.to_string()],
            row_to_stage,
        )
        .optional()?;
    let Some(mut stage) = stage else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare("SELECT context_id FROM stage_contexts WHERE stage_id = ? ORDER BY position")?;
    stage.context_ids = stmt
        .query_map([id.to_string()], |row| Ok(parse_uuid(row.get::<_, String>(0)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, stage_id, context_id, context_key, rollout_percentage
         FROM stage_criteria WHERE stage_id = ? ORDER BY seq",
    )?;
    stage.criteria = stmt
        .query_map([id.to_string()], row_to_criterion)?
        .map(|r| r.map(|(_, c)| c))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(stage))
}

/// Team owning a stage, through its feature.
fn stage_team(conn: &Connection, stage_id: Uuid) -> Result<Option<Uuid>> {
    let team = conn
        .query_row(
            "SELECT f.team_id FROM feature_stages s JOIN features f ON f.id = s.feature_id
             WHERE s.id = ?",
            [stage_id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(team.map(parse_uuid))
}

fn context_keys_by_id(conn: &Connection, team_id: Uuid) -> Result<HashMap<Uuid, String>> {
    let mut stmt = conn.prepare("SELECT id, key FROM contexts WHERE team_id = ?")?;
    let map = stmt
        .query_map([team_id.to_string()], |row| {
            Ok((parse_uuid(row.get::<_, String>(0)?), row.get::<_, String>(1)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(map)
}

// ============================================================
// Validation
// ============================================================

fn require_non_empty(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{} must not be empty", what);
    }
    Ok(())
}

fn require_team(conn: &Connection, team_id: Uuid) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM teams WHERE id = ?)",
        [team_id.to_string()],
        |row| row.get(0),
    )?;
    if !exists {
        anyhow::bail!("Team not found");
    }
    Ok(())
}

fn require_team_environment(conn: &Connection, team_id: Uuid, env_id: Uuid) -> Result<()> {
    match read_environment(conn, env_id)? {
        Some(env) if env.team_id == team_id => Ok(()),
        Some(_) => anyhow::bail!("environment {} must belong to the same team", env_id),
        None => anyhow::bail!("Environment {} not found", env_id),
    }
}

/// Stages must use distinct environments of the team and distinct order
/// indexes; relationships must connect two different existing stages.
fn validate_layout(conn: &Connection, team_id: Uuid, layout: &StageLayout) -> Result<()> {
    let mut envs = HashSet::new();
    let mut indexes = HashSet::new();
    for (env_id, order_index) in &layout.stages {
        require_team_environment(conn, team_id, *env_id)?;
        if !envs.insert(*env_id) {
            anyhow::bail!("each environment must appear in at most one stage");
        }
        if !indexes.insert(*order_index) {
            anyhow::bail!("stage order index {} must be unique", order_index);
        }
    }
    for rel in layout.relationships {
        if rel.source_id == rel.target_id {
            anyhow::bail!("relationship source and target must differ");
        }
        for index in [rel.source_id, rel.target_id] {
            if !indexes.contains(&index) {
                anyhow::bail!("relationship must reference an existing stage, {} is unknown", index);
            }
        }
    }
    Ok(())
}

/// Check that `key` with `dependencies` keeps the team's dependency graph
/// acyclic and fully resolved.
fn validate_dependencies(
    conn: &Connection,
    team_id: Uuid,
    key: &str,
    dependencies: &[String],
) -> Result<()> {
    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn.prepare("SELECT key FROM features WHERE team_id = ?")?;
    for row in stmt.query_map([team_id.to_string()], |row| row.get::<_, String>(0))? {
        graph.insert(row?, Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT f.key, d.depends_on FROM feature_dependencies d
         JOIN features f ON f.id = d.feature_id WHERE f.team_id = ? ORDER BY d.position",
    )?;
    let rows = stmt.query_map([team_id.to_string()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (feature, dep) = row?;
        graph.entry(feature).or_default().push(dep);
    }

    graph.insert(key.to_string(), dependencies.to_vec());
    check_dependencies(graph.iter().map(|(k, v)| (k.as_str(), v.as_slice())))?;
    Ok(())
}

// ============================================================
// Writes shared by the public operations
// ============================================================

fn bump_revision(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE config_revision SET revision = revision + 1 WHERE id = 1",
        [],
    )?;
    Ok(())
}

fn touch_stage(conn: &Connection, stage_id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE feature_stages SET updated_at = ? WHERE id = ?",
        (Utc::now().to_rfc3339(), stage_id.to_string()),
    )?;
    Ok(())
}

fn write_dependencies(conn: &Connection, feature_id: Uuid, deps: &[String]) -> Result<()> {
    for (position, dep) in deps.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO feature_dependencies (feature_id, depends_on, position) VALUES (?, ?, ?)",
            (feature_id.to_string(), dep, position as i64),
        )?;
    }
    Ok(())
}

fn encode_position(position: Option<Position>) -> Result<Option<String>> {
    Ok(position.map(|p| serde_json::to_string(&p)).transpose()?)
}

fn decode_position(raw: Option<String>) -> Option<Position> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
