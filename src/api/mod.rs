mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::db::Database;
use crate::eval::{AssignmentCache, Evaluator};
use crate::snapshot::ConfigStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub store: Arc<ConfigStore>,
    pub evaluator: Arc<Evaluator>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the store, cache and evaluator around `db` and publish the first
    /// snapshot. A rejected first publish leaves the server not ready rather
    /// than failing startup.
    pub fn new(db: Database, config: ServerConfig) -> Self {
        let store = Arc::new(ConfigStore::new());
        let evaluator = Arc::new(Evaluator::new(
            store.clone(),
            AssignmentCache::new(config.cache_capacity),
        ));

        if let Err(e) = store.refresh(&db) {
            tracing::error!(error = %e, "initial configuration load failed");
        }

        Self {
            db,
            store,
            evaluator,
            config: Arc::new(config),
        }
    }

    /// Publish whatever the database holds now.
    pub fn republish(&self) -> anyhow::Result<()> {
        self.store.refresh(&self.db)?;
        Ok(())
    }
}

pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        // Teams
        .route("/teams", get(handlers::list_teams).post(handlers::create_team))
        .route("/teams/{id}", get(handlers::get_team))
        .route(
            "/teams/{id}/environments",
            get(handlers::list_environments).post(handlers::create_environment),
        )
        .route(
            "/teams/{id}/clients",
            get(handlers::list_clients).post(handlers::create_client),
        )
        .route(
            "/teams/{id}/contexts",
            get(handlers::list_contexts).post(handlers::create_context),
        )
        .route(
            "/teams/{id}/pipelines",
            get(handlers::list_pipelines).post(handlers::create_pipeline),
        )
        .route(
            "/teams/{id}/features",
            get(handlers::list_features).post(handlers::create_feature),
        )
        // Pipelines
        .route("/pipelines/{id}", get(handlers::get_pipeline))
        // Features
        .route(
            "/features/{id}",
            get(handlers::get_feature)
                .put(handlers::update_feature)
                .delete(handlers::delete_feature),
        )
        // Stages
        .route("/stages/{id}", get(handlers::get_stage))
        .route("/stages/{id}/contexts", put(handlers::set_stage_contexts))
        .route("/stages/{id}/criteria", put(handlers::set_stage_criteria))
        .route("/stages/{id}/status", put(handlers::set_stage_status))
        // Published configuration
        .route("/config", get(handlers::get_config))
        .route_layer(axum::middleware::from_fn_with_state(
            state.config.clone(),
            middleware::auth_middleware,
        ))
        // Health stays reachable without the admin key
        .route("/health", get(handlers::health));

    let ofrep = Router::new()
        .route("/evaluate/flags", post(handlers::ofrep::evaluate_all))
        .route("/evaluate/flags/{key}", post(handlers::ofrep::evaluate_flag));

    Router::new()
        .nest("/api/v1", admin)
        .nest("/ofrep/v1", ofrep)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    match &config.cors_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| match o.parse() {
                    Ok(v) => Some(v),
                    Err(_) => {
                        tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    }
}

/// Periodically republish when the database changed outside this process.
/// Returns `None` when the interval is zero.
pub fn spawn_refresh(state: AppState) -> Option<tokio::task::JoinHandle<()>> {
    let period = state.config.refresh_interval;
    if period.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let db = state.db.clone();
            let store = state.store.clone();
            match tokio::task::spawn_blocking(move || store.refresh(&db)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "background refresh failed"),
                Err(e) => tracing::error!(error = %e, "background refresh task panicked"),
            }
        }
    }))
}
