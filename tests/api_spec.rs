use axum::http::StatusCode;
use axum_test::TestServer;
use fluxgate::api::{create_router, AppState};
use fluxgate::config::ServerConfig;
use fluxgate::db::Database;
use fluxgate::eval::bucket::{bucket_of, BucketSalt};
use fluxgate::models::*;
use serde_json::{json, Value};
use uuid::Uuid;

/// The E-Commerce team with a dev and prod environment, a `userTier` context,
/// a client bound to prod and a handful of flags.
struct Fixture {
    server: TestServer,
    state: AppState,
    team: Team,
    dev: Environment,
    prod: Environment,
    client: Client,
}

fn stage(env: &Environment, order_index: u32, status: DeploymentStatus) -> CreateStageInput {
    CreateStageInput {
        environment_id: env.id,
        order_index,
        position: None,
        status: Some(status),
    }
}

fn feature_input(
    key: &str,
    feature_type: FeatureType,
    dependencies: &[&str],
    stages: Vec<CreateStageInput>,
) -> CreateFeatureInput {
    CreateFeatureInput {
        key: key.to_string(),
        description: None,
        feature_type,
        enabled: true,
        dependencies: dependencies.iter().map(|s| s.to_string()).collect(),
        pipeline_id: None,
        stages,
        relationships: vec![],
    }
}

fn stage_for(feature: &Feature, env: &Environment) -> Uuid {
    feature
        .stages
        .iter()
        .find(|s| s.environment_id == env.id)
        .map(|s| s.id)
        .expect("stage for environment")
}

fn setup_with(config: ServerConfig) -> Fixture {
    let db = Database::open_memory().expect("Failed to create database");
    db.migrate().expect("Failed to migrate");

    let team = db
        .create_team(CreateTeamInput {
            name: "E-Commerce".to_string(),
            description: None,
        })
        .expect("team");
    let dev = db
        .create_environment(
            team.id,
            CreateEnvironmentInput {
                name: "E-Commerce-Dev".to_string(),
                active: true,
            },
        )
        .expect("dev");
    let prod = db
        .create_environment(
            team.id,
            CreateEnvironmentInput {
                name: "E-Commerce-Prod".to_string(),
                active: true,
            },
        )
        .expect("prod");
    db.create_context(
        team.id,
        CreateContextInput {
            key: "userTier".to_string(),
            entries: vec!["premium".to_string(), "standard".to_string()],
        },
    )
    .expect("context");
    let client = db
        .create_client(
            team.id,
            CreateClientInput {
                name: "storefront".to_string(),
                description: None,
                client_type: ClientType::Backend,
                enabled: true,
                environment_id: Some(prod.id),
                web_origins: vec![],
            },
        )
        .expect("client");

    let deployed = |order| {
        vec![
            stage(&dev, 0, DeploymentStatus::Deployed),
            stage(&prod, order, DeploymentStatus::Deployed),
        ]
    };
    db.create_feature(
        team.id,
        feature_input("NewCheckoutFlow", FeatureType::Simple, &[], deployed(1)),
    )
    .expect("NewCheckoutFlow");
    let premium = db
        .create_feature(
            team.id,
            feature_input("PremiumCheckout", FeatureType::Contextual, &[], deployed(1)),
        )
        .expect("PremiumCheckout");
    db.set_stage_criteria(
        stage_for(&premium, &dev),
        vec![CreateCriterionInput {
            context_key: "userTier".to_string(),
            context_id: None,
            rollout_percentage: 50,
        }],
    )
    .expect("criteria");
    db.create_feature(
        team.id,
        feature_input(
            "SearchV2",
            FeatureType::Simple,
            &[],
            vec![stage(&dev, 0, DeploymentStatus::Pending)],
        ),
    )
    .expect("SearchV2");
    db.create_feature(
        team.id,
        feature_input(
            "ExpressShipping",
            FeatureType::Simple,
            &["NewCheckoutFlow"],
            deployed(1),
        ),
    )
    .expect("ExpressShipping");

    let state = AppState::new(db, config);
    let server = TestServer::new(create_router(state.clone())).expect("Failed to create test server");

    Fixture {
        server,
        state,
        team,
        dev,
        prod,
        client,
    }
}

fn setup() -> Fixture {
    setup_with(ServerConfig::for_testing())
}

fn dev_context(targeting_key: &str) -> Value {
    json!({ "context": { "targetingKey": targeting_key, "environment_id": "E-Commerce-Dev" } })
}

mod single_flag_evaluation {
    use super::*;

    #[tokio::test]
    async fn simple_flag_resolves_static_true() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&dev_context("user-001"))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["key"], "NewCheckoutFlow");
        assert_eq!(body["value"], true);
        assert_eq!(body["reason"], "STATIC");
        assert_eq!(body["variant"], "on");
        assert_eq!(body["metadata"]["environment"], "E-Commerce-Dev");
    }

    #[tokio::test]
    async fn partial_rollout_is_deterministic() {
        let f = setup();
        let expected = bucket_of("user-001", &BucketSalt::new("PremiumCheckout", f.dev.id)) < 50;

        let request = json!({
            "context": {
                "targetingKey": "user-001",
                "environment_id": "E-Commerce-Dev",
                "userTier": "premium"
            }
        });
        let first: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/PremiumCheckout")
            .json(&request)
            .await
            .json();
        let second: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/PremiumCheckout")
            .json(&request)
            .await
            .json();

        assert_eq!(first["reason"], "SPLIT");
        assert_eq!(first["value"], expected);
        assert_eq!(first["value"], second["value"]);
    }

    #[tokio::test]
    async fn caller_without_the_criterion_key_gets_the_default() {
        let f = setup();

        let body: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/PremiumCheckout")
            .json(&dev_context("user-001"))
            .await
            .json();

        assert_eq!(body["reason"], "DEFAULT");
        assert_eq!(body["value"], true);
    }

    #[tokio::test]
    async fn unknown_flag_is_not_found() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/DoesNotExist")
            .json(&dev_context("user-001"))
            .await;

        response.assert_status_not_found();
        let body: Value = response.json();
        assert_eq!(body["key"], "DoesNotExist");
        assert_eq!(body["errorCode"], "FLAG_NOT_FOUND");
        assert_eq!(body["reason"], "ERROR");
    }

    #[tokio::test]
    async fn empty_targeting_key_is_invalid_context() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&dev_context(""))
            .await;

        response.assert_status_bad_request();
        let body: Value = response.json();
        assert_eq!(body["errorCode"], "INVALID_CONTEXT");
    }

    #[tokio::test]
    async fn missing_context_is_invalid_context() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&json!({}))
            .await;

        response.assert_status_bad_request();
        let body: Value = response.json();
        assert_eq!(body["errorCode"], "INVALID_CONTEXT");
    }

    #[tokio::test]
    async fn undeployed_stage_is_disabled() {
        let f = setup();

        let body: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/SearchV2")
            .json(&dev_context("user-001"))
            .await
            .json();

        assert_eq!(body["value"], false);
        assert_eq!(body["reason"], "DISABLED");
        assert_eq!(body["variant"], "off");
    }

    #[tokio::test]
    async fn flag_without_a_stage_for_the_environment_is_not_found() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/SearchV2")
            .json(&json!({ "context": { "targetingKey": "u", "environment_id": "E-Commerce-Prod" } }))
            .await;

        response.assert_status_not_found();
    }

    #[tokio::test]
    async fn dependent_flag_follows_its_dependency() {
        let f = setup();

        let body: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/ExpressShipping")
            .json(&dev_context("user-001"))
            .await
            .json();
        assert_eq!(body["value"], true);

        let feature = f
            .state
            .db
            .get_features(f.team.id)
            .expect("features")
            .into_iter()
            .find(|feat| feat.key == "NewCheckoutFlow")
            .expect("NewCheckoutFlow");
        f.server
            .put(&format!("/api/v1/features/{}", feature.id))
            .json(&json!({ "enabled": false }))
            .await
            .assert_status_ok();

        let body: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/ExpressShipping")
            .json(&dev_context("user-001"))
            .await
            .json();
        assert_eq!(body["value"], false);
        assert_eq!(body["reason"], "DISABLED");
    }
}

mod environment_resolution {
    use super::*;

    #[tokio::test]
    async fn accepts_environment_ids() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&json!({ "context": { "targetingKey": "u", "environment_id": f.prod.id.to_string() } }))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["metadata"]["environment"], "E-Commerce-Prod");
    }

    #[tokio::test]
    async fn bound_client_uses_its_environment() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .add_header("Authorization", &format!("Bearer {}", f.client.id))
            .json(&dev_context("user-001"))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["metadata"]["environment"], "E-Commerce-Prod");
    }

    #[tokio::test]
    async fn unknown_client_is_unauthorized() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .add_header("Authorization", &format!("Bearer {}", Uuid::new_v4()))
            .json(&dev_context("user-001"))
            .await;

        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_context_is_reported_before_the_client_check() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .add_header("Authorization", &format!("Bearer {}", Uuid::new_v4()))
            .json(&dev_context(""))
            .await;

        response.assert_status_bad_request();
        let body: Value = response.json();
        assert_eq!(body["errorCode"], "INVALID_CONTEXT");
    }

    #[tokio::test]
    async fn unknown_environment_is_not_found() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&json!({ "context": { "targetingKey": "u", "environment_id": "Nowhere" } }))
            .await;

        response.assert_status_not_found();
    }

    #[tokio::test]
    async fn no_environment_at_all_is_invalid_context() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&json!({ "context": { "targetingKey": "u" } }))
            .await;

        response.assert_status_bad_request();
    }

    #[tokio::test]
    async fn falls_back_to_the_server_default() {
        let f = setup_with(ServerConfig {
            default_environment: Some("E-Commerce-Dev".to_string()),
            ..ServerConfig::for_testing()
        });

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&json!({ "context": { "targetingKey": "u" } }))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["metadata"]["environment"], "E-Commerce-Dev");
    }
}

mod bulk_evaluation {
    use super::*;

    #[tokio::test]
    async fn evaluates_every_flag_of_the_team() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags")
            .json(&dev_context("user-001"))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        let keys: Vec<&str> = body["flags"]
            .as_array()
            .expect("flags array")
            .iter()
            .map(|f| f["key"].as_str().unwrap())
            .collect();
        assert_eq!(
            keys,
            vec!["ExpressShipping", "NewCheckoutFlow", "PremiumCheckout", "SearchV2"]
        );
    }

    #[tokio::test]
    async fn reports_per_flag_errors_inline() {
        let f = setup();

        let body: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags")
            .json(&json!({ "context": { "targetingKey": "u", "environment_id": "E-Commerce-Prod" } }))
            .await
            .json();

        let search = body["flags"]
            .as_array()
            .unwrap()
            .iter()
            .find(|f| f["key"] == "SearchV2")
            .expect("SearchV2 entry");
        assert_eq!(search["errorCode"], "FLAG_NOT_FOUND");
    }

    #[tokio::test]
    async fn rejects_invalid_context() {
        let f = setup();

        let response = f
            .server
            .post("/ofrep/v1/evaluate/flags")
            .json(&dev_context("  "))
            .await;

        response.assert_status_bad_request();
    }
}

mod admin_api {
    use super::*;

    #[tokio::test]
    async fn creates_and_lists_teams() {
        let f = setup();

        let response = f
            .server
            .post("/api/v1/teams")
            .json(&CreateTeamInput {
                name: "Payments".to_string(),
                description: Some("Checkout payments".to_string()),
            })
            .await;
        response.assert_status(StatusCode::CREATED);

        let teams: Vec<Team> = f.server.get("/api/v1/teams").await.json();
        let names: Vec<_> = teams.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["E-Commerce", "Payments"]);
    }

    #[tokio::test]
    async fn duplicate_team_name_conflicts() {
        let f = setup();

        let response = f
            .server
            .post("/api/v1/teams")
            .json(&CreateTeamInput {
                name: "E-Commerce".to_string(),
                description: None,
            })
            .await;

        response.assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_team_is_not_found() {
        let f = setup();

        f.server
            .get(&format!("/api/v1/teams/{}", Uuid::new_v4()))
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn feature_created_from_pipeline_starts_pending() {
        let f = setup();

        let pipeline: Pipeline = f
            .server
            .post(&format!("/api/v1/teams/{}/pipelines", f.team.id))
            .json(&CreatePipelineInput {
                name: "Standard".to_string(),
                stages: vec![
                    PipelineStage {
                        environment_id: f.dev.id,
                        order_index: 0,
                        position: Some(Position { x: 0.0, y: 0.0 }),
                    },
                    PipelineStage {
                        environment_id: f.prod.id,
                        order_index: 1,
                        position: Some(Position { x: 200.0, y: 0.0 }),
                    },
                ],
                relationships: vec![StageRelationship {
                    source_id: 0,
                    target_id: 1,
                }],
            })
            .await
            .json();

        let response = f
            .server
            .post(&format!("/api/v1/teams/{}/features", f.team.id))
            .json(&CreateFeatureInput {
                pipeline_id: Some(pipeline.id),
                ..feature_input("LoyaltyPoints", FeatureType::Simple, &[], vec![])
            })
            .await;
        response.assert_status(StatusCode::CREATED);
        let feature: Feature = response.json();
        assert_eq!(feature.stages.len(), 2);
        assert!(feature
            .stages
            .iter()
            .all(|s| s.status == DeploymentStatus::Pending));
        assert_eq!(feature.relationships, pipeline.relationships);

        let body: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/LoyaltyPoints")
            .json(&dev_context("user-001"))
            .await
            .json();
        assert_eq!(body["reason"], "DISABLED");
    }

    #[tokio::test]
    async fn stage_status_change_is_served_immediately() {
        let f = setup();
        let search = f
            .state
            .db
            .get_features(f.team.id)
            .unwrap()
            .into_iter()
            .find(|feat| feat.key == "SearchV2")
            .unwrap();

        f.server
            .put(&format!("/api/v1/stages/{}/status", stage_for(&search, &f.dev)))
            .json(&SetStageStatusInput {
                status: DeploymentStatus::Deployed,
            })
            .await
            .assert_status_ok();

        let body: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/SearchV2")
            .json(&dev_context("user-001"))
            .await
            .json();
        assert_eq!(body["value"], true);
        assert_eq!(body["reason"], "STATIC");
    }

    #[tokio::test]
    async fn full_rollout_criteria_resolve_as_targeting_match() {
        let f = setup();
        let premium = f
            .state
            .db
            .get_features(f.team.id)
            .unwrap()
            .into_iter()
            .find(|feat| feat.key == "PremiumCheckout")
            .unwrap();

        f.server
            .put(&format!("/api/v1/stages/{}/criteria", stage_for(&premium, &f.dev)))
            .json(&SetStageCriteriaInput {
                criteria: vec![CreateCriterionInput {
                    context_key: "userTier".to_string(),
                    context_id: None,
                    rollout_percentage: 100,
                }],
            })
            .await
            .assert_status_ok();

        let body: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/PremiumCheckout")
            .json(&json!({
                "context": { "targetingKey": "user-001", "environment_id": "E-Commerce-Dev", "userTier": "premium" }
            }))
            .await
            .json();
        assert_eq!(body["value"], true);
        assert_eq!(body["reason"], "TARGETING_MATCH");
    }

    #[tokio::test]
    async fn simple_flag_ignores_criteria_on_its_stage() {
        let f = setup();
        let checkout = f
            .state
            .db
            .get_features(f.team.id)
            .unwrap()
            .into_iter()
            .find(|feat| feat.key == "NewCheckoutFlow")
            .unwrap();

        f.server
            .put(&format!("/api/v1/stages/{}/criteria", stage_for(&checkout, &f.dev)))
            .json(&json!({ "criteria": [{ "context_key": "userTier", "rollout_percentage": 0 }] }))
            .await
            .assert_status_ok();

        let body: Value = f
            .server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&json!({
                "context": { "targetingKey": "user-001", "environment_id": "E-Commerce-Dev", "userTier": "premium" }
            }))
            .await
            .json();
        assert_eq!(body["value"], true);
        assert_eq!(body["reason"], "STATIC");
    }

    #[tokio::test]
    async fn rejects_criteria_above_one_hundred_percent() {
        let f = setup();
        let premium = f
            .state
            .db
            .get_features(f.team.id)
            .unwrap()
            .into_iter()
            .find(|feat| feat.key == "PremiumCheckout")
            .unwrap();

        f.server
            .put(&format!("/api/v1/stages/{}/criteria", stage_for(&premium, &f.dev)))
            .json(&json!({ "criteria": [{ "context_key": "userTier", "rollout_percentage": 101 }] }))
            .await
            .assert_status_bad_request();
    }

    #[tokio::test]
    async fn dependency_cycles_are_rejected() {
        let f = setup();
        let checkout = f
            .state
            .db
            .get_features(f.team.id)
            .unwrap()
            .into_iter()
            .find(|feat| feat.key == "NewCheckoutFlow")
            .unwrap();
        let version_before = f.state.store.current().unwrap().version();

        let response = f
            .server
            .put(&format!("/api/v1/features/{}", checkout.id))
            .json(&json!({ "dependencies": ["ExpressShipping"] }))
            .await;

        response.assert_status(StatusCode::CONFLICT);
        assert!(response.text().contains("cycle"));
        assert_eq!(f.state.store.current().unwrap().version(), version_before);
    }

    #[tokio::test]
    async fn deleting_a_dependency_is_refused() {
        let f = setup();
        let checkout = f
            .state
            .db
            .get_features(f.team.id)
            .unwrap()
            .into_iter()
            .find(|feat| feat.key == "NewCheckoutFlow")
            .unwrap();

        f.server
            .delete(&format!("/api/v1/features/{}", checkout.id))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn deleted_flag_stops_resolving() {
        let f = setup();
        let search = f
            .state
            .db
            .get_features(f.team.id)
            .unwrap()
            .into_iter()
            .find(|feat| feat.key == "SearchV2")
            .unwrap();

        f.server
            .delete(&format!("/api/v1/features/{}", search.id))
            .await
            .assert_status(StatusCode::NO_CONTENT);

        f.server
            .post("/ofrep/v1/evaluate/flags/SearchV2")
            .json(&dev_context("user-001"))
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn config_reports_the_published_snapshot() {
        let f = setup();

        let response = f.server.get("/api/v1/config").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["snapshot"]["features"], 4);
        assert_eq!(body["snapshot"]["environments"], 2);
        assert_eq!(body["cache"]["capacity"], 100_000);
    }
}

mod authentication {
    use super::*;

    fn setup_with_auth(key: &str) -> Fixture {
        setup_with(ServerConfig {
            admin_api_key: Some(key.to_string()),
            ..ServerConfig::for_testing()
        })
    }

    #[tokio::test]
    async fn health_endpoint_is_accessible_without_auth() {
        let f = setup_with_auth("test-secret-key");

        let response = f.server.get("/api/v1/health").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn admin_endpoint_requires_auth() {
        let f = setup_with_auth("test-secret-key");

        f.server
            .get("/api/v1/teams")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_endpoint_accepts_valid_bearer_token() {
        let f = setup_with_auth("test-secret-key");

        f.server
            .get("/api/v1/teams")
            .add_header("Authorization", "Bearer test-secret-key")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn admin_endpoint_rejects_wrong_key() {
        let f = setup_with_auth("test-secret-key");

        f.server
            .get("/api/v1/teams")
            .add_header("Authorization", "Bearer wrong-key")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn evaluation_does_not_need_the_admin_key() {
        let f = setup_with_auth("test-secret-key");

        f.server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&dev_context("user-001"))
            .await
            .assert_status_ok();
    }
}

mod readiness {
    use super::*;

    #[tokio::test]
    async fn server_without_snapshot_reports_provider_not_ready() {
        let state = AppState::new(
            Database::open_memory().expect("database"),
            ServerConfig::for_testing(),
        );
        let server = TestServer::new(create_router(state)).expect("server");

        let response = server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&dev_context("user-001"))
            .await;

        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["errorCode"], "PROVIDER_NOT_READY");
    }

    #[tokio::test]
    async fn invalid_context_is_reported_before_readiness() {
        let state = AppState::new(
            Database::open_memory().expect("database"),
            ServerConfig::for_testing(),
        );
        let server = TestServer::new(create_router(state)).expect("server");

        let response = server
            .post("/ofrep/v1/evaluate/flags/NewCheckoutFlow")
            .json(&dev_context(""))
            .await;

        response.assert_status_bad_request();
        let body: Value = response.json();
        assert_eq!(body["errorCode"], "INVALID_CONTEXT");
    }
}
