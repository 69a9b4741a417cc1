use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fluxgate::{api, config::ServerConfig, db, snapshot::ConfigStore};

#[derive(Parser)]
#[command(name = "fluxgate")]
#[command(about = "Feature flag evaluation server speaking OFREP")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the evaluation and admin server
    Serve {
        /// Port for the HTTP API (overrides FLUXGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database file (overrides FLUXGATE_DATABASE)
        #[arg(short, long)]
        database: Option<PathBuf>,

        /// Environment id or name used when a request names none
        #[arg(long)]
        default_environment: Option<String>,

        /// Assignment cache size, 0 disables it
        #[arg(long)]
        cache_capacity: Option<usize>,

        /// Seconds between background refreshes, 0 disables them
        #[arg(long)]
        refresh_interval: Option<u64>,
    },
    /// Apply pending database migrations
    Migrate {
        #[arg(short, long)]
        database: Option<PathBuf>,
    },
    /// Build a snapshot from the database and print its summary
    Check {
        #[arg(short, long)]
        database: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "fluxgate=info,tower_http=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_database(path: Option<PathBuf>) -> anyhow::Result<db::Database> {
    let db = match path {
        Some(path) => db::Database::open(path)?,
        None => db::Database::open_default()?,
    };
    db.migrate()?;
    Ok(db)
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let db = open_database(config.database_path.clone())?;
    let address = config.bind_address();

    let state = api::AppState::new(db, config);
    if !state.store.is_ready() {
        tracing::warn!("serving without a configuration snapshot, evaluations will report PROVIDER_NOT_READY");
    }
    api::spawn_refresh(state.clone());

    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("FluxGate listening on http://{}", address);

    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = ServerConfig::from_env();

    match cli.command {
        Some(Commands::Serve {
            port,
            database,
            default_environment,
            cache_capacity,
            refresh_interval,
        }) => {
            if let Some(port) = port {
                config.port = port;
            }
            if database.is_some() {
                config.database_path = database;
            }
            if default_environment.is_some() {
                config.default_environment = default_environment;
            }
            if let Some(capacity) = cache_capacity {
                config.cache_capacity = capacity;
            }
            if let Some(secs) = refresh_interval {
                config.refresh_interval = Duration::from_secs(secs);
            }
            serve(config).await?;
        }
        Some(Commands::Migrate { database }) => {
            let path = database.or(config.database_path);
            open_database(path)?;
            println!("Database is up to date");
        }
        Some(Commands::Check { database }) => {
            let path = database.or(config.database_path);
            let db = open_database(path)?;
            let store = ConfigStore::new();
            let snapshot = store.publish(db.load_config()?)?;
            println!("{}", serde_json::to_string_pretty(&snapshot.summary())?);
        }
        None => serve(config).await?,
    }

    Ok(())
}
