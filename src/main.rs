use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mapvault::config::ServerConfig;
use mapvault::notify::StoreNotifier;
use mapvault::pipeline::{JobDeps, JobQueue};
use mapvault::server::{AppState, create_router};
use mapvault::storage::{FsObjectStorage, Presigner};
use mapvault::store::{SqliteStore, Store};

#[cfg(unix)]
fn set_restrictive_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to set permissions on {}: {e}", path.display());
    }
}

#[derive(Parser)]
#[command(name = "mapvault")]
#[command(about = "A geospatial dataset catalog and tile server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve {
        /// TOML configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long, short)]
        port: Option<u16>,

        /// Data directory for the database and stored objects
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Public base URL for external access (e.g., "https://maps.example.com").
        /// Presigned storage URLs point here.
        #[arg(long)]
        public_base_url: Option<String>,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Initialize the server (create database and presign secret)
    Init {
        /// Data directory for the database and stored objects
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },

    /// Recompute the node closure table from parent links
    RebuildClosure {
        /// Data directory for the database and stored objects
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
}

fn run_init(data_dir: PathBuf) -> anyhow::Result<()> {
    let config = ServerConfig {
        data_dir,
        ..Default::default()
    };
    fs::create_dir_all(&config.data_dir)?;
    fs::create_dir_all(config.storage_dir())?;

    let secret_file = config.presign_secret_path();
    if secret_file.exists() {
        bail!(
            "Server already initialized. Presign secret exists at: {}",
            secret_file.display()
        );
    }

    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;

    let secret = hex::encode(rand::random::<[u8; 32]>());
    fs::write(&secret_file, &secret)?;

    #[cfg(unix)]
    set_restrictive_permissions(&secret_file);

    println!("Initialized database at {}", config.db_path().display());
    println!("Presign secret written to: {}", secret_file.display());

    Ok(())
}

fn run_rebuild_closure(data_dir: PathBuf) -> anyhow::Result<()> {
    let config = ServerConfig {
        data_dir,
        ..Default::default()
    };
    if !config.db_path().exists() {
        bail!("Server not initialized. Run 'mapvault admin init' first.");
    }

    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;
    let edges = store.rebuild_closure()?;
    println!("Rebuilt closure table: {edges} edges");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mapvault=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { command } => match command {
            AdminCommands::Init { data_dir } => run_init(data_dir)?,
            AdminCommands::RebuildClosure { data_dir } => run_rebuild_closure(data_dir)?,
        },
        Commands::Serve {
            config,
            host,
            port,
            data_dir,
            public_base_url,
        } => {
            let mut config = match config {
                Some(path) => ServerConfig::load(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if public_base_url.is_some() {
                config.public_base_url = public_base_url;
            }

            if !config.db_path().exists() {
                bail!(
                    "Server not initialized. Run 'mapvault admin init' first to create the database and presign secret."
                );
            }

            let store: Arc<dyn Store> = Arc::new(SqliteStore::new(config.db_path())?);
            store.initialize()?;

            let presigner = Presigner::new(
                config.resolve_presign_secret()?,
                config.base_url(),
                config.presign_ttl_secs,
            );
            let storage = Arc::new(FsObjectStorage::new(
                config.storage_dir(),
                config.bucket.clone(),
                presigner.clone(),
            ));
            let notifier = Arc::new(StoreNotifier::new(store.clone()));

            let queue = JobQueue::for_cog_jobs(
                JobDeps {
                    store: store.clone(),
                    storage: storage.clone(),
                    notifier,
                },
                config.job.retry_policy(),
                config.job.concurrency,
            );
            info!(
                concurrency = config.job.concurrency,
                max_retries = config.job.max_retries,
                "COG job queue started"
            );

            let state = Arc::new(AppState::new(store, storage, presigner, Arc::new(queue)));

            let app = create_router(state);
            let addr = config.socket_addr()?;

            info!("Starting server on {}", addr);

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
