use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use storyteller::auth;
use storyteller::config::Config;
use storyteller::db::StorytellerDb;
use storyteller::server;

#[derive(Parser)]
#[command(name = "storyteller")]
#[command(version, about = "GitHub repository analysis and narrative generation service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS for a local frontend dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Create a user account
    CreateUser {
        username: String,
        password: String,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("storyteller=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(db_path) = db_path {
                config.db_path = db_path;
            }
            config.dev_mode = dev;
            server::start_server(config).await
        }
        Commands::CreateUser {
            username,
            password,
            db_path,
        } => {
            if let Some(db_path) = db_path {
                config.db_path = db_path;
            }
            if let Some(parent) = config.db_path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
            let db = StorytellerDb::new(&config.db_path)
                .context("Failed to initialize database")?;
            let hashed = auth::hash_password(&password);
            let user = db
                .create_user(&username, &hashed)
                .context("Failed to create user")?;
            println!("Created user {} (id {})", user.username, user.id);
            Ok(())
        }
    }
}
