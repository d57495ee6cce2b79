use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gymflow::config::Config;
use gymflow::storage::SqliteStorage;

#[derive(Parser)]
#[command(name = "gymflow")]
#[command(about = "Automation core for multi-tenant gym & fitness CRM platforms", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Database maintenance and checks
    Db {
        #[command(subcommand)]
        action: DbActions,
    },
}

#[derive(Subcommand)]
enum DbActions {
    /// Run storage health checks
    Check,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gymflow=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> gymflow::Result<()> {
    let mut config = Config::load();

    match cli.command {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }

            gymflow::metrics::init_metrics();
            gymflow::api::run_server(config).await
        }
        Commands::Db { action } => match action {
            DbActions::Check => {
                let db_path = config.database_path();
                let storage = SqliteStorage::open(&db_path)?;
                let health = storage.health_check().await?;

                println!("database: {}", db_path.display());
                println!("integrity_check: {}", health.integrity_check);
                println!("foreign_keys_enabled: {}", health.foreign_keys_enabled);
                println!("organizations: {}", health.organization_count);
                println!("leads: {}", health.lead_count);
                println!("automations: {}", health.automation_count);

                if health.integrity_check != "ok" {
                    return Err(gymflow::Error::Storage(
                        "integrity check failed".to_string(),
                    ));
                }
                Ok(())
            }
        },
    }
}
