use anyhow::Result;
use clap::{Parser, Subcommand};
use observability_backup::application::*;
use observability_backup::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "obs-backup")]
#[command(about = "Backup and restore orchestration for observability components")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every scheduled backup definition until SIGINT/SIGTERM
    Daemon,
    /// Run one backup of a lineage now
    Run {
        #[arg(long)]
        lineage: String,
    },
    /// Restore a committed backup
    Restore {
        #[arg(long)]
        backup_id: String,
        /// Restore only these components (repeatable)
        #[arg(long = "component")]
        components: Vec<String>,
    },
    /// Download and check a committed backup without importing it
    Verify {
        #[arg(long)]
        backup_id: String,
    },
    /// List catalog records of a lineage, newest first
    List {
        #[arg(long)]
        lineage: String,
    },
    /// Apply the retention policy of a lineage
    Prune {
        #[arg(long)]
        lineage: String,
    },
    /// Compare catalog records with stored objects
    Reconcile {
        #[arg(long)]
        lineage: String,
    },
    /// Print metrics in Prometheus text format
    Metrics,
    /// Print the effective configuration
    Config,
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.operational.log_level.clone()));

    if config.operational.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env()?;
    init_logging(&config);

    if let Commands::Config = cli.command {
        println!("{}", config.create_diagnostic_report());
        return Ok(());
    }

    let app = Application::new(config).await?;
    app.initialize().await?;

    match cli.command {
        Commands::Daemon => {
            let handler = DaemonCommandHandler::new(app.container.clone(), app.lifecycle.clone());
            handler.run().await
        }
        Commands::Run { lineage } => {
            let handler = BackupCommandHandler::new(app.container.clone());
            handler.run(&lineage).await
        }
        Commands::Restore {
            backup_id,
            components,
        } => {
            let handler = RestoreCommandHandler::new(app.container.clone());
            handler.restore(&backup_id, components).await
        }
        Commands::Verify { backup_id } => {
            let handler = RestoreCommandHandler::new(app.container.clone());
            handler.verify(&backup_id).await
        }
        Commands::List { lineage } => {
            let handler = BackupCommandHandler::new(app.container.clone());
            handler.list(&lineage).await
        }
        Commands::Prune { lineage } => {
            let handler = BackupCommandHandler::new(app.container.clone());
            handler.prune(&lineage).await
        }
        Commands::Reconcile { lineage } => {
            let handler = BackupCommandHandler::new(app.container.clone());
            handler.reconcile(&lineage).await
        }
        Commands::Metrics => {
            let handler = BackupCommandHandler::new(app.container.clone());
            handler.metrics()
        }
        Commands::Config => Ok(()),
    }
}
