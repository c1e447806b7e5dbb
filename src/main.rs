use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rdfc::{
    config::{ConfigManager, EnvConfigManager, OrchestratorConfig},
    logger::{LogConfig, init_tracing},
    orchestrator::{Orchestrator, load_pipeline},
    processors::register_builtins,
};
use rdfc_processor::processor::ProcessorRegistry;
use std::{path::PathBuf, process};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "rdfc",
    about = "Run streaming RDF-Connect pipelines",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// `.env` file with RDFC_* settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    /// Also write JSON logs when RDFC_LOG_DIR is set
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline until every stage finished
    Exec { pipeline: PathBuf },

    /// Resolve the dependencies of a pipeline
    Install { pipeline: PathBuf },

    /// Check a pipeline without running it
    Validate { pipeline: PathBuf },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_mgr = ConfigManager(EnvConfigManager::new(Some(cli.global.env_file.clone())));
    let mut config = OrchestratorConfig::load(&config_mgr).await?;
    if let Some(level) = cli.global.log_level {
        config.log_level = level;
    }
    let log_guard = init_tracing(&LogConfig::from(&config).json(cli.global.json_logs))
        .context("could not set up logging")?;

    let registry = ProcessorRegistry::new();
    register_builtins(&registry);

    match cli.command {
        Commands::Validate { pipeline } => {
            let ir = load_pipeline(&pipeline).await?;
            Orchestrator::new(ir, registry, config).validate()?;
            println!("✅ Pipeline is valid.");
            Ok(())
        }
        Commands::Install { pipeline } => {
            let ir = load_pipeline(&pipeline).await?;
            let packages = Orchestrator::new(ir, registry, config).install().await?;
            for pkg in packages {
                println!("{} -> {}", pkg.uri, pkg.index.display());
            }
            Ok(())
        }
        Commands::Exec { pipeline } => {
            let ir = load_pipeline(&pipeline).await?;
            info!("rdfc starting pipeline {}", ir.uri);

            let shutdown = async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Ctrl-C received, shutting down"),
                    Err(e) => {
                        error!("cannot listen for Ctrl-C: {e}");
                        std::future::pending::<()>().await
                    }
                }
            };
            match Orchestrator::new(ir, registry, config).exec_until(shutdown).await {
                Ok(report) => {
                    info!(
                        stages = report.stages.len(),
                        started = %report.started_at,
                        elapsed = ?report.elapsed,
                        "pipeline {} finished",
                        report.pipeline
                    );
                    Ok(())
                }
                Err(e) => {
                    error!("{e:#}");
                    for stage in e.failed_stages() {
                        eprintln!("failed: {stage}");
                    }
                    drop(log_guard);
                    process::exit(1);
                }
            }
        }
    }
}
