// ABOUTME: upswarm CLI entry point.
// ABOUTME: Provides init, serve, and spawn subcommands.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use upswarm_core::{run_worker, ServiceCatalog, Supervisor, SupervisorConfig, WorkerOptions};

#[derive(Parser)]
#[command(name = "upswarm")]
#[command(about = "Process supervisor and message bus for service swarms")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the supervisor daemon
    Serve {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on
        #[arg(long, env = "UPSWARM_PORT")]
        port: Option<u16>,
        /// Topology file to watch
        #[arg(long, env = "UPSWARM_TOPOLOGY")]
        topology: Option<String>,
    },
    /// Run a single service instance (internal, spawned by the supervisor)
    Spawn {
        /// Service name
        service: String,
        /// Supervisor address
        #[arg(long, default_value = "127.0.0.1:8300")]
        supervisor: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { config, force } => {
            let path = config.unwrap_or_else(SupervisorConfig::default_path);
            run_init(&path, force)
        }
        Commands::Serve {
            config,
            port,
            topology,
        } => {
            upswarm_log::init();
            let path = config.unwrap_or_else(SupervisorConfig::default_path);
            let mut config = SupervisorConfig::load_or_default(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            if let Some(port) = port {
                config.port = port;
            }
            if topology.is_some() {
                config.topology_path = topology;
            }
            run_serve(config).await
        }
        Commands::Spawn {
            service,
            supervisor,
        } => {
            upswarm_log::init_worker();
            run_worker(WorkerOptions {
                service: service.clone(),
                supervisor,
                catalog: ServiceCatalog::builtin(),
            })
            .await
            .with_context(|| format!("service '{service}' failed"))
        }
    }
}

fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    SupervisorConfig::default()
        .save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn run_serve(config: SupervisorConfig) -> Result<()> {
    let addr = config.bind_addr();
    if config.topology_path.is_none() {
        tracing::warn!("No topology file configured, nothing will be spawned automatically");
    }
    let supervisor = Supervisor::bind(config)
        .await
        .with_context(|| format!("binding {addr}"))?;
    supervisor.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_spawn_defaults_supervisor_address() {
        let cli = Cli::try_parse_from(["upswarm", "spawn", "mailer"]).unwrap();
        match cli.command {
            Commands::Spawn {
                service,
                supervisor,
            } => {
                assert_eq!(service, "mailer");
                assert_eq!(supervisor, "127.0.0.1:8300");
            }
            _ => panic!("expected spawn"),
        }
    }

    #[test]
    fn test_parse_matches_default_worker_args() {
        // The supervisor spawns workers with exactly this shape.
        let args = ["upswarm", "spawn", "echo", "--supervisor", "127.0.0.1:9000"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Spawn { ref supervisor, .. } if supervisor == "127.0.0.1:9000"
        ));
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upswarm.toml");

        run_init(&path, false).unwrap();
        assert_eq!(
            SupervisorConfig::load(&path).unwrap(),
            SupervisorConfig::default()
        );
        assert!(run_init(&path, false).is_err());
        run_init(&path, true).unwrap();
    }
}
