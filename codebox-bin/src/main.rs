//! codebox command line

use clap::{Parser, Subcommand};
use codebox_common::OwnerId;
use codebox_executor::archive::{self, DEFAULT_MANIFEST_NAME};
use codebox_executor::{CodeboxConfig, DockerRuntime, FsSnapshotStore, IdleReaper, LifecycleManager};
use color_eyre::eyre::{self, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codebox")]
#[command(about = "Per-owner dev containers with idle shutdown", long_about = None)]
struct Cli {
    /// YAML configuration file, overrides CODEBOX_* variables
    #[arg(short, long, env = "CODEBOX_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull images and shut down idle containers until interrupted
    Serve,
    /// Make sure the owner's container is running and print its URL
    Start {
        owner: OwnerId,
    },
    /// Save the files of the owner's running container to the snapshot store
    Flush {
        owner: OwnerId,
    },
    /// Print the IDE URL of an owner
    Url {
        owner: OwnerId,
    },
    /// Convert an uploaded file into a snapshot tar
    Ingest {
        file: PathBuf,
        /// Where to write the tar
        #[arg(short, long)]
        output: PathBuf,
        /// Name the upload had on the client, defaults to the file name
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the manifest contained in a snapshot tar
    Manifest {
        snapshot: PathBuf,
        #[arg(long, default_value = DEFAULT_MANIFEST_NAME)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,codebox=debug,codebox_executor=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CodeboxConfig::from_yaml_file(path)?,
        None => CodeboxConfig::from_env()?,
    };

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Start { owner } => {
            let handle = lifecycle(&config)?.ensure_running(&owner).await?;
            info!(container_id = %handle.container_id, created = handle.created, "Container ready");
            println!("{}", handle.url);
            Ok(())
        }
        Commands::Flush { owner } => {
            lifecycle(&config)?.save_files(&owner).await?;
            println!("Saved files of {owner}");
            Ok(())
        }
        Commands::Url { owner } => {
            println!("{}", lifecycle(&config)?.access_url(&owner));
            Ok(())
        }
        Commands::Ingest { file, output, name } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| eyre::eyre!("{} has no file name", file.display()))?,
            };
            let tar = tokio::task::spawn_blocking(move || archive::ingest_upload(&name, &file))
                .await??;
            tokio::fs::write(&output, &tar)
                .await
                .wrap_err_with(|| format!("writing {}", output.display()))?;
            println!("Wrote {} bytes to {}", tar.len(), output.display());
            Ok(())
        }
        Commands::Manifest { snapshot, name } => {
            let file = std::fs::File::open(&snapshot)
                .wrap_err_with(|| format!("opening {}", snapshot.display()))?;
            let manifest: serde_yaml::Value =
                archive::require_manifest(std::io::BufReader::new(file), &name)?;
            print!("{}", serde_yaml::to_string(&manifest)?);
            Ok(())
        }
    }
}

fn lifecycle(config: &CodeboxConfig) -> eyre::Result<Arc<LifecycleManager>> {
    let runtime = DockerRuntime::connect_local()?;
    let store = FsSnapshotStore::new(config.lifecycle.snapshot_dir.clone());
    Ok(Arc::new(LifecycleManager::new(
        Arc::new(runtime),
        Arc::new(store),
        config.lifecycle.clone(),
    )))
}

async fn serve(config: CodeboxConfig) -> eyre::Result<()> {
    info!("Starting codebox...");
    let manager = lifecycle(&config)?;
    manager
        .ensure_images()
        .await
        .wrap_err("preparing container images")?;

    let cancel = CancellationToken::new();
    let reaper = Arc::new(IdleReaper::with_connection_probe(
        manager.clone(),
        config.reaper.clone(),
    ));
    let reaper_handle = reaper.spawn(cancel.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for the running sweep to finish");
    cancel.cancel();
    reaper_handle.await?;
    info!("codebox stopped");
    Ok(())
}
