//! SensorHub daemon - main entry point
//!
//! Runs node discovery, camera discovery and the capture loops over the real
//! serial ports and camera worker until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sensorhub_core::{HubConfig, SetupRecord};
use sensorhub_hardware::{ProcessLauncher, SystemSerial};
use sensorhub_runtime::HubRuntime;
use sensorhub_runtime::store::{DirectoryStillWriter, MemoryStore, Store};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sensorhub")]
#[command(about = "SensorHub sensor node and camera runtime")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "sensorhub.toml")]
    config: PathBuf,

    /// Log level, overridden by RUST_LOG
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all loops until Ctrl-C (default)
    Run {
        /// JSON file with the setups to serve
        #[arg(long)]
        setups: Option<PathBuf>,

        /// Directory receiving captured stills
        #[arg(long, default_value = "data/photos")]
        photos: PathBuf,
    },
    /// List serial ports that look like sensor nodes
    Ports,
    /// Run a single node and camera scan and exit
    ScanOnce,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load_config(path: &Path) -> Result<HubConfig> {
    let mut config = HubConfig::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn launcher(config: &HubConfig) -> ProcessLauncher {
    match ProcessLauncher::from_config(&config.camera) {
        Ok(launcher) => launcher,
        Err(e) => {
            let fallback = config
                .camera
                .worker_candidates
                .first()
                .cloned()
                .unwrap_or_else(|| PathBuf::from("camera_worker"));
            warn!(error = %e, path = %fallback.display(), "Camera worker not found, cameras stay offline");
            ProcessLauncher::new(fallback)
        }
    }
}

fn load_setups(store: &MemoryStore, path: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let setups: Vec<SetupRecord> = serde_json::from_str(&text)
        .with_context(|| format!("invalid setups in {}", path.display()))?;
    let count = setups.len();
    for setup in setups {
        store.insert_setup(setup);
    }
    Ok(count)
}

fn build_runtime(
    config: HubConfig,
    store: Arc<MemoryStore>,
    photos: PathBuf,
) -> Result<HubRuntime<SystemSerial, ProcessLauncher>> {
    let launcher = launcher(&config);
    let runtime = HubRuntime::new(
        config,
        SystemSerial,
        launcher,
        store as Arc<dyn Store>,
        Arc::new(DirectoryStillWriter::new(photos)),
    )?;
    Ok(runtime)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("SensorHub v{}", sensorhub_core::VERSION);
    let config = load_config(&args.config)?;
    let store = Arc::new(MemoryStore::new());

    match args.command.unwrap_or(Command::Run {
        setups: None,
        photos: PathBuf::from("data/photos"),
    }) {
        Command::Run { setups, photos } => {
            if let Some(path) = setups {
                let count = load_setups(&store, &path)?;
                info!(count, path = %path.display(), "Setups loaded");
            }
            let runtime = build_runtime(config, store, photos)?;
            runtime.start_loops();

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            let health = runtime.health().await;
            info!(
                workers = health.camera.worker_count,
                nodes = health.nodes_connected,
                "Final state"
            );
            runtime.shutdown().await;
        }
        Command::Ports => {
            let runtime = build_runtime(config, store, PathBuf::from("data/photos"))?;
            let ports = runtime.nodes().list_serial_ports()?;
            println!("Found {} node port(s):", ports.len());
            for port in ports {
                println!(
                    "  - {} {}",
                    port.port_name,
                    port.description.as_deref().unwrap_or_default()
                );
                if let Some(hwid) = &port.hwid {
                    println!("    {hwid}");
                }
            }
        }
        Command::ScanOnce => {
            let runtime = build_runtime(config, Arc::clone(&store), PathBuf::from("data/photos"))?;
            let nodes = runtime.nodes().scan_nodes_once().await?;
            println!("Nodes online: {}", nodes.len());
            for key in runtime.nodes().connected_keys() {
                let fw = store
                    .node(&key)
                    .and_then(|node| node.fw)
                    .unwrap_or_else(|| "?".to_string());
                println!("  - {key} (fw {fw})");
            }

            let cameras = runtime.discovery().scan_once().await?;
            println!("Cameras online: {}", cameras.len());
            for camera in cameras {
                println!(
                    "  - {} {} [{}]",
                    camera.camera_id,
                    camera.friendly_name.as_deref().unwrap_or_default(),
                    camera.pnp_device_id.as_deref().unwrap_or_default()
                );
            }
            runtime.shutdown().await;
        }
    }

    Ok(())
}
