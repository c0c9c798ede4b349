//! gpulink - GPU device selection and interop inspection CLI

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use gpulink_core::RenderApi;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// Env var with the tracing filter (falls back to `RUST_LOG`).
const LOG_ENV: &str = "GPULINK_LOG";

#[derive(Parser)]
#[command(name = "gpulink")]
#[command(author, version, about = "GPU device selection and interop inspection")]
#[command(long_about = "
Lists the GPUs a rendering API sees, manages the persisted device selection
and reports which compute device shares memory with the selected GPU.

Examples:
  gpulink devices                         # Vulkan devices with identities
  gpulink devices --manifest rig.json     # Replay a recorded device set
  gpulink hash                            # System configuration hash
  gpulink status                          # Persisted selection and validity
  gpulink select 2                        # Persist the second device
  gpulink select default                  # Clear the selection
  gpulink peer --compute cuda             # CUDA peer of the selected device
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List suitable devices
    #[command(visible_alias = "ls")]
    Devices(DevicesArgs),

    /// Print the system configuration hash
    Hash(HashArgs),

    /// Show the persisted selection and whether it still applies
    Status(StatusArgs),

    /// Persist a device choice
    Select(SelectArgs),

    /// Find the compute device that shares memory with the selected device
    Peer(PeerArgs),

    /// Show compiled-in backends
    Backends,
}

/// Where devices come from.
#[derive(Args, Clone)]
struct DeviceArgs {
    /// Rendering API: vulkan, d3d12
    #[arg(long, default_value = "vulkan")]
    api: RenderApi,

    /// Device manifest (JSON) to use instead of the native enumerator
    #[arg(long)]
    manifest: Option<PathBuf>,
}

/// Settings document location.
#[derive(Args, Clone)]
struct SettingsArgs {
    /// Settings file (default: $GPULINK_SETTINGS or the user config dir)
    #[arg(long)]
    settings: Option<PathBuf>,
}

/// Arguments for the `devices` command.
#[derive(Args)]
struct DevicesArgs {
    #[command(flatten)]
    device: DeviceArgs,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Arguments for the `hash` command.
#[derive(Args)]
struct HashArgs {
    #[command(flatten)]
    device: DeviceArgs,
}

/// Arguments for the `status` command.
#[derive(Args)]
struct StatusArgs {
    #[command(flatten)]
    device: DeviceArgs,

    #[command(flatten)]
    settings: SettingsArgs,
}

/// Arguments for the `select` command.
#[derive(Args)]
struct SelectArgs {
    /// Menu index (1-based device index) or `default`
    choice: String,

    #[command(flatten)]
    device: DeviceArgs,

    #[command(flatten)]
    settings: SettingsArgs,
}

/// Arguments for the `peer` command.
#[derive(Args)]
struct PeerArgs {
    #[command(flatten)]
    device: DeviceArgs,

    #[command(flatten)]
    settings: SettingsArgs,

    /// Compute API: cuda, hip, sycl
    #[arg(long, default_value = "cuda")]
    compute: String,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Devices(args) => commands::devices::run(args, cli.verbose),
        Commands::Hash(args) => commands::hash::run(args),
        Commands::Status(args) => commands::status::run(args),
        Commands::Select(args) => commands::select::run(args),
        Commands::Peer(args) => commands::peer::run(args),
        Commands::Backends => {
            print!("{}", commands::describe_all());
            Ok(())
        }
    }
}
