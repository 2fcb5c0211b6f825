//! testbed - isolation engine manager
//!
//! Loads and validates a manager configuration, brings the engines up,
//! reports what each can enforce, and shuts down cleanly.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use testbed_core::{init, IsolationManager, ManagerConfig};
use tracing::{info, warn};

fn print_help() {
    println!("testbed - isolated execution environments v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  testbed [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config FILE  Load manager configuration from a JSON file");
    println!("  -h, --help         Print this help message");
    println!("  -v, --version      Print version information");
    println!();
    println!("ENVIRONMENT:");
    println!("  RUST_LOG           Log filter (default: info)");
}

fn parse_args() -> Result<Option<Option<PathBuf>>> {
    let mut config = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("testbed {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "-c" | "--config" => match args.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("'{arg}' requires a file argument"),
            },
            other => bail!("unrecognized argument '{other}'; run 'testbed --help' for usage"),
        }
    }
    Ok(Some(config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(config_path) = parse_args()? else {
        return Ok(());
    };

    init()?;

    let config = match &config_path {
        Some(path) => ManagerConfig::load(path)
            .with_context(|| format!("invalid configuration in {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    let manager = IsolationManager::new(config).context("failed to start isolation manager")?;

    for (kind, capability) in manager.capabilities() {
        info!(
            kind = %kind,
            resource_limits = capability.supports_resource_limits,
            networking = capability.supports_networking,
            private_network = capability.supports_private_network,
            cost = capability.relative_cost_weight,
            "Engine available"
        );
    }

    for residual in manager.shutdown().await {
        warn!(error = %residual, "Residual resources at shutdown");
    }
    info!("Testbed stopped");
    Ok(())
}
