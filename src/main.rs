#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use yaim::daemon;

#[derive(Parser)]
#[command(name = "yaim", version, about = "Distributed virtual-IP coordinator")]
struct Cli {
    /// Path to the configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(daemon::bootstrap::run(daemon::bootstrap::BootstrapArgs {
        config_path: cli.config,
    }))
}
