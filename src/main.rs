#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use balanced::bootstrap;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "balanced", about = "Annotation-driven ingress controller")]
struct Cli {
    /// Path to controller config file
    #[arg(short, long, default_value = "balanced.toml")]
    config: PathBuf,

    /// Metrics listen address (Prometheus exposition)
    #[arg(long, default_value = "0.0.0.0:9091")]
    metrics_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        config_path: cli.config,
        metrics_listen: cli.metrics_listen,
    }))
}
