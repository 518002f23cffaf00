use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use ci_fabric::config::Config;
use ci_fabric::runner_manager::RunnerManager;

/// Maintains a target number of live test-runner processes.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    repo_path: PathBuf,

    #[arg(long)]
    dispatcher_server: String,

    #[arg(long, default_value_t = 1)]
    desired_count: usize,

    #[arg(long, default_value = "ci-runner")]
    runner_bin: PathBuf,

    #[arg(long)]
    check_interval: Option<u64>,

    #[arg(long)]
    config: Option<PathBuf>,
}

async fn do_main() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(secs) = args.check_interval {
        config.runner_pool_check_interval_secs = secs;
    }

    let manager = RunnerManager::new(
        args.repo_path,
        args.dispatcher_server,
        args.runner_bin,
        args.desired_count,
        config,
    );
    manager.run().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = do_main().await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
