use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use ci_fabric::config::Config;
use ci_fabric::observer::Observer;

/// Polls a working copy and notifies the dispatcher of new commits.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    repo_path: PathBuf,

    #[arg(long)]
    dispatcher_server: String,

    #[arg(long)]
    poll_interval: Option<u64>,

    #[arg(long, default_value = "./scripts/poll_for_new_commit.sh")]
    update_script: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,
}

async fn do_main() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(secs) = args.poll_interval {
        config.poll_interval_secs = secs;
    }

    let observer = Observer::new(args.repo_path, args.dispatcher_server, args.update_script, config);
    observer.run().await;
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
