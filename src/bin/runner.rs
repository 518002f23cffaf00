use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use ci_fabric::config::Config;
use ci_fabric::runner::Runner;

/// A test runner: executes the update and test hooks for whatever
/// commit the dispatcher assigns, and posts the results back.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    repo_path: PathBuf,

    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = 0)]
    port: u16,

    #[arg(long)]
    dispatcher_server: String,

    #[arg(long, default_value = "./scripts/update_to_commit.sh")]
    update_script: PathBuf,

    #[arg(long, default_value = "./scripts/run_tests.sh")]
    test_script: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,
}

async fn do_main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let bind_addr = format!("{}:{}", "0.0.0.0", args.port)
        .parse()
        .context("invalid bind address")?;

    let runner = Runner::new(
        args.repo_path,
        args.host,
        args.dispatcher_server,
        args.update_script,
        args.test_script,
        config,
    );
    runner.serve(bind_addr).await?;
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
