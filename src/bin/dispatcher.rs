use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;

use ci_fabric::config::Config;
use ci_fabric::dispatcher::Dispatcher;

/// The distributed CI dispatcher: tracks runners, assigns commits, and
/// collects results.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8888)]
    port: u16,

    /// Directory holding one result file per commit.
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Optional TOML file overriding the default timing constants.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn default_results_dir() -> PathBuf {
    ProjectDirs::from("", "", "ci-fabric")
        .map(|dirs| dirs.data_dir().join("results"))
        .unwrap_or_else(|| PathBuf::from("results"))
}

async fn do_main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let results_dir = args.results_dir.unwrap_or_else(default_results_dir);

    let addr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;

    let dispatcher = Dispatcher::new(results_dir, config);
    dispatcher.serve(addr).await?;
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
