use anyhow::Result;
use clap::Parser;
use colored::Colorize;

mod cleanup;
mod config;
mod image;
mod loopdev;
mod orchestrate;
mod plan;
mod probe;
mod ptable;
mod resize;
mod runner;
mod sync;

use cleanup::CleanupStack;
use config::{Cli, FileConfig, RunConfig};
use runner::SystemRunner;

fn main() {
    let cli = Cli::parse();
    if let Err(e) = try_main(cli) {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn try_main(cli: Cli) -> Result<()> {
    config::ensure_root()?;
    let file = FileConfig::load()?;
    let cfg = RunConfig::build(cli, file)?;

    // Constructing the runner extends PATH with the sbin directories, so the
    // tool check sees the same search path the commands will.
    let runner = SystemRunner::new(cfg.debug);
    runner::check_tools(runner::REQUIRED_TOOLS)?;
    if cfg.resize {
        runner::check_tools(runner::RESIZE_TOOLS)?;
    }

    let cleanup = CleanupStack::new();
    cleanup.install_signal_handler(cfg.debug)?;

    let result = orchestrate::run(&cfg, &runner, &cleanup);
    if result.is_err() {
        // Release whatever the failed run left behind.
        cleanup.run(&runner);
    }
    result
}
