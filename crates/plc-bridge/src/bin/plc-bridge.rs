//! CLI entrypoint for the automation bridge.

#[path = "plc-bridge/cli.rs"]
mod cli;
#[path = "plc-bridge/ctl.rs"]
mod ctl;
#[path = "plc-bridge/run.rs"]
mod run;

use clap::Parser;

use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or_default() {
        Command::Serve(args) => run::run_serve(cli.config, args),
        Command::CheckConfig => run::run_check_config(cli.config),
        Command::Ctl {
            url,
            timeout_ms,
            action,
        } => ctl::run_ctl(&url, timeout_ms, action),
    }
}
