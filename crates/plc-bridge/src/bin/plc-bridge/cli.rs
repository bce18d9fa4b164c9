//! CLI definitions for plc-bridge.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "plc-bridge",
    version,
    about = "Remote automation bridge for a PLC engineering tool",
    after_help = "Examples:\n  plc-bridge                              # serve with bridge.toml / env\n  plc-bridge serve --simulate             # in-memory engineering tool\n  plc-bridge ctl status\n  plc-bridge ctl import Main ./Main.scl"
)]
pub struct Cli {
    /// Bridge configuration file (defaults to $PLC_BRIDGE_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the bridge (default).
    Serve(ServeArgs),
    /// Load and validate the configuration, then print it.
    CheckConfig,
    /// Talk to a running bridge.
    Ctl {
        /// Bridge base URL.
        #[arg(long, default_value = "http://127.0.0.1:5050")]
        url: String,
        /// Per-request deadline sent to the bridge.
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[command(subcommand)]
        action: CtlAction,
    },
}

impl Default for Command {
    fn default() -> Self {
        Self::Serve(ServeArgs::default())
    }
}

#[derive(Debug, Default, Args)]
pub struct ServeArgs {
    /// Listen address (overrides server.listen).
    #[arg(long)]
    pub listen: Option<String>,
    /// Automation host discovery address for attach.
    #[arg(long)]
    pub host_address: Option<String>,
    /// Automation host helper executable launched when nothing is attachable.
    #[arg(long)]
    pub host_command: Option<PathBuf>,
    /// Directory relative project paths resolve against.
    #[arg(long)]
    pub project_dir: Option<PathBuf>,
    /// Use the in-memory engineering tool instead of a real host.
    #[arg(long, action = ArgAction::SetTrue)]
    pub simulate: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CtlAction {
    /// Show bridge status.
    Status,
    /// Attach to or launch the engineering tool.
    Connect {
        /// Launch without UI when nothing is attachable.
        #[arg(long, action = ArgAction::SetTrue)]
        headless: bool,
    },
    /// Open a project.
    Open { path: String },
    /// Show the open project's name, path and block count.
    Info,
    /// List program blocks.
    Blocks,
    /// Import source text from a file into a block.
    Import { block: String, file: PathBuf },
    /// Export a block's source text.
    Export {
        block: String,
        /// Write the source to a file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Compile a block.
    Compile { block: String },
    /// Close the open project.
    Close,
    /// Release the engineering tool.
    Disconnect,
    /// Show recent session events.
    Events {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}
