//! # CLI Interface
//!
//! Command-line arguments for `murk-node`, via `clap` derive. Four
//! subcommands: `init`, `inspect`, `bootstrap` and `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Operator tooling for murk relays and clients.
///
/// Creates router keys and signed contacts, checks contact files, and bundles
/// relay contacts into bootstrap lists.
#[derive(Parser, Debug)]
#[command(
    name = "murk-node",
    about = "Operator tooling for murk relays and clients",
    version,
    propagate_version = true
)]
pub struct MurkNodeCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "MURK_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create router keys in a data directory and, for relays, sign and
    /// write the router's contact.
    Init(InitArgs),
    /// Decode a contact or bootstrap file and verify every contact in it.
    Inspect(InspectArgs),
    /// Bundle contact files into one bootstrap list.
    Bootstrap(BootstrapArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Router data directory. Created if missing.
    #[arg(long, short = 'd', env = "MURK_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// JSON router config. Flags given on the command line take precedence.
    #[arg(long, short = 'c', env = "MURK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Publicly reachable address. Setting it makes this a relay and writes
    /// a signed contact.
    #[arg(long, env = "MURK_PUBLIC_ADDR")]
    pub public_addr: Option<SocketAddr>,

    #[arg(long, env = "MURK_NICKNAME")]
    pub nickname: Option<String>,

    #[arg(long, env = "MURK_NETID")]
    pub netid: Option<String>,
}

#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// A signed contact, or a JSON list of them.
    pub file: PathBuf,

    #[arg(long, env = "MURK_NETID", default_value = murk_router::config::DEFAULT_NETID)]
    pub netid: String,
}

#[derive(Parser, Debug)]
pub struct BootstrapArgs {
    /// Contact or bootstrap files to bundle.
    #[arg(required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// Where to write the bundled list.
    #[arg(long, short = 'o', default_value = murk_router::config::DEFAULT_BOOTSTRAP_FILE)]
    pub out: PathBuf,

    #[arg(long, env = "MURK_NETID", default_value = murk_router::config::DEFAULT_NETID)]
    pub netid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}
