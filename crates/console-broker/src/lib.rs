use std::path::PathBuf;

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};

pub mod broker;
pub mod config;
pub mod endpoint;
pub mod history;
pub mod protocol;
pub mod session;
pub mod viewer;

mod commands;

pub use broker::{Broker, BrokerOptions, BrokerState, ListenerFactory, MAX_SESSIONS};
pub use config::{BrokerConfig, DEFAULT_MAX_LINES};
pub use protocol::{CounterSpec, HighlightSpec, Level, Record, Style, level_of};
pub use viewer::Viewer;

/// Console broker - stream a process's output to local viewers.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None, bin_name = "console-broker")]
pub struct Cli {
  /// Config file (defaults to the XDG config `console-broker/console.toml`)
  #[arg(long, global = true)]
  config: Option<PathBuf>,
  #[command(subcommand)]
  command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
  /// Read lines from stdin and serve them to viewers
  Serve(ServeArgs),
  /// Attach to a running broker and print its output
  Tail(TailArgs),
  /// Print the config file path and socket candidates
  Paths,
}

#[derive(Debug, ClapArgs)]
struct ServeArgs {
  /// Socket path to bind (repeatable, tried in order; replaces the defaults)
  #[arg(long = "socket")]
  sockets: Vec<PathBuf>,
  /// Do not echo stdin to stdout
  #[arg(long, short)]
  quiet: bool,
}

#[derive(Debug, ClapArgs)]
struct TailArgs {
  /// Socket path to dial (defaults to the first existing candidate)
  #[arg(long)]
  socket: Option<PathBuf>,
}

pub fn parse() -> Cli {
  Cli::parse()
}

pub fn run() -> Result<()> {
  let cli = parse();
  let cfg = config::load_config(cli.config.as_deref())?;

  match cli.command {
    Commands::Serve(args) => commands::serve::run(&cfg, args.sockets, args.quiet),
    Commands::Tail(args) => commands::tail::run(&cfg, args.socket.as_deref()),
    Commands::Paths => commands::paths::run(&cfg),
  }
}
