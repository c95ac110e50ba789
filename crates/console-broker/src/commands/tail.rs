use std::path::Path;

use anyhow::{Result, bail};
use log::debug;
use owo_colors::OwoColorize as _;

use crate::config::{ConsoleConfig, socket_candidates};
use crate::protocol::{Level, Record};
use crate::viewer::Viewer;

/// Prints everything a broker sends until it closes the session.
pub fn run(cfg: &ConsoleConfig, socket: Option<&Path>) -> Result<()> {
  super::init_logging();

  let viewer = match socket {
    Some(path) => Viewer::connect(path)?,
    None => Viewer::connect_first(&socket_candidates(cfg))?,
  };
  debug!("Attached to {}", viewer.path().display());

  for record in viewer {
    match record {
      Record::Meta(meta) => debug!(
        "Broker keeps {} lines; {} counter(s), {} highlight(s)",
        meta.max_lines,
        meta.counters.len(),
        meta.highlights.len()
      ),
      Record::Line(line) => match line.level {
        Level::Error => anstream::println!("{}", line.text.red()),
        Level::Info => anstream::println!("{}", line.text),
      },
      Record::Notice(notice) => anstream::eprintln!("{}", notice.text.yellow()),
    }
  }
  bail!("disconnected from console broker")
}
