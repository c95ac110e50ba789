use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;

use crate::broker::{Broker, BrokerOptions};
use crate::config::{ConsoleConfig, socket_candidates};

/// Serves stdin to viewers until EOF.
pub fn run(cfg: &ConsoleConfig, sockets: Vec<PathBuf>, quiet: bool) -> Result<()> {
  super::init_logging();
  #[cfg(debug_assertions)]
  spawn_deadlock_check();

  let candidates = if sockets.is_empty() {
    socket_candidates(cfg)
  } else {
    sockets
  };
  let broker = Broker::new(BrokerOptions {
    config: cfg.broker.clone(),
    socket_candidates: candidates,
    ..Default::default()
  })?;
  broker.start()?;

  let stdin = std::io::stdin();
  let mut stdout = anstream::stdout();
  let mut result = Ok(());
  for line in stdin.lock().lines() {
    let line = match line.context("read stdin") {
      Ok(line) => line,
      Err(e) => {
        result = Err(e);
        break;
      }
    };
    let line = line.strip_suffix('\r').unwrap_or(&line);
    if !quiet {
      let _ = writeln!(stdout, "{line}");
    }
    broker.append(line);
  }

  info!("Input closed; stopping broker");
  broker.stop();
  result
}

/// Debug-only watchdog reporting lock cycles between producer and sessions.
#[cfg(debug_assertions)]
fn spawn_deadlock_check() {
  let _ = std::thread::Builder::new()
    .name("deadlock-check".to_string())
    .spawn(|| {
      loop {
        std::thread::sleep(std::time::Duration::from_millis(200));
        let deadlocks = parking_lot::deadlock::check_deadlock();
        if !deadlocks.is_empty() {
          log::error!("Deadlock detected: {} cycles", deadlocks.len());
        }
      }
    });
}
