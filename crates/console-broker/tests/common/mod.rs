#![allow(dead_code)]
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use console_broker::protocol::{LineRecord, Meta, Record};
use console_broker::{Broker, BrokerConfig, BrokerOptions, Viewer};
use tempfile::TempDir;

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Temp directory holding the broker socket for one test.
pub struct TestEnv {
  temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = tempfile::Builder::new()
      .prefix("cb-")
      .tempdir()
      .expect("temp dir");
    Self { temp }
  }

  pub fn path(&self) -> &Path {
    self.temp.path()
  }

  pub fn socket(&self, name: &str) -> PathBuf {
    self.temp.path().join(name)
  }

  /// Broker with a single candidate socket in the temp dir.
  pub fn broker(&self, max_lines: i64) -> Broker {
    self.broker_with(BrokerOptions {
      config: BrokerConfig {
        max_lines,
        ..Default::default()
      },
      ..Default::default()
    })
  }

  pub fn broker_with(&self, mut opts: BrokerOptions) -> Broker {
    if opts.socket_candidates.is_empty() && opts.listener_factory.is_none() {
      opts.socket_candidates = vec![self.socket("console.sock")];
    }
    Broker::new(opts).expect("broker")
  }
}

pub fn connect(path: &Path) -> Result<Viewer> {
  let viewer = Viewer::connect(path)?;
  viewer.set_read_timeout(Some(READ_TIMEOUT))?;
  Ok(viewer)
}

pub fn next(viewer: &mut Viewer) -> Result<Record> {
  viewer
    .next_record()?
    .context("broker closed the session unexpectedly")
}

pub fn expect_meta(viewer: &mut Viewer) -> Result<Meta> {
  match next(viewer)? {
    Record::Meta(meta) => Ok(meta),
    other => bail!("expected meta, got {other:?}"),
  }
}

pub fn expect_line(viewer: &mut Viewer) -> Result<LineRecord> {
  match next(viewer)? {
    Record::Line(line) => Ok(line),
    other => bail!("expected line, got {other:?}"),
  }
}

/// Reads `n` line records and returns their texts.
pub fn read_texts(viewer: &mut Viewer, n: usize) -> Result<Vec<String>> {
  (0..n).map(|_| expect_line(viewer).map(|l| l.text)).collect()
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
  let start = Instant::now();
  while start.elapsed() < timeout {
    if cond() {
      return true;
    }
    thread::sleep(Duration::from_millis(10));
  }
  cond()
}
