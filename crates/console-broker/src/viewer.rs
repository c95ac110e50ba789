//! Viewer side of the wire protocol: dial the broker and decode records.
//!
//! The first record is always `meta`; everything after it is `line` or
//! `notice`. Records that fail to decode are skipped. End of stream or a read
//! error means the broker closed the session and is final.

use std::io::{BufRead, BufReader};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::debug;

use crate::protocol::{Record, decode_record};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Picks the first candidate that exists and is a socket.
pub fn choose_socket_for_dial(candidates: &[PathBuf]) -> Result<PathBuf> {
  if candidates.is_empty() {
    bail!("console attach: no socket candidates provided");
  }
  for path in candidates {
    if let Ok(meta) = std::fs::metadata(path)
      && meta.file_type().is_socket()
    {
      return Ok(path.clone());
    }
  }
  bail!("console attach: socket not found in provided locations")
}

/// Connected viewer reading NDJSON records from a broker.
pub struct Viewer {
  path: PathBuf,
  reader: BufReader<UnixStream>,
  buf: Vec<u8>,
}

impl Viewer {
  pub fn connect(path: &Path) -> Result<Self> {
    let stream =
      UnixStream::connect(path).with_context(|| format!("console attach: {}", path.display()))?;
    Ok(Self {
      path: path.to_path_buf(),
      reader: BufReader::with_capacity(READ_BUFFER_BYTES, stream),
      buf: Vec::new(),
    })
  }

  /// Connects to the first existing socket among `candidates`.
  pub fn connect_first(candidates: &[PathBuf]) -> Result<Self> {
    let path = choose_socket_for_dial(candidates)?;
    Self::connect(&path)
  }

  #[must_use]
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Bounds how long [`Viewer::next_record`] waits for data.
  pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
    self
      .reader
      .get_ref()
      .set_read_timeout(timeout)
      .context("set viewer read timeout")
  }

  /// Reads the next decodable record.
  ///
  /// Returns `Ok(None)` once the broker closed the stream. A trailing partial
  /// line at end of stream is discarded.
  pub fn next_record(&mut self) -> Result<Option<Record>> {
    loop {
      self.buf.clear();
      let n = self
        .reader
        .read_until(b'\n', &mut self.buf)
        .context("read from console broker")?;
      if n == 0 || self.buf.last() != Some(&b'\n') {
        return Ok(None);
      }
      match decode_record(&self.buf) {
        Ok(record) => return Ok(Some(record)),
        Err(e) => debug!("Skipping malformed record: {e:#}"),
      }
    }
  }
}

impl Iterator for Viewer {
  type Item = Record;

  /// Yields records until the session ends; read errors also end it.
  fn next(&mut self) -> Option<Record> {
    match self.next_record() {
      Ok(record) => record,
      Err(e) => {
        debug!("Viewer disconnected: {e:#}");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::{LineRecord, Notice};
  use std::io::Write;
  use std::os::unix::net::UnixListener;

  #[test]
  fn skips_malformed_and_unknown_records() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("v.sock");
    let listener = UnixListener::bind(&sock).unwrap();

    let server = std::thread::spawn(move || {
      let (mut s, _) = listener.accept().unwrap();
      s.write_all(b"{\"type\":\"meta\",\"max_lines\":5,\"counters\":[],\"highlights\":[]}\n")
        .unwrap();
      s.write_all(b"garbage\n\n").unwrap();
      s.write_all(b"{\"type\":\"future\",\"x\":1}\n").unwrap();
      s.write_all(b"{\"type\":\"line\",\"ts_us\":7,\"text\":\"hi\",\"level\":\"info\"}\n")
        .unwrap();
      s.write_all(b"{\"type\":\"notice\",\"text\":\"n\"}\n").unwrap();
      s.write_all(b"{\"type\":\"line\",\"ts_us\":8").unwrap();
    });

    let viewer = Viewer::connect(&sock).unwrap();
    let records: Vec<Record> = viewer.collect();
    server.join().unwrap();

    assert_eq!(records.len(), 3);
    assert!(matches!(&records[0], Record::Meta(m) if m.max_lines == 5));
    assert_eq!(
      records[1],
      Record::Line(LineRecord {
        ts_us: 7,
        text: "hi".to_string(),
        level: crate::protocol::Level::Info,
      })
    );
    assert_eq!(
      records[2],
      Record::Notice(Notice {
        text: "n".to_string()
      })
    );
  }

  #[test]
  fn dial_picks_first_existing_socket() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.sock");
    let plain = dir.path().join("plain.sock");
    std::fs::write(&plain, "").unwrap();
    let live = dir.path().join("live.sock");
    let _listener = UnixListener::bind(&live).unwrap();

    let chosen = choose_socket_for_dial(&[missing.clone(), plain, live.clone()]).unwrap();
    assert_eq!(chosen, live);
    assert!(choose_socket_for_dial(&[missing]).is_err());
    assert!(choose_socket_for_dial(&[]).is_err());
  }
}
