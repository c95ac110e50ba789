//! Wire format shared by the broker and its viewers.
//!
//! Every record is one JSON object terminated by `\n` (NDJSON) and carries a
//! `type` discriminator:
//! - `meta`: presentation rules and the effective history size; always first.
//! - `line`: one console line with its timestamp and coarse level.
//! - `notice`: a broker-originated message, e.g. a lag notification.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Prefix that marks a console line as an error.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// An encoded, newline-terminated record shared between history and sessions.
pub type Frame = Arc<[u8]>;

/// Simple terminal style applied by viewers to highlighted substrings.
///
/// `fg`/`bg` accept named colors ("red") or hex ("#ff3366"); empty keeps the
/// current color. `attrs` is a compact string such as "b", "bu" or "i".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Style {
  #[serde(default)]
  pub fg: String,
  #[serde(default)]
  pub bg: String,
  #[serde(default)]
  pub attrs: String,
}

/// Rolling counter rule matched by viewers against incoming lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSpec {
  #[serde(rename = "match")]
  pub pattern: String,
  #[serde(default)]
  pub case_sensitive: bool,
  #[serde(default)]
  pub label: String,
  /// Window in seconds; values `<= 0` mean the default window.
  #[serde(default)]
  pub window_s: i64,
}

/// Substring highlight rule with an optional style.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightSpec {
  #[serde(rename = "match")]
  pub pattern: String,
  #[serde(default)]
  pub case_sensitive: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub style: Option<Style>,
}

/// Coarse severity derived from the line text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
  Error,
  Info,
}

impl Level {
  #[must_use]
  pub fn as_str(self) -> &'static str {
    match self {
      Level::Error => "error",
      Level::Info => "info",
    }
  }
}

/// Derives the level of a console line from its prefix.
#[must_use]
pub fn level_of(text: &str) -> Level {
  if text.starts_with(ERROR_PREFIX) {
    Level::Error
  } else {
    Level::Info
  }
}

/// First record of every session describing limits and presentation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
  pub max_lines: usize,
  #[serde(default)]
  pub counters: Vec<CounterSpec>,
  #[serde(default)]
  pub highlights: Vec<HighlightSpec>,
}

/// One console line with its original timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
  /// Microseconds since the Unix epoch.
  pub ts_us: i64,
  pub text: String,
  pub level: Level,
}

impl LineRecord {
  #[must_use]
  pub fn new(when: SystemTime, text: impl Into<String>) -> Self {
    let text = text.into();
    let ts_us = when
      .duration_since(UNIX_EPOCH)
      .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX));
    Self {
      ts_us,
      level: level_of(&text),
      text,
    }
  }

  /// Original timestamp, or `None` when the sender did not provide one.
  #[must_use]
  pub fn timestamp(&self) -> Option<SystemTime> {
    let micros = u64::try_from(self.ts_us).ok().filter(|us| *us > 0)?;
    UNIX_EPOCH.checked_add(std::time::Duration::from_micros(micros))
  }
}

/// Out-of-band message from the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
  pub text: String,
}

impl Notice {
  /// Notice telling a slow viewer how many queued lines were discarded.
  #[must_use]
  pub fn lagged(dropped: u64) -> Self {
    Self {
      text: format!("[viewer lagged; dropped {dropped} lines]"),
    }
  }
}

/// Top-level broker-to-viewer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
  Meta(Meta),
  Line(LineRecord),
  Notice(Notice),
}

/// Encodes a record as one NDJSON line.
pub fn encode_record(record: &Record) -> Result<Frame> {
  let mut buf = serde_json::to_vec(record).context("encode record as json")?;
  buf.push(b'\n');
  Ok(Frame::from(buf))
}

/// Decodes one NDJSON line. Unknown `type` values are reported as errors so
/// callers can skip them.
pub fn decode_record(line: &[u8]) -> Result<Record> {
  serde_json::from_slice(line).context("decode record from json")
}
