use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use toml::Value as TomlValue;

use crate::protocol::{CounterSpec, HighlightSpec, Meta};

/// History size used when `max_lines` is unset or not positive.
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Counter window used when a rule's `window_s` is not positive.
pub const DEFAULT_COUNTER_WINDOW_S: i64 = 60;

/// Environment variable that overrides every other socket location.
pub const SOCKET_ENV: &str = "CONSOLE_BROKER_SOCKET";

const SOCKET_FILE_NAME: &str = "console-broker.sock";
const CONFIG_FILE_NAME: &str = "console.toml";
const XDG_PREFIX: &str = "console-broker";

/// Known top-level config keys.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["max_lines", "counters", "highlights", "socket"];

/// Presentation rules and limits frozen into a broker at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BrokerConfig {
  /// Number of lines retained for replay; `<= 0` selects the default.
  #[serde(default)]
  pub max_lines: i64,
  #[serde(default)]
  pub counters: Vec<CounterSpec>,
  #[serde(default)]
  pub highlights: Vec<HighlightSpec>,
}

impl BrokerConfig {
  /// Returns a positive history size.
  #[must_use]
  pub fn effective_max_lines(&self) -> usize {
    usize::try_from(self.max_lines)
      .ok()
      .filter(|n| *n > 0)
      .unwrap_or(DEFAULT_MAX_LINES)
  }

  /// Builds the `meta` payload sent at the start of every session.
  #[must_use]
  pub fn to_meta(&self) -> Meta {
    Meta {
      max_lines: self.effective_max_lines(),
      counters: self.counters.clone(),
      highlights: self.highlights.clone(),
    }
  }
}

impl CounterSpec {
  /// Returns the counter window in seconds, falling back to the default.
  #[must_use]
  pub fn effective_window_s(&self) -> i64 {
    if self.window_s <= 0 {
      DEFAULT_COUNTER_WINDOW_S
    } else {
      self.window_s
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SocketConfig {
  /// Candidate socket paths tried in order.
  #[serde(default)]
  pub paths: Vec<String>,
}

/// Contents of `console.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConsoleConfig {
  #[serde(flatten)]
  pub broker: BrokerConfig,
  #[serde(default)]
  pub socket: Option<SocketConfig>,
}

/// Resolve the global config file path.
///
/// # Errors
/// Returns an error if the XDG config home cannot be resolved.
pub fn global_config_path() -> Result<PathBuf> {
  let xdg = xdg::BaseDirectories::with_prefix(XDG_PREFIX);
  let config_home = xdg
    .get_config_home()
    .ok_or_else(|| anyhow::anyhow!("unable to resolve XDG config home"))?;
  Ok(config_home.join(CONFIG_FILE_NAME))
}

/// Loads the console config.
///
/// An explicit path must exist. Without one, the global XDG config is used if
/// present, otherwise defaults are returned.
pub fn load_config(explicit: Option<&Path>) -> Result<ConsoleConfig> {
  if let Some(path) = explicit {
    return read_config_file(path);
  }
  let xdg = xdg::BaseDirectories::with_prefix(XDG_PREFIX);
  match xdg.find_config_file(CONFIG_FILE_NAME) {
    Some(path) => read_config_file(&path),
    None => Ok(ConsoleConfig::default()),
  }
}

fn read_config_file(path: &Path) -> Result<ConsoleConfig> {
  let data =
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  parse_config(&data, path)
}

fn parse_config(data: &str, origin: &Path) -> Result<ConsoleConfig> {
  let val: TomlValue =
    toml::from_str(data).with_context(|| format!("invalid TOML in {}", origin.display()))?;
  warn_unknown_keys(&val, origin);
  toml::from_str(data).with_context(|| format!("failed to parse config {}", origin.display()))
}

fn warn_unknown_keys(val: &TomlValue, origin: &Path) {
  let Some(table) = val.as_table() else {
    return;
  };
  for key in table.keys() {
    if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
      warn!("Unknown config key '{}' in {}", key, origin.display());
    }
  }
}

/// Computes the ordered socket candidates.
///
/// Order:
/// 1) `CONSOLE_BROKER_SOCKET` environment variable
/// 2) `socket.paths` from the config, in order
/// 3) `$XDG_RUNTIME_DIR/console-broker.sock` if the env var is set
/// 4) `~/.local/run/console-broker.sock`
/// 5) `<tmp>/console-broker.sock`
#[must_use]
pub fn socket_candidates(cfg: &ConsoleConfig) -> Vec<PathBuf> {
  let mut out = Vec::new();
  if let Ok(env_path) = std::env::var(SOCKET_ENV)
    && !env_path.trim().is_empty()
  {
    out.push(PathBuf::from(env_path.trim()));
  }
  if let Some(socket) = &cfg.socket {
    out.extend(socket.paths.iter().map(PathBuf::from));
  }
  if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR")
    && !xdg_runtime.is_empty()
  {
    out.push(PathBuf::from(xdg_runtime).join(SOCKET_FILE_NAME));
  }
  if let Ok(home) = std::env::var("HOME") {
    out.push(
      PathBuf::from(home)
        .join(".local")
        .join("run")
        .join(SOCKET_FILE_NAME),
    );
  }
  out.push(std::env::temp_dir().join(SOCKET_FILE_NAME));

  let mut seen = Vec::with_capacity(out.len());
  out.retain(|p| {
    if seen.contains(p) {
      false
    } else {
      seen.push(p.clone());
      true
    }
  });
  out
}
