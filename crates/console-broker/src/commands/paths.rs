use anyhow::Result;

use crate::config::{ConsoleConfig, global_config_path, socket_candidates};

pub fn run(cfg: &ConsoleConfig) -> Result<()> {
  anstream::println!("config: {}", global_config_path()?.display());
  for path in socket_candidates(cfg) {
    anstream::println!("socket: {}", path.display());
  }
  Ok(())
}
