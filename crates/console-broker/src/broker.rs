//! Broker: retains recent console lines and streams them to local viewers.
//!
//! High-level flow:
//! - `start` binds the first usable socket candidate (or asks the injected
//!   listener factory) and spawns a non-blocking accept loop.
//! - Each accepted viewer gets `meta`, then the retained history, then every
//!   later line. History capture and registration happen in one critical
//!   section with `append`, so the seam has no gap and no duplicate.
//! - `append` never blocks on viewers: full queues evict their oldest frames
//!   and the viewer is told how many lines it lost.
//! - `stop` ends the accept loop, removes the socket and closes every session.
//!
//! Invariants:
//! - One lock (`Shared::core`) guards history and the session registry.
//! - No socket I/O happens while holding it; sessions write from their own
//!   threads.
//! - `lifecycle` is never taken from session or accept threads.

use std::fmt;
use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::BrokerConfig;
use crate::endpoint::{bind_first_available, remove_socket_file, restrict_to_owner};
use crate::history::History;
use crate::protocol::{Frame, LineRecord, Record, encode_record};
use crate::session::{SESSION_QUEUE_CAPACITY, SessionRegistry, SessionStart, spawn_session};

/// Maximum number of concurrently attached viewers.
pub const MAX_SESSIONS: usize = 5;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Produces a bound listener and the path it is bound to.
pub type ListenerFactory = Box<dyn Fn() -> Result<(PathBuf, UnixListener)> + Send + Sync>;

/// Construction options for [`Broker`].
pub struct BrokerOptions {
  pub config: BrokerConfig,
  /// Socket paths tried in order by `start`.
  pub socket_candidates: Vec<PathBuf>,
  /// Replaces candidate binding when set.
  pub listener_factory: Option<ListenerFactory>,
  pub max_sessions: usize,
  pub queue_capacity: usize,
}

impl Default for BrokerOptions {
  fn default() -> Self {
    Self {
      config: BrokerConfig::default(),
      socket_candidates: Vec::new(),
      listener_factory: None,
      max_sessions: MAX_SESSIONS,
      queue_capacity: SESSION_QUEUE_CAPACITY,
    }
  }
}

impl fmt::Debug for BrokerOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BrokerOptions")
      .field("config", &self.config)
      .field("socket_candidates", &self.socket_candidates)
      .field("listener_factory", &self.listener_factory.is_some())
      .field("max_sessions", &self.max_sessions)
      .field("queue_capacity", &self.queue_capacity)
      .finish()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
  Created,
  Running,
  Stopped,
}

struct Core {
  history: History,
  sessions: SessionRegistry,
}

struct Shared {
  core: Mutex<Core>,
  running: AtomicBool,
  meta: Frame,
  max_sessions: usize,
  queue_capacity: usize,
}

struct Lifecycle {
  state: BrokerState,
  socket_path: Option<PathBuf>,
  accept_thread: Option<JoinHandle<()>>,
}

pub struct Broker {
  shared: Arc<Shared>,
  config: BrokerConfig,
  candidates: Vec<PathBuf>,
  listener_factory: Option<ListenerFactory>,
  lifecycle: Mutex<Lifecycle>,
}

impl Broker {
  /// Creates a broker with a frozen copy of the configuration and an empty
  /// history sized to it. Nothing is bound until [`Broker::start`].
  pub fn new(opts: BrokerOptions) -> Result<Self> {
    let BrokerOptions {
      config,
      socket_candidates,
      listener_factory,
      max_sessions,
      queue_capacity,
    } = opts;
    let meta = encode_record(&Record::Meta(config.to_meta())).context("encode meta record")?;
    let capacity = config.effective_max_lines();
    Ok(Self {
      shared: Arc::new(Shared {
        core: Mutex::new(Core {
          history: History::new(capacity),
          sessions: SessionRegistry::new(),
        }),
        running: AtomicBool::new(false),
        meta,
        max_sessions,
        queue_capacity,
      }),
      config,
      candidates: socket_candidates,
      listener_factory,
      lifecycle: Mutex::new(Lifecycle {
        state: BrokerState::Created,
        socket_path: None,
        accept_thread: None,
      }),
    })
  }

  /// Binds the socket and starts accepting viewers. Returns the bound path.
  ///
  /// Fails if already running or if no candidate could be bound. A stopped
  /// broker may be started again; its history is kept.
  pub fn start(&self) -> Result<PathBuf> {
    let mut life = self.lifecycle.lock();
    if life.state == BrokerState::Running {
      bail!(
        "console broker already running on {}",
        life
          .socket_path
          .as_ref()
          .map_or_else(|| "<unknown>".to_string(), |p| p.display().to_string())
      );
    }

    let (path, listener) = match &self.listener_factory {
      Some(factory) => factory()?,
      None => bind_first_available(&self.candidates)?,
    };
    restrict_to_owner(&path);
    if let Err(e) = listener.set_nonblocking(true) {
      remove_socket_file(&path);
      return Err(e).context("set listener non-blocking");
    }

    self.shared.running.store(true, Ordering::Release);
    let shared = self.shared.clone();
    let spawned = thread::Builder::new()
      .name("console-accept".to_string())
      .spawn(move || accept_loop(&shared, &listener));
    let handle = match spawned {
      Ok(handle) => handle,
      Err(e) => {
        self.shared.running.store(false, Ordering::Release);
        remove_socket_file(&path);
        return Err(e).context("spawn accept thread");
      }
    };

    life.state = BrokerState::Running;
    life.socket_path = Some(path.clone());
    life.accept_thread = Some(handle);
    info!("Console broker listening on {}", path.display());
    Ok(path)
  }

  /// Stops accepting, removes the socket and closes every session.
  ///
  /// Safe to call in any state; a broker that never started stays `Created`.
  pub fn stop(&self) {
    let mut life = self.lifecycle.lock();
    self.shared.running.store(false, Ordering::Release);
    if let Some(handle) = life.accept_thread.take() {
      // The accept thread owns the listener; joining closes it.
      let _ = handle.join();
    }
    if let Some(path) = life.socket_path.take() {
      remove_socket_file(&path);
    }

    let sessions = {
      let mut core = self.shared.core.lock();
      let sessions = core.sessions.drain_all();
      for (_, session) in &sessions {
        session.close();
      }
      sessions
    };
    for (id, session) in sessions {
      session.join();
      debug!("Viewer {id} closed by stop");
    }

    if life.state == BrokerState::Running {
      life.state = BrokerState::Stopped;
      info!("Console broker stopped");
    }
  }

  /// Records a line and fans it out to every attached viewer.
  ///
  /// Never blocks on viewers and never fails; works before `start` and after
  /// `stop`, in which case only the history is updated.
  pub fn append(&self, text: impl Into<String>) {
    self.append_at(SystemTime::now(), text);
  }

  /// Like [`Broker::append`] with an explicit timestamp.
  pub fn append_at(&self, when: SystemTime, text: impl Into<String>) {
    let frame = match encode_record(&Record::Line(LineRecord::new(when, text))) {
      Ok(frame) => frame,
      Err(e) => {
        debug!("Skipping console line: {e:#}");
        return;
      }
    };
    let mut core = self.shared.core.lock();
    core.history.insert(frame.clone());
    core.sessions.broadcast(&frame);
  }

  /// Formatting variant of [`Broker::append`]; see also [`crate::appendf!`].
  pub fn append_fmt(&self, args: fmt::Arguments<'_>) {
    match args.as_str() {
      Some(s) => self.append(s),
      None => self.append(args.to_string()),
    }
  }

  #[must_use]
  pub fn state(&self) -> BrokerState {
    self.lifecycle.lock().state
  }

  /// Path of the bound socket while running.
  #[must_use]
  pub fn socket_path(&self) -> Option<PathBuf> {
    self.lifecycle.lock().socket_path.clone()
  }

  /// Number of currently attached viewers.
  #[must_use]
  pub fn session_count(&self) -> usize {
    self.shared.core.lock().sessions.len()
  }

  /// Number of lines currently retained for replay.
  #[must_use]
  pub fn history_len(&self) -> usize {
    self.shared.core.lock().history.len()
  }

  #[must_use]
  pub fn config(&self) -> &BrokerConfig {
    &self.config
  }
}

impl Drop for Broker {
  fn drop(&mut self) {
    if self.lifecycle.get_mut().state == BrokerState::Running {
      self.stop();
    }
  }
}

fn accept_loop(shared: &Arc<Shared>, listener: &UnixListener) {
  while shared.running.load(Ordering::Acquire) {
    match listener.accept() {
      Ok((stream, _addr)) => {
        if let Err(e) = admit(shared, stream) {
          warn!("Failed to attach viewer: {e:#}");
        }
      }
      Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
      Err(e) => {
        if !shared.running.load(Ordering::Acquire) {
          break;
        }
        warn!("Accept error: {e}");
        thread::sleep(ACCEPT_POLL_INTERVAL);
      }
    }
  }
  debug!("Accept loop exiting");
}

/// Registers a viewer, or closes it immediately when the ceiling is reached.
fn admit(shared: &Arc<Shared>, stream: UnixStream) -> Result<()> {
  stream
    .set_nonblocking(false)
    .context("set viewer stream blocking")?;

  let mut core = shared.core.lock();
  if core.sessions.len() >= shared.max_sessions {
    drop(core);
    info!(
      "Rejecting viewer: {} sessions already attached",
      shared.max_sessions
    );
    let _ = stream.shutdown(std::net::Shutdown::Both);
    return Ok(());
  }

  let id = core.sessions.allocate_id();
  let backlog = core.history.snapshot();
  let replayed = backlog.len();
  let weak: Weak<Shared> = Arc::downgrade(shared);
  let handle = spawn_session(
    SessionStart {
      id,
      stream,
      meta: shared.meta.clone(),
      backlog,
      queue_capacity: shared.queue_capacity,
    },
    Arc::new(move |id: u64| {
      if let Some(shared) = weak.upgrade() {
        detach(&shared, id);
      }
    }),
  )?;
  core.sessions.insert(id, handle);
  drop(core);
  info!("Viewer {id} attached; replaying {replayed} lines");
  Ok(())
}

fn detach(shared: &Shared, id: u64) {
  let removed = shared.core.lock().sessions.remove(id);
  if let Some(session) = removed {
    session.close();
    info!("Viewer {id} detached");
  }
}

/// Appends a formatted line to a [`Broker`].
///
/// ```ignore
/// console_broker::appendf!(broker, "listening on port {}", port);
/// ```
#[macro_export]
macro_rules! appendf {
  ($broker:expr, $($arg:tt)*) => {{
    $broker.append_fmt(::std::format_args!($($arg)*));
  }};
}
