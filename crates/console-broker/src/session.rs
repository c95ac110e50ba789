//! Viewer sessions: one accepted connection, its outbound queue and threads.
//!
//! Each session owns two threads:
//! - `console-drain` writes `meta`, then the replay backlog, then every queued
//!   live frame, flushing after each so viewers see output promptly.
//! - `console-watch` blocks on the read side and notices viewers that hang up
//!   while no output is flowing.
//!
//! The broker only ever talks to a session through its bounded queue. When the
//! queue is full the oldest queued frames are evicted and counted; the drain
//! thread turns the count into a single lag notice before the next frame.

use std::collections::HashMap;
use std::io::{BufWriter, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, info, warn};

use crate::protocol::{Frame, Notice, Record, encode_record};

/// Outbound queue capacity per session, in frames.
pub const SESSION_QUEUE_CAPACITY: usize = 512;

const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// Callback invoked with the session id when either session thread ends.
pub type OnSessionExit = Arc<dyn Fn(u64) + Send + Sync>;

/// Broker-side handle to a session's bounded queue.
pub struct OutboundQueue {
  tx: Sender<Frame>,
  /// Receiver clone used only to evict the oldest frames.
  evict: Receiver<Frame>,
  lagged: Arc<AtomicU64>,
}

impl OutboundQueue {
  /// Enqueues `frame` without blocking, evicting the oldest queued frames when
  /// full. Returns how many frames were evicted.
  ///
  /// Callers must serialise pushes (the broker lock does); the drain thread
  /// only removes frames, so the slot freed here stays free.
  pub fn push(&self, frame: Frame) -> u64 {
    let mut dropped = 0;
    while self.tx.is_full() {
      if self.evict.try_recv().is_ok() {
        dropped += 1;
      }
    }
    if dropped > 0 {
      // Counted before the send so the drain thread sees it no later than the frame.
      self.lagged.fetch_add(dropped, Ordering::AcqRel);
    }
    let _ = self.tx.try_send(frame);
    dropped
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.tx.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.tx.is_empty()
  }
}

/// Consumer half of an outbound queue, owned by the drain thread.
pub struct QueueDrain {
  rx: Receiver<Frame>,
  lagged: Arc<AtomicU64>,
}

impl QueueDrain {
  /// Blocks for the next frame; `None` once the broker dropped the queue.
  pub fn recv(&self) -> Option<Frame> {
    self.rx.recv().ok()
  }

  /// Returns and resets the number of frames evicted since the last call.
  pub fn take_lagged(&self) -> u64 {
    self.lagged.swap(0, Ordering::AcqRel)
  }
}

/// Creates a bounded outbound queue with the given capacity in frames.
#[must_use]
pub fn make_outbound_queue(capacity: usize) -> (OutboundQueue, QueueDrain) {
  let (tx, rx) = bounded::<Frame>(capacity.max(1));
  let lagged = Arc::new(AtomicU64::new(0));
  (
    OutboundQueue {
      tx,
      evict: rx.clone(),
      lagged: lagged.clone(),
    },
    QueueDrain { rx, lagged },
  )
}

/// Everything a new session needs to start streaming.
pub struct SessionStart {
  pub id: u64,
  pub stream: UnixStream,
  pub meta: Frame,
  /// History captured atomically with registration, oldest first.
  pub backlog: Vec<Frame>,
  pub queue_capacity: usize,
}

/// Registry entry for one attached viewer.
pub struct SessionHandle {
  queue: OutboundQueue,
  closer: UnixStream,
  drain: Option<JoinHandle<()>>,
  watch: Option<JoinHandle<()>>,
}

impl SessionHandle {
  #[must_use]
  pub fn queue(&self) -> &OutboundQueue {
    &self.queue
  }

  /// Shuts the transport down in both directions, unblocking both threads.
  pub fn close(&self) {
    let _ = self.closer.shutdown(Shutdown::Both);
  }

  /// Drops the queue and waits for the session threads to finish.
  pub fn join(self) {
    let SessionHandle {
      queue,
      closer,
      drain,
      watch,
    } = self;
    drop(queue);
    for handle in [drain, watch].into_iter().flatten() {
      let _ = handle.join();
    }
    drop(closer);
  }
}

/// Spawns the drain and watch threads for an accepted connection.
pub fn spawn_session(start: SessionStart, on_exit: OnSessionExit) -> Result<SessionHandle> {
  let SessionStart {
    id,
    stream,
    meta,
    backlog,
    queue_capacity,
  } = start;
  let closer = stream.try_clone().context("clone session stream")?;
  let watch_stream = stream.try_clone().context("clone session stream")?;
  let (queue, drain_side) = make_outbound_queue(queue_capacity);

  let exit = on_exit.clone();
  let drain = thread::Builder::new()
    .name(format!("console-drain-{id}"))
    .spawn(move || {
      match drain_session(stream, &meta, backlog, &drain_side) {
        Ok(()) => debug!("Viewer {id}: queue closed"),
        Err(e) => debug!("Viewer {id}: write failed: {e:#}"),
      }
      exit(id);
    })
    .context("spawn session drain thread")?;

  let watch = thread::Builder::new()
    .name(format!("console-watch-{id}"))
    .spawn(move || {
      watch_session(watch_stream);
      debug!("Viewer {id}: read side closed");
      on_exit(id);
    });
  let watch = match watch {
    Ok(handle) => handle,
    Err(e) => {
      // The drain thread exits on its own once the queue and socket are gone.
      let _ = closer.shutdown(Shutdown::Both);
      drop(queue);
      drop(drain);
      return Err(e).context("spawn session watch thread");
    }
  };

  Ok(SessionHandle {
    queue,
    closer,
    drain: Some(drain),
    watch: Some(watch),
  })
}

fn drain_session(
  stream: UnixStream,
  meta: &[u8],
  backlog: Vec<Frame>,
  queue: &QueueDrain,
) -> Result<()> {
  let mut out = BufWriter::with_capacity(WRITE_BUFFER_BYTES, stream);

  // A dead peer fails here and never gets the replay.
  out.write_all(meta).context("write meta")?;
  out.flush().context("flush meta")?;

  for frame in backlog {
    out.write_all(&frame).context("write replay")?;
  }
  out.flush().context("flush replay")?;

  while let Some(frame) = queue.recv() {
    let dropped = queue.take_lagged();
    if dropped > 0 {
      let notice = encode_record(&Record::Notice(Notice::lagged(dropped)))?;
      out.write_all(&notice).context("write lag notice")?;
    }
    out.write_all(&frame).context("write frame")?;
    out.flush().context("flush frame")?;
  }
  Ok(())
}

fn watch_session(mut stream: UnixStream) {
  let mut scratch = [0u8; 1024];
  loop {
    match stream.read(&mut scratch) {
      Ok(0) => return,
      Ok(_) => {}
      Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
      Err(_) => return,
    }
  }
}

/// Attached sessions keyed by id. Lives under the broker lock.
#[derive(Default)]
pub struct SessionRegistry {
  next_id: u64,
  sessions: HashMap<u64, SessionHandle>,
}

impl SessionRegistry {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn allocate_id(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }

  pub fn insert(&mut self, id: u64, handle: SessionHandle) {
    if self.sessions.insert(id, handle).is_some() {
      warn!("Session id {id} registered twice");
    }
  }

  /// Removes a session; repeated removal is a no-op.
  pub fn remove(&mut self, id: u64) -> Option<SessionHandle> {
    self.sessions.remove(&id)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.sessions.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.sessions.is_empty()
  }

  /// Pushes `frame` to every session without blocking.
  pub fn broadcast(&self, frame: &Frame) {
    for (id, handle) in &self.sessions {
      let dropped = handle.queue.push(frame.clone());
      if dropped > 0 {
        debug!("Viewer {id} lagging; evicted {dropped} queued lines");
      }
    }
  }

  /// Removes and returns every session.
  pub fn drain_all(&mut self) -> Vec<(u64, SessionHandle)> {
    let out: Vec<_> = self.sessions.drain().collect();
    if !out.is_empty() {
      info!("Closing {} viewer session(s)", out.len());
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame(s: &str) -> Frame {
    Frame::from(s.as_bytes().to_vec())
  }

  #[test]
  fn push_below_capacity_keeps_everything() {
    let (queue, drain) = make_outbound_queue(4);
    assert_eq!(queue.push(frame("a")), 0);
    assert_eq!(queue.push(frame("b")), 0);
    assert_eq!(queue.len(), 2);
    assert_eq!(drain.take_lagged(), 0);
    assert_eq!(&*drain.recv().unwrap(), b"a");
  }

  #[test]
  fn full_queue_evicts_oldest_and_accumulates_lag() {
    let (queue, drain) = make_outbound_queue(3);
    for s in ["1", "2", "3"] {
      assert_eq!(queue.push(frame(s)), 0);
    }
    assert_eq!(queue.push(frame("4")), 1);
    assert_eq!(queue.push(frame("5")), 1);
    assert_eq!(queue.len(), 3);

    // One consolidated count for the whole episode.
    assert_eq!(drain.take_lagged(), 2);
    assert_eq!(drain.take_lagged(), 0);

    let got: Vec<Frame> = std::iter::from_fn(|| drain.rx.try_recv().ok()).collect();
    let got: Vec<&[u8]> = got.iter().map(|f| &**f).collect();
    assert_eq!(got, vec![b"3" as &[u8], b"4", b"5"]);
  }

  #[test]
  fn recv_ends_when_queue_dropped() {
    let (queue, drain) = make_outbound_queue(2);
    queue.push(frame("x"));
    drop(queue);
    assert!(drain.recv().is_some());
    assert!(drain.recv().is_none());
  }

  #[test]
  fn registry_removal_is_idempotent() {
    let (a, _b) = UnixStream::pair().unwrap();
    let mut reg = SessionRegistry::new();
    let id = reg.allocate_id();
    let handle = spawn_session(
      SessionStart {
        id,
        stream: a,
        meta: frame("{}\n"),
        backlog: Vec::new(),
        queue_capacity: 4,
      },
      Arc::new(|_: u64| {}),
    )
    .unwrap();
    reg.insert(id, handle);
    assert_eq!(reg.len(), 1);

    let handle = reg.remove(id).unwrap();
    assert!(reg.remove(id).is_none());
    assert!(reg.is_empty());
    handle.close();
    handle.join();
  }

  #[test]
  fn drain_writes_meta_backlog_then_live_frames() {
    let (a, b) = UnixStream::pair().unwrap();
    let handle = spawn_session(
      SessionStart {
        id: 1,
        stream: a,
        meta: frame("meta\n"),
        backlog: vec![frame("old-1\n"), frame("old-2\n")],
        queue_capacity: 8,
      },
      Arc::new(|_: u64| {}),
    )
    .unwrap();
    handle.queue().push(frame("live\n"));

    let mut reader = std::io::BufReader::new(b);
    let mut lines = Vec::new();
    for _ in 0..4 {
      let mut line = String::new();
      std::io::BufRead::read_line(&mut reader, &mut line).unwrap();
      lines.push(line);
    }
    assert_eq!(lines, vec!["meta\n", "old-1\n", "old-2\n", "live\n"]);

    handle.close();
    handle.join();
  }
}
