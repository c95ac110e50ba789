use crate::protocol::Frame;

/// Fixed-capacity ring of the most recent encoded records.
///
/// Slots are written at `head`, which then advances modulo the capacity, so
/// reading `head, head + 1, ..` (skipping never-written slots) yields records
/// oldest first. Not synchronised; the broker keeps it under its single lock
/// together with the session registry.
pub struct History {
  slots: Vec<Option<Frame>>,
  head: usize,
  len: usize,
}

impl History {
  /// Creates an empty ring. A capacity of zero is raised to one.
  #[must_use]
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      slots: vec![None; capacity],
      head: 0,
      len: 0,
    }
  }

  #[must_use]
  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  /// Number of records currently retained (`min(total inserted, capacity)`).
  #[must_use]
  pub fn len(&self) -> usize {
    self.len
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Stores `frame`, overwriting the oldest record once full.
  pub fn insert(&mut self, frame: Frame) {
    if self.slots[self.head].is_none() {
      self.len += 1;
    }
    self.slots[self.head] = Some(frame);
    self.head = (self.head + 1) % self.slots.len();
  }

  /// Visits every retained record from oldest to newest.
  pub fn replay(&self, mut visit: impl FnMut(&Frame)) {
    let cap = self.slots.len();
    for i in 0..cap {
      if let Some(frame) = &self.slots[(self.head + i) % cap] {
        visit(frame);
      }
    }
  }

  /// Ordered copy of the retained records (cheap: frames are shared).
  #[must_use]
  pub fn snapshot(&self) -> Vec<Frame> {
    let mut out = Vec::with_capacity(self.len);
    self.replay(|frame| out.push(frame.clone()));
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame(n: usize) -> Frame {
    Frame::from(format!("{n}\n").into_bytes())
  }

  fn numbers(history: &History) -> Vec<usize> {
    history
      .snapshot()
      .iter()
      .map(|f| std::str::from_utf8(f).unwrap().trim().parse().unwrap())
      .collect()
  }

  #[test]
  fn partial_fill_replays_everything_in_order() {
    let mut h = History::new(5);
    assert!(h.is_empty());
    for n in 0..3 {
      h.insert(frame(n));
    }
    assert_eq!(h.len(), 3);
    assert_eq!(numbers(&h), vec![0, 1, 2]);
  }

  #[test]
  fn wraparound_keeps_last_capacity_records() {
    let mut h = History::new(4);
    for n in 0..11 {
      h.insert(frame(n));
    }
    assert_eq!(h.len(), 4);
    assert_eq!(h.capacity(), 4);
    assert_eq!(numbers(&h), vec![7, 8, 9, 10]);
  }

  #[test]
  fn exact_fill_boundary() {
    let mut h = History::new(3);
    for n in 0..3 {
      h.insert(frame(n));
    }
    assert_eq!(numbers(&h), vec![0, 1, 2]);
    h.insert(frame(3));
    assert_eq!(numbers(&h), vec![1, 2, 3]);
  }

  #[test]
  fn zero_capacity_is_clamped() {
    let mut h = History::new(0);
    h.insert(frame(1));
    h.insert(frame(2));
    assert_eq!(h.capacity(), 1);
    assert_eq!(numbers(&h), vec![2]);
  }
}
