//! Per-label causal delivery. Each causal label carries an independent
//! vector clock per node and a buffer of messages that arrived before
//! their dependencies were satisfied.
//!
//! A message tagged with dependency `dep` is deliverable once, for
//! every node `n` named in `dep`, `received[n] >= dep[n]`, with the
//! sender's own entry required to match exactly (it is always
//! `local_clock(sender) - 1` at emission time).

use {
  bytes::Bytes,
  parking_lot::Mutex,
  std::{collections::HashMap, sync::Arc},
};

#[derive(Clone)]
struct Buffered {
  sender: String,
  dependency: Vec<(String, u64)>,
  payload: Bytes,
  target: String,
}

struct LabelState {
  /// This node's own counter for the label; incremented on every emit.
  local_clock: u64,
  /// Highest sequence number observed from each sender.
  received: HashMap<String, u64>,
  buffer: Vec<Buffered>,
}

impl LabelState {
  fn new() -> Self {
    Self {
      local_clock: 0,
      received: HashMap::new(),
      buffer: Vec::new(),
    }
  }

  fn is_deliverable(&self, sender: &str, dependency: &[(String, u64)]) -> bool {
    dependency.iter().all(|(node, seq)| {
      if node == sender {
        self.received.get(node).copied().unwrap_or(0) + 1 == *seq
      } else {
        self.received.get(node).copied().unwrap_or(0) >= *seq
      }
    })
  }
}

/// Shared causal state across every label this node participates in.
#[derive(Clone, Default)]
pub struct CausalLayer {
  labels: Arc<Mutex<HashMap<String, LabelState>>>,
}

impl CausalLayer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Advances the local clock for `label` and returns the dependency
  /// set to attach to the outgoing message: the sender's own new
  /// sequence number paired with every other node's last-seen sequence.
  pub fn next_send(&self, label: &str, sender: &str) -> Vec<(String, u64)> {
    let mut labels = self.labels.lock();
    let state = labels.entry(label.to_string()).or_insert_with(LabelState::new);
    state.local_clock += 1;
    let mut dep: Vec<(String, u64)> = state
      .received
      .iter()
      .map(|(n, v)| (n.clone(), *v))
      .collect();
    dep.push((sender.to_string(), state.local_clock));
    dep.sort();
    dep
  }

  /// Feeds a received message through the causal layer, invoking
  /// `deliver` for it and for any previously buffered message it
  /// unblocks, in dependency order.
  pub fn receive(
    &self,
    label: &str,
    sender: &str,
    dependency: Vec<(String, u64)>,
    target: String,
    payload: Bytes,
    deliver: impl Fn(&str, Bytes),
  ) {
    let mut labels = self.labels.lock();
    let state = labels.entry(label.to_string()).or_insert_with(LabelState::new);

    if state.is_deliverable(sender, &dependency) {
      deliver(&target, payload);
      if let Some(seq) = dependency.iter().find(|(n, _)| n == sender).map(|(_, s)| *s) {
        state.received.insert(sender.to_string(), seq);
      }
      Self::drain_ready(state, &deliver);
    } else {
      state.buffer.push(Buffered {
        sender: sender.to_string(),
        dependency,
        payload,
        target,
      });
    }
  }

  fn drain_ready(state: &mut LabelState, deliver: &impl Fn(&str, Bytes)) {
    loop {
      let Some(idx) = state
        .buffer
        .iter()
        .position(|b| state.is_deliverable(&b.sender, &b.dependency))
      else {
        break;
      };
      let ready = state.buffer.remove(idx);
      deliver(&ready.target, ready.payload);
      if let Some(seq) = ready
        .dependency
        .iter()
        .find(|(n, _)| *n == ready.sender)
        .map(|(_, s)| *s)
      {
        state.received.insert(ready.sender, seq);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc as StdArc, Mutex as StdMutex};

  #[test]
  fn in_order_messages_deliver_immediately() {
    let layer = CausalLayer::new();
    let dep1 = layer.next_send("l", "n1");
    let delivered = StdArc::new(StdMutex::new(Vec::new()));
    let d = delivered.clone();
    layer.receive("l", "n1", dep1, "t".into(), Bytes::from_static(b"m1"), move |_, p| {
      d.lock().unwrap().push(p);
    });
    assert_eq!(delivered.lock().unwrap().len(), 1);
  }

  #[test]
  fn out_of_order_message_is_buffered_then_released() {
    let layer = CausalLayer::new();
    let dep1 = layer.next_send("l", "n1");
    let dep2 = layer.next_send("l", "n1");
    let delivered = StdArc::new(StdMutex::new(Vec::<Bytes>::new()));

    let d = delivered.clone();
    layer.receive("l", "n1", dep2, "t".into(), Bytes::from_static(b"m2"), move |_, p| {
      d.lock().unwrap().push(p);
    });
    assert_eq!(delivered.lock().unwrap().len(), 0, "m2 depends on m1, must wait");

    let d = delivered.clone();
    layer.receive("l", "n1", dep1, "t".into(), Bytes::from_static(b"m1"), move |_, p| {
      d.lock().unwrap().push(p);
    });
    let got = delivered.lock().unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[0], Bytes::from_static(b"m1"));
    assert_eq!(got[1], Bytes::from_static(b"m2"));
  }
}
