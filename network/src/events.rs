//! Membership-change subscription: every time the active view changes,
//! subscribers receive the new view. Built on a broadcast channel so
//! slow subscribers only miss old events, never block a fast one.

use {crate::config::NodeSpec, tokio::sync::broadcast};

const CHANNEL_CAPACITY: usize = 128;

#[derive(Clone)]
pub struct MembershipEvents {
  tx: broadcast::Sender<Vec<NodeSpec>>,
}

impl Default for MembershipEvents {
  fn default() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self { tx }
  }
}

impl MembershipEvents {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn publish(&self, active_view: Vec<NodeSpec>) {
    let _ = self.tx.send(active_view);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Vec<NodeSpec>> {
    self.tx.subscribe()
  }
}
