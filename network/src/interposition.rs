//! Per-peer interposition filters: pure functions of `(tag, peer,
//! payload)` that observe, drop, substitute, or delay a message on its
//! way out to or in from the network. Modelled as tagged data rather
//! than arbitrary closures over internal state, per the design note on
//! keeping filters reviewable and serialisable.

use {
  bytes::Bytes,
  parking_lot::RwLock,
  std::{collections::HashMap, sync::Arc},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
  ForwardMessage,
  ReceiveMessage,
}

/// Result of evaluating a filter against one message.
pub enum Verdict {
  Pass(Bytes),
  Drop,
  Substitute(Bytes),
  Delay(Bytes),
}

pub type Filter = Arc<dyn Fn(Tag, &str, &Bytes) -> Verdict + Send + Sync>;

#[derive(Default)]
struct Table {
  forward: HashMap<String, Filter>,
  receive: HashMap<String, Filter>,
}

/// Registry of per-peer filters, shared between the dispatcher's send
/// and receive paths.
#[derive(Clone, Default)]
pub struct InterpositionTable {
  inner: Arc<RwLock<Table>>,
}

impl InterpositionTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Installs filters for `peer`, replacing any previously installed
  /// ones atomically.
  pub fn add_interposition_fun(&self, peer: &str, tag: Tag, filter: Filter) {
    let mut table = self.inner.write();
    match tag {
      Tag::ForwardMessage => table.forward.insert(peer.to_string(), filter),
      Tag::ReceiveMessage => table.receive.insert(peer.to_string(), filter),
    };
  }

  pub fn remove_interposition_fun(&self, peer: &str, tag: Tag) {
    let mut table = self.inner.write();
    match tag {
      Tag::ForwardMessage => table.forward.remove(peer),
      Tag::ReceiveMessage => table.receive.remove(peer),
    };
  }

  /// Evaluates the installed filter, if any, returning `Verdict::Pass`
  /// unchanged when none is installed for this peer/tag.
  pub fn evaluate(&self, tag: Tag, peer: &str, payload: Bytes) -> Verdict {
    let table = self.inner.read();
    let filter = match tag {
      Tag::ForwardMessage => table.forward.get(peer),
      Tag::ReceiveMessage => table.receive.get(peer),
    };
    match filter {
      Some(f) => f(tag, peer, &payload),
      None => Verdict::Pass(payload),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unfiltered_peer_passes_through() {
    let table = InterpositionTable::new();
    match table.evaluate(Tag::ForwardMessage, "n1", Bytes::from_static(b"hi")) {
      Verdict::Pass(b) => assert_eq!(b, Bytes::from_static(b"hi")),
      _ => panic!("expected pass"),
    }
  }

  #[test]
  fn installed_filter_can_drop() {
    let table = InterpositionTable::new();
    table.add_interposition_fun(
      "n1",
      Tag::ForwardMessage,
      Arc::new(|_, _, _| Verdict::Drop),
    );
    assert!(matches!(
      table.evaluate(Tag::ForwardMessage, "n1", Bytes::from_static(b"hi")),
      Verdict::Drop
    ));
    assert!(matches!(
      table.evaluate(Tag::ForwardMessage, "n2", Bytes::from_static(b"hi")),
      Verdict::Pass(_)
    ));
  }

  #[test]
  fn remove_restores_pass_through() {
    let table = InterpositionTable::new();
    table.add_interposition_fun(
      "n1",
      Tag::ReceiveMessage,
      Arc::new(|_, _, _| Verdict::Drop),
    );
    table.remove_interposition_fun("n1", Tag::ReceiveMessage);
    assert!(matches!(
      table.evaluate(Tag::ReceiveMessage, "n1", Bytes::from_static(b"hi")),
      Verdict::Pass(_)
    ));
  }
}
