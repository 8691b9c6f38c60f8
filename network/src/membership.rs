//! HyParView: a membership protocol for reliable gossip-based broadcast.
//! Leitão, João & Pereira, José & Rodrigues, Luís. (2007). 419-429.
//! 10.1109/DSN.2007.56.
//!
//! Maintains the active and passive views described in the paper and
//! persists a snapshot of both to disk so a restarted node does not have
//! to rejoin from scratch.

use {
  crate::{
    config::{Config, NodeSpec, DEFAULT_CHANNEL},
    events::MembershipEvents,
    registry::{ConnectionRegistry, PickHint},
    wire::{
      Disconnect,
      ForwardJoin,
      Frame,
      MembershipMessage,
      Neighbor,
      NeighborAccepted,
      NeighborRejected,
      Priority,
      Shuffle,
      ShuffleReply,
    },
  },
  metrics::gauge,
  parking_lot::RwLock,
  rand::seq::IteratorRandom,
  std::{
    collections::HashMap,
    io::Write,
    sync::Arc,
  },
  tracing::debug,
};

/// Snapshot of the two views, as persisted to
/// `<data_dir>/peer_service/cluster_state`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ViewSnapshot {
  pub active: Vec<NodeSpec>,
  pub passive: Vec<NodeSpec>,
}

struct Inner {
  config: Config,
  active: HashMap<String, NodeSpec>,
  passive: HashMap<String, NodeSpec>,
  /// Peers we have sent a join/forward_join/neighbor to and are
  /// waiting on a neighbor_accepted/neighbor_rejected for.
  pending: HashMap<String, NodeSpec>,
  /// Active peers currently believed unreachable; kept distinct from
  /// `active` so a late neighbor_accepted/disconnect can still resolve
  /// cleanly instead of racing a replacement that is already underway.
  suspected: HashMap<String, NodeSpec>,
  registry: Arc<ConnectionRegistry>,
  events: MembershipEvents,
  /// Peers an eviction decided to close, collected rather than closed
  /// immediately: `ConnectionRegistry::close` fires `on_down`
  /// synchronously, which calls back into `on_peer_down` and takes this
  /// same write lock. Callers drain this and close after dropping the
  /// guard.
  pending_closes: Vec<String>,
}

/// Handle to the membership state machine for one node. Cheap to clone;
/// every clone shares the same underlying state.
#[derive(Clone)]
pub struct Membership {
  inner: Arc<RwLock<Inner>>,
}

impl Membership {
  pub fn new(config: Config, registry: Arc<ConnectionRegistry>, events: MembershipEvents) -> Self {
    let this = Self {
      inner: Arc::new(RwLock::new(Inner {
        config,
        active: HashMap::new(),
        passive: HashMap::new(),
        pending: HashMap::new(),
        suspected: HashMap::new(),
        registry,
        events,
        pending_closes: Vec::new(),
      })),
    };

    if let Some(snapshot) = this.load_persisted() {
      let mut inner = this.inner.write();
      for peer in snapshot.active {
        inner.active.insert(peer.name.clone(), peer);
      }
      for peer in snapshot.passive {
        inner.passive.insert(peer.name.clone(), peer);
      }
    }

    this
  }

  pub fn active_view(&self) -> Vec<NodeSpec> {
    self.inner.read().active.values().cloned().collect()
  }

  pub fn passive_view(&self) -> Vec<NodeSpec> {
    self.inner.read().passive.values().cloned().collect()
  }

  pub fn is_active(&self, peer: &str) -> bool {
    self.inner.read().active.contains_key(peer)
  }

  /// Looks up the [`NodeSpec`] for an active peer by name, used to dial
  /// extra channel connections on demand.
  pub fn active_peer(&self, peer: &str) -> Option<NodeSpec> {
    self.inner.read().active.get(peer).cloned()
  }

  /// Looks up a [`NodeSpec`] we already know by one of its listen
  /// addresses, searching active, passive and pending in that order.
  /// Used by the inbound handshake to detect a peer whose hello names
  /// do not match who we expected to be dialing in from that address.
  pub fn peer_by_addr(&self, addr: &std::net::SocketAddr) -> Option<NodeSpec> {
    let inner = self.inner.read();
    let found = [&inner.active, &inner.passive, &inner.pending]
      .into_iter()
      .flat_map(|set| set.values())
      .find(|spec| spec.listen_addrs.contains(addr))
      .cloned();
    found
  }

  pub fn get_local_state(&self) -> ViewSnapshot {
    let inner = self.inner.read();
    ViewSnapshot {
      active: inner.active.values().cloned().collect(),
      passive: inner.passive.values().cloned().collect(),
    }
  }

  /// Attempts to join the cluster through `contact`: marks it pending,
  /// connects, then issues a `forward_join(self, ARWL)` to it. The
  /// pending marker is what lets [`Self::on_peer_up`] perform the local
  /// join acceptance once the connection actually comes up.
  pub async fn join(&self, contact: NodeSpec) -> Result<(), crate::error::Error> {
    self.inner.write().pending.insert(contact.name.clone(), contact.clone());
    // Clone the registry handle and drop the lock before awaiting: `ensure`
    // may connect synchronously and fire the `on_up` hook back into this
    // same `Inner`, which would deadlock against a guard held across the
    // await point.
    let registry = self.inner.read().registry.clone();
    registry.ensure(&contact, DEFAULT_CHANNEL, 0).await?;
    let (this_node, ttl) = {
      let inner = self.inner.read();
      (inner.config.this_node.clone(), inner.config.arwl)
    };
    self.send(
      &contact.name,
      MembershipMessage::ForwardJoin(ForwardJoin { node: this_node, ttl }),
    );
    Ok(())
  }

  /// Invoked by the connection registry's `on_up` hook whenever a peer
  /// transitions to fully-connected. Only peers we are expecting --
  /// recorded in `pending` by [`Self::join`] or
  /// [`Inner::send_neighbor_request`] -- trigger any action here.
  pub fn on_peer_up(&self, peer: &NodeSpec) {
    let mut inner = self.inner.write();
    if !inner.pending.contains_key(&peer.name) {
      return;
    }
    let is_replacement_candidate =
      inner.passive.contains_key(&peer.name) && !inner.suspected.is_empty();
    if is_replacement_candidate {
      let high_priority = inner.active.is_empty();
      inner.send_neighbor_request(peer.clone(), high_priority);
    } else {
      inner.add_to_active(peer.clone());
      let ttl = inner.config.arwl;
      let others: Vec<String> = inner
        .active
        .keys()
        .filter(|p| **p != peer.name)
        .cloned()
        .collect();
      for other in others {
        inner.send_to(
          &other,
          MembershipMessage::ForwardJoin(ForwardJoin { node: peer.clone(), ttl }),
        );
      }
      inner.pending.remove(&peer.name);
    }
    inner.persist();
    let victims = std::mem::take(&mut inner.pending_closes);
    let registry = inner.registry.clone();
    drop(inner);
    Self::close_pending(registry, victims);
  }

  /// Gracefully leaves the cluster: disconnects from every active
  /// peer and, if `config.broadcast` is set, tells them so instead of
  /// just dropping the link.
  pub fn leave(&self) {
    let mut inner = self.inner.write();
    let broadcast = inner.config.broadcast;
    let peers: Vec<String> = inner.active.keys().cloned().collect();
    for name in &peers {
      if broadcast {
        inner.send_to(name, MembershipMessage::Disconnect(Disconnect {
          graceful: true,
        }));
      }
      inner.active.remove(name);
    }
    inner.persist();
    let registry = inner.registry.clone();
    drop(inner);
    // `close` synchronously fires the `on_down` hook, which calls back
    // into `on_peer_down` and takes the write lock itself -- it must
    // never run while we are still holding it.
    for name in &peers {
      registry.close(name);
    }
  }

  fn send(&self, peer: &str, msg: MembershipMessage) {
    self.inner.read().send_to(peer, msg);
  }

  /// Drains any victims `free_up_active_slot` queued up while `inner` was
  /// locked and closes them now that the guard is gone. Must be called
  /// after the guard holding `inner` is dropped: `registry.close` fires
  /// `on_down` synchronously, which takes the same write lock.
  fn close_pending(registry: Arc<ConnectionRegistry>, victims: Vec<String>) {
    for victim in victims {
      registry.close(&victim);
    }
  }

  pub fn consume_forward_join(&self, sender: &str, msg: ForwardJoin) {
    let mut inner = self.inner.write();
    if msg.node.name == inner.config.this_node.name {
      return;
    }
    // The textbook `|Active| = 1` accept condition assumes a cluster
    // that already has at least two members elsewhere relaying the
    // introduction; it never fires for a from-scratch two-node
    // bootstrap where the receiving node's active view starts empty.
    // Accepting whenever there is still room generalizes the same
    // intent (immediate acceptance while the active view isn't full)
    // without that bootstrap gap.
    if msg.ttl == 0 || inner.active.len() < inner.config.active_view_size {
      inner.try_add_to_active(msg.node.clone());
    } else if msg.ttl == inner.config.prwl {
      inner.add_to_passive(msg.node.clone());
    }

    if msg.ttl > 0 {
      let next_hop = inner
        .active
        .keys()
        .filter(|p| *p != sender && **p != msg.node.name)
        .choose(&mut rand::thread_rng())
        .cloned();
      if let Some(next_hop) = next_hop {
        inner.send_to(
          &next_hop,
          MembershipMessage::ForwardJoin(ForwardJoin {
            node: msg.node.clone(),
            ttl: msg.ttl - 1,
          }),
        );
      }
    }
    inner.persist();
    let victims = std::mem::take(&mut inner.pending_closes);
    let registry = inner.registry.clone();
    drop(inner);
    Self::close_pending(registry, victims);
  }

  pub fn consume_neighbor(&self, sender: &str, msg: Neighbor) {
    let mut inner = self.inner.write();
    if sender != msg.peer.name {
      return;
    }
    let accept = inner.active.contains_key(sender)
      || inner.active.len() < inner.config.active_view_size
      || msg.priority == Priority::High;

    if accept {
      if inner.active.len() >= inner.config.active_view_size
        && !inner.active.contains_key(sender)
      {
        inner.free_up_active_slot();
      }
      inner.add_to_active(msg.peer.clone());
      inner.send_to(
        sender,
        MembershipMessage::NeighborAccepted(NeighborAccepted {
          peer: inner.config.this_node.clone(),
        }),
      );
    } else {
      inner.send_to(
        sender,
        MembershipMessage::NeighborRejected(NeighborRejected {
          peer: inner.config.this_node.clone(),
        }),
      );
    }
    inner.persist();
    let victims = std::mem::take(&mut inner.pending_closes);
    let registry = inner.registry.clone();
    drop(inner);
    Self::close_pending(registry, victims);
  }

  pub fn consume_neighbor_accepted(&self, sender: &str, msg: NeighborAccepted) {
    let mut inner = self.inner.write();
    inner.pending.remove(sender);
    inner.suspected.remove(sender);
    inner.add_to_active(msg.peer);
    inner.persist();
    let victims = std::mem::take(&mut inner.pending_closes);
    let registry = inner.registry.clone();
    drop(inner);
    Self::close_pending(registry, victims);
  }

  /// A rejected neighbor request means the contacted peer was full and
  /// not treating us as high priority; fall back to trying a random
  /// passive peer instead of leaving the slot unfilled.
  pub fn consume_neighbor_rejected(&self, sender: &str, _msg: NeighborRejected) {
    let mut inner = self.inner.write();
    inner.pending.remove(sender);
    let replacement = inner
      .passive
      .values()
      .filter(|p| p.name != sender)
      .choose(&mut rand::thread_rng())
      .cloned();
    if let Some(replacement) = replacement {
      let high = inner.active.is_empty();
      inner.send_neighbor_request(replacement, high);
    }
  }

  pub fn consume_shuffle(&self, sender: &str, msg: Shuffle) {
    let mut inner = self.inner.write();

    if msg.ttl > 0 && inner.active.len() > 1 {
      let forward_target = inner
        .active
        .values()
        .filter(|p| p.name != sender && p.name != msg.sender.name)
        .choose(&mut rand::thread_rng())
        .cloned();
      if let Some(target) = forward_target {
        inner.send_to(
          &target.name,
          MembershipMessage::Shuffle(Shuffle {
            sender: msg.sender,
            exchange: msg.exchange,
            ttl: msg.ttl - 1,
          }),
        );
      }
    } else {
      let mut incoming: HashMap<String, NodeSpec> = msg
        .exchange
        .iter()
        .cloned()
        .map(|p| (p.name.clone(), p))
        .collect();

      let k = inner.config.k_passive;
      let reply_sample: Vec<NodeSpec> = inner
        .active
        .values()
        .chain(inner.passive.values())
        .filter(|p| !incoming.contains_key(&p.name))
        .cloned()
        .choose_multiple(&mut rand::thread_rng(), k);
      inner.send_to(
        &msg.sender.name,
        MembershipMessage::ShuffleReply(ShuffleReply { exchange: reply_sample }),
      );

      incoming.retain(|name, _| {
        name != &inner.config.this_node.name
          && !inner.active.contains_key(name)
          && !inner.passive.contains_key(name)
      });
      for (_, peer) in incoming {
        inner.add_to_passive(peer);
      }
    }
    inner.persist();
  }

  pub fn consume_shuffle_reply(&self, _sender: &str, msg: ShuffleReply) {
    let mut inner = self.inner.write();
    for peer in msg.exchange {
      if peer.name != inner.config.this_node.name
        && !inner.active.contains_key(&peer.name)
      {
        inner.add_to_passive(peer);
      }
    }
    inner.persist();
  }

  pub fn consume_disconnect(&self, sender: &str, msg: Disconnect) {
    let mut inner = self.inner.write();
    let Some(peer) = inner.active.remove(sender) else {
      return;
    };
    if msg.graceful {
      inner.add_to_passive(peer);
    }
    inner.persist();
    let registry = inner.registry.clone();
    drop(inner);
    // See `leave`: `close` fires `on_down` synchronously, which takes
    // the write lock itself.
    registry.close(sender);
  }

  /// Invoked by the connection registry's `on_down` hook when a peer's
  /// last live connection on every channel is gone without a prior
  /// graceful disconnect. The peer is not removed outright: it moves to
  /// `suspected` and a replacement neighbor is sought from the passive
  /// view, matching the paper's reactive active-view maintenance.
  pub fn on_peer_down(&self, peer: &NodeSpec) {
    let mut inner = self.inner.write();
    if inner.active.remove(&peer.name).is_none() {
      return;
    }
    inner.suspected.insert(peer.name.clone(), peer.clone());
    let replacement = inner
      .passive
      .values()
      .filter(|p| p.name != peer.name)
      .choose(&mut rand::thread_rng())
      .cloned();
    if let Some(replacement) = replacement {
      let high = inner.active.is_empty();
      inner.send_neighbor_request(replacement, high);
    }
    inner.persist();
  }

  /// Runs the periodic shuffle tick forever. Spawned once per node.
  pub async fn run_shuffle_timer(self) {
    let interval = self.inner.read().config.maintenance_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
      ticker.tick().await;
      self.shuffle_tick();
    }
  }

  fn shuffle_tick(&self) {
    let inner = self.inner.write();
    let Some(target) = inner
      .active
      .values()
      .choose(&mut rand::thread_rng())
      .cloned()
    else {
      return;
    };
    let ka = inner.config.k_active;
    let kp = inner.config.k_passive;
    let exchange: Vec<NodeSpec> = inner
      .active
      .values()
      .choose_multiple(&mut rand::thread_rng(), ka)
      .into_iter()
      .cloned()
      .chain(
        inner
          .passive
          .values()
          .choose_multiple(&mut rand::thread_rng(), kp)
          .into_iter()
          .cloned(),
      )
      .collect();
    let ttl = inner.config.arwl;
    let this_node = inner.config.this_node.clone();
    inner.send_to(
      &target.name,
      MembershipMessage::Shuffle(Shuffle {
        sender: this_node,
        exchange,
        ttl,
      }),
    );
  }

  fn load_persisted(&self) -> Option<ViewSnapshot> {
    let data_dir = self.inner.read().config.data_dir.clone()?;
    let path = data_dir.join("peer_service").join("cluster_state");
    let bytes = std::fs::read(path).ok()?;
    rmp_serde::from_slice(&bytes).ok()
  }
}

impl Inner {
  fn send_to(&self, peer: &str, msg: MembershipMessage) {
    let Ok(writer) = self.registry.pick(peer, DEFAULT_CHANNEL, PickHint::Monotonic) else {
      debug!("membership: no connection to {peer}, dropping {msg:?}");
      return;
    };
    let _ = writer.send(Frame::Membership(msg));
  }

  fn send_neighbor_request(&mut self, peer: NodeSpec, high_priority: bool) {
    let priority = if high_priority { Priority::High } else { Priority::Low };
    self.send_to(
      &peer.name,
      MembershipMessage::Neighbor(Neighbor {
        peer: self.config.this_node.clone(),
        priority,
      }),
    );
    self.pending.insert(peer.name.clone(), peer);
  }

  fn try_add_to_active(&mut self, peer: NodeSpec) {
    if self.active.len() < self.config.active_view_size {
      self.add_to_active(peer);
    } else {
      self.add_to_passive(peer);
    }
  }

  fn add_to_active(&mut self, peer: NodeSpec) {
    if peer.name == self.config.this_node.name || self.active.contains_key(&peer.name) {
      return;
    }
    if self.active.len() >= self.config.active_view_size {
      self.free_up_active_slot();
    }
    self.passive.remove(&peer.name);
    self.suspected.remove(&peer.name);
    self.active.insert(peer.name.clone(), peer);
  }

  /// Evicts a random active peer to passive view to make room. Active
  /// membership always takes precedence over passive: this is only
  /// called when we are about to insert a new active peer.
  fn free_up_active_slot(&mut self) {
    let victim = self
      .active
      .keys()
      .choose(&mut rand::thread_rng())
      .cloned();
    if let Some(victim) = victim {
      if let Some(peer) = self.active.remove(&victim) {
        self.send_to(&victim, MembershipMessage::Disconnect(Disconnect { graceful: true }));
        self.pending_closes.push(victim);
        self.add_to_passive(peer);
      }
    }
  }

  fn add_to_passive(&mut self, peer: NodeSpec) {
    if peer.name == self.config.this_node.name || self.active.contains_key(&peer.name) {
      return;
    }
    self.passive.insert(peer.name.clone(), peer);
    if self.passive.len() > self.config.passive_view_size {
      if let Some(victim) = self.passive.keys().choose(&mut rand::thread_rng()).cloned() {
        self.passive.remove(&victim);
      }
    }
  }

  /// Atomically persists the current views: write to a temp file in the
  /// same directory, then rename over the real path, so a crash mid-write
  /// never leaves a truncated snapshot behind.
  fn persist(&self) {
    gauge!("active_view_size", self.active.len() as f64);
    gauge!("passive_view_size", self.passive.len() as f64);
    self.events.publish(self.active.values().cloned().collect());
    let Some(data_dir) = &self.config.data_dir else {
      return;
    };
    let dir = data_dir.join("peer_service");
    if std::fs::create_dir_all(&dir).is_err() {
      return;
    }
    let snapshot = ViewSnapshot {
      active: self.active.values().cloned().collect(),
      passive: self.passive.values().cloned().collect(),
    };
    let Ok(bytes) = rmp_serde::to_vec(&snapshot) else {
      return;
    };
    let tmp_path = dir.join("cluster_state.tmp");
    let final_path = dir.join("cluster_state");
    let Ok(mut file) = std::fs::File::create(&tmp_path) else {
      return;
    };
    if file.write_all(&bytes).is_err() {
      return;
    }
    drop(file);
    let _ = std::fs::rename(tmp_path, final_path);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn spec(name: &str) -> NodeSpec {
    NodeSpec::new(name, vec!["127.0.0.1:0".parse().unwrap()])
  }

  #[test]
  fn active_view_never_contains_self() {
    let config = Config::new(spec("n1"));
    let (registry, _watcher) =
      ConnectionRegistry::new(config.clone(), tokio::sync::mpsc::unbounded_channel().0);
    let mut inner = Inner {
      config,
      active: HashMap::new(),
      passive: HashMap::new(),
      pending: HashMap::new(),
      suspected: HashMap::new(),
      registry: Arc::new(registry),
      events: crate::events::MembershipEvents::new(),
      pending_closes: Vec::new(),
    };
    inner.add_to_active(spec("n1"));
    assert!(inner.active.is_empty());
  }

  #[test]
  fn active_view_evicts_to_passive_when_full() {
    let mut config = Config::new(spec("n1"));
    config.active_view_size = 1;
    let (registry, _watcher) =
      ConnectionRegistry::new(config.clone(), tokio::sync::mpsc::unbounded_channel().0);
    let mut inner = Inner {
      config,
      active: HashMap::new(),
      passive: HashMap::new(),
      pending: HashMap::new(),
      suspected: HashMap::new(),
      registry: Arc::new(registry),
      events: crate::events::MembershipEvents::new(),
      pending_closes: Vec::new(),
    };
    inner.add_to_active(spec("n2"));
    inner.add_to_active(spec("n3"));
    assert_eq!(inner.active.len(), 1);
    assert_eq!(inner.passive.len(), 1);
  }
}
