//! Connection registry: tracks open sockets keyed by (peer, channel,
//! slot), opens outbound connections on demand, and fires edge-triggered
//! `on_down`/`on_up` callbacks as peers transition between connected and
//! disconnected. Mutation is single-writer (the membership manager);
//! [`ConnectionRegistry::pick`] only ever takes a read lock, so the
//! dispatcher never blocks behind membership housekeeping.

use {
  crate::{
    config::{Config, NodeSpec},
    connection::{Connection, Delivery},
    error::Error,
    socket::PeerSocket,
    wire::Frame,
  },
  metrics::{gauge, increment_counter},
  parking_lot::RwLock,
  std::{collections::HashMap, sync::Arc, time::Duration},
  tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender},
};

/// How a send picks among the `parallelism` slots open on a channel.
#[derive(Debug, Clone, Copy)]
pub enum PickHint {
  /// Hash a partition key down to a slot index.
  Partition(u64),
  /// Always slot 0, regardless of configured parallelism.
  Monotonic,
  /// Spread load round-robin across open slots.
  RoundRobin(usize),
}

type DownUpHook = Arc<dyn Fn(&NodeSpec) + Send + Sync>;

struct PeerEntry {
  spec: NodeSpec,
  /// channel name -> slot index -> connection, `None` while a slot is
  /// known to exist but is mid-reconnect.
  channels: HashMap<String, Vec<Option<Connection>>>,
  /// Whether the last computed "connected" state had slot 0 open on
  /// every configured channel. Used to edge-trigger on_up/on_down.
  fully_connected: bool,
}

impl PeerEntry {
  fn new(spec: NodeSpec) -> Self {
    Self {
      spec,
      channels: HashMap::new(),
      fully_connected: false,
    }
  }

  fn is_fully_connected(&self, config: &Config) -> bool {
    config.channels.keys().all(|name| {
      self
        .channels
        .get(name)
        .and_then(|slots| slots.first())
        .map(|slot| slot.as_ref().is_some_and(|c| !c.is_closed()))
        .unwrap_or(false)
    })
  }
}

#[derive(Default)]
struct State {
  peers: HashMap<String, PeerEntry>,
}

/// Edge-triggered hooks, kept behind their own lock so firing one can
/// freely call back into [`ConnectionRegistry::pick`]/`send_to` without
/// deadlocking against the peer-state lock `install`/`close` hold while
/// computing whether a hook should fire at all.
#[derive(Default)]
struct Hooks {
  on_up: Vec<DownUpHook>,
  on_down: Vec<DownUpHook>,
}

pub struct ConnectionRegistry {
  state: Arc<RwLock<State>>,
  hooks: Arc<RwLock<Hooks>>,
  config: Config,
  deliver: UnboundedSender<Delivery>,
  closed_tx: UnboundedSender<(String, String, usize)>,
}

impl ConnectionRegistry {
  pub fn new(config: Config, deliver: UnboundedSender<Delivery>) -> (Self, ClosedWatcher) {
    let (closed_tx, closed_rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = Self {
      state: Arc::new(RwLock::new(State::default())),
      hooks: Arc::new(RwLock::new(Hooks::default())),
      config,
      deliver,
      closed_tx,
    };
    let watcher = ClosedWatcher {
      state: registry.state.clone(),
      hooks: registry.hooks.clone(),
      config: registry.config.clone(),
      rx: closed_rx,
    };
    (registry, watcher)
  }

  pub fn on_up(&self, hook: impl Fn(&NodeSpec) + Send + Sync + 'static) {
    self.hooks.write().on_up.push(Arc::new(hook));
  }

  pub fn on_down(&self, hook: impl Fn(&NodeSpec) + Send + Sync + 'static) {
    self.hooks.write().on_down.push(Arc::new(hook));
  }

  /// Ensures a connection exists for `(peer, channel, slot)`, dialing
  /// it if necessary with a bounded number of retries. Idempotent: a
  /// live connection already in the slot is left untouched.
  pub async fn ensure(
    &self,
    peer: &NodeSpec,
    channel: &str,
    slot: usize,
  ) -> Result<(), Error> {
    if self.has_live_slot(&peer.name, channel, slot) {
      return Ok(());
    }

    let addr = *peer
      .listen_addrs
      .first()
      .ok_or(Error::NoListenAddr)?;

    let mut delay = Duration::from_millis(100);
    let mut last_err = None;
    for _ in 0..3 {
      match PeerSocket::connect(addr, self.config.tls.client.as_ref(), self.config.connect_timeout)
        .await
      {
        Ok(mut socket) => {
          if let Err(e) = socket
            .send_frame(crate::wire::encode(
              &Frame::Hello(crate::wire::Hello {
                node: self.config.this_node.name.clone(),
                channel: channel.to_string(),
                slot,
              }),
              self.config.remote_ref_format,
              None,
              self.config.binary_padding,
            ))
            .await
          {
            last_err = Some(e);
            tokio::time::sleep(delay).await;
            delay *= 2;
            continue;
          }
          self.install(peer.clone(), channel, slot, socket);
          return Ok(());
        }
        Err(e) => {
          last_err = Some(e);
          tokio::time::sleep(delay).await;
          delay *= 2;
        }
      }
    }
    Err(last_err.unwrap_or(Error::ConnectTimeout(addr.to_string())))
  }

  /// Installs a connection obtained from the inbound accept loop,
  /// which has already completed the hello handshake.
  pub fn install(
    &self,
    peer: NodeSpec,
    channel: &str,
    slot: usize,
    socket: PeerSocket,
  ) {
    let conn = Connection::spawn(
      socket,
      peer.name.clone(),
      channel.to_string(),
      slot,
      self.config.clone(),
      self.deliver.clone(),
      self.closed_tx.clone(),
    );

    let mut state = self.state.write();
    let entry = state
      .peers
      .entry(peer.name.clone())
      .or_insert_with(|| PeerEntry::new(peer.clone()));
    entry.spec = peer;
    let parallelism = self
      .config
      .channel(channel)
      .map(|c| c.parallelism)
      .unwrap_or(1)
      .max(slot + 1);
    let slots = entry
      .channels
      .entry(channel.to_string())
      .or_default();
    if slots.len() < parallelism {
      slots.resize_with(parallelism, || None);
    }
    slots[slot] = Some(conn);

    let now_connected = entry.is_fully_connected(&self.config);
    let was_connected = entry.fully_connected;
    entry.fully_connected = now_connected;
    let spec = entry.spec.clone();
    let connected_count = state.peers.values().filter(|e| e.fully_connected).count();
    drop(state);

    if now_connected && !was_connected {
      increment_counter!("peers_connected");
      gauge!("connected_peers", connected_count as f64);
      let hooks = self.hooks.read().on_up.clone();
      for hook in &hooks {
        hook(&spec);
      }
    }
  }

  /// Picks a writer for an existing connection. Never dials: callers
  /// needing a guaranteed-live connection should call [`Self::ensure`]
  /// first. Returns `NotConnected` for a peer we have no record of at
  /// all, `Disconnected` for one we know but whose slot has no live
  /// connection right now.
  pub fn pick(
    &self,
    peer: &str,
    channel: &str,
    hint: PickHint,
  ) -> Result<UnboundedSender<Frame>, Error> {
    let state = self.state.read();
    let entry = state
      .peers
      .get(peer)
      .ok_or_else(|| Error::NotConnected(peer.to_string()))?;
    let slots = entry
      .channels
      .get(channel)
      .ok_or_else(|| Error::UnknownChannel(channel.to_string()))?;
    if slots.is_empty() {
      return Err(Error::Disconnected(peer.to_string()));
    }
    let monotonic = self
      .config
      .channel(channel)
      .map(|c| c.monotonic)
      .unwrap_or(false);
    let idx = if monotonic {
      0
    } else {
      match hint {
        PickHint::Partition(key) => (key as usize) % slots.len(),
        PickHint::Monotonic => 0,
        PickHint::RoundRobin(counter) => counter % slots.len(),
      }
    };
    slots
      .get(idx)
      .and_then(|s| s.as_ref())
      .filter(|c| !c.is_closed())
      .map(|c| c.writer.clone())
      .ok_or_else(|| Error::Disconnected(peer.to_string()))
  }

  pub fn close(&self, peer: &str) {
    let mut state = self.state.write();
    let removed = state.peers.remove(peer);
    let connected_count = state.peers.values().filter(|e| e.fully_connected).count();
    drop(state);
    gauge!("connected_peers", connected_count as f64);

    if let Some(entry) = removed {
      if entry.fully_connected {
        increment_counter!("peers_disconnected");
        let hooks = self.hooks.read().on_down.clone();
        for hook in &hooks {
          hook(&entry.spec);
        }
      }
    }
  }

  pub fn is_connected(&self, peer: &str) -> bool {
    self
      .state
      .read()
      .peers
      .get(peer)
      .map(|e| e.fully_connected)
      .unwrap_or(false)
  }

  fn has_live_slot(&self, peer: &str, channel: &str, slot: usize) -> bool {
    self
      .state
      .read()
      .peers
      .get(peer)
      .and_then(|e| e.channels.get(channel))
      .and_then(|slots| slots.get(slot))
      .map(|s| s.as_ref().is_some_and(|c| !c.is_closed()))
      .unwrap_or(false)
  }
}

/// Drains connection-closed notifications and updates `fully_connected`
/// state, firing `on_down` exactly once per transition. Run as its own
/// background task so `ConnectionRegistry` methods never need to poll.
pub struct ClosedWatcher {
  state: Arc<RwLock<State>>,
  hooks: Arc<RwLock<Hooks>>,
  config: Config,
  rx: UnboundedReceiver<(String, String, usize)>,
}

impl ClosedWatcher {
  pub async fn run(mut self) {
    while let Some((peer, channel, slot)) = self.rx.recv().await {
      let mut state = self.state.write();
      let Some(entry) = state.peers.get_mut(&peer) else {
        continue;
      };
      if let Some(slots) = entry.channels.get_mut(&channel) {
        if let Some(Some(conn)) = slots.get(slot) {
          if conn.is_closed() {
            slots[slot] = None;
          }
        }
      }
      let now_connected = entry.is_fully_connected(&self.config);
      let was_connected = entry.fully_connected;
      entry.fully_connected = now_connected;
      let spec = entry.spec.clone();
      let connected_count = state.peers.values().filter(|e| e.fully_connected).count();
      drop(state);

      if was_connected && !now_connected {
        increment_counter!("peers_disconnected");
        gauge!("connected_peers", connected_count as f64);
        let hooks = self.hooks.read().on_down.clone();
        for hook in &hooks {
          hook(&spec);
        }
      }
    }
  }
}
