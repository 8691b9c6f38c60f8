mod causal;
mod config;
mod connection;
mod dispatch;
mod error;
mod events;
mod inbound;
mod interposition;
mod mailbox;
mod membership;
mod registry;
mod socket;
mod wire;

use {
  crate::{
    causal::CausalLayer,
    config::NodeSpec,
    connection::Delivery,
    dispatch::{Dispatcher, LocalDeliver, SendOptions as Options},
    events::MembershipEvents,
    interposition::InterpositionTable,
    mailbox::Mailbox,
    membership::Membership,
    registry::ConnectionRegistry,
    wire::{Frame, RemoteRef},
  },
  bytes::Bytes,
  std::sync::Arc,
  tokio::sync::mpsc::UnboundedReceiver,
};

pub use {
  config::{ChannelConfig, Config, NodeSpec as Node, RemoteRefFormat, TlsConfig, TlsOptions},
  dispatch::SendOptions,
  error::{Error, Result},
  interposition::{Filter, Tag, Verdict},
  membership::ViewSnapshot,
  wire::RemoteRef as Destination,
};

/// Entry point to the library. Construct one per node with
/// [`Partisan::start`], which spawns every background task (accept
/// loops, the shuffle timer, the connection-closed watcher) and
/// returns a handle cheap to clone and share across the application.
#[derive(Clone)]
pub struct Partisan {
  config: Config,
  registry: Arc<ConnectionRegistry>,
  membership: Membership,
  dispatcher: Arc<Dispatcher>,
  events: MembershipEvents,
  interposition: InterpositionTable,
}

impl Partisan {
  /// Builds and starts a node: binds every listen address, starts the
  /// membership maintenance timer, and wires the dispatcher to deliver
  /// local application frames through the returned receiver.
  pub async fn start(config: Config) -> Result<(Self, UnboundedReceiver<(RemoteRef, Bytes)>)> {
    let (deliver_tx, mut deliver_rx) = Mailbox::<Delivery>::new().split();
    let (registry, closed_watcher) = ConnectionRegistry::new(config.clone(), deliver_tx.clone());
    let registry = Arc::new(registry);
    tokio::spawn(closed_watcher.run());

    let events = MembershipEvents::new();
    let membership = Membership::new(config.clone(), registry.clone(), events.clone());

    {
      let membership = membership.clone();
      registry.on_down(move |peer| membership.on_peer_down(peer));
    }
    {
      let membership = membership.clone();
      registry.on_up(move |peer| membership.on_peer_up(peer));
    }

    let interposition = InterpositionTable::new();
    let causal = CausalLayer::new();

    let (local_tx, local_rx) = tokio::sync::mpsc::unbounded_channel::<(RemoteRef, Bytes)>();
    let local_deliver: LocalDeliver = Arc::new(move |dest, payload| {
      let _ = local_tx.send((dest.clone(), payload));
    });

    let dispatcher = Arc::new(Dispatcher::new(
      config.clone(),
      registry.clone(),
      membership.clone(),
      interposition.clone(),
      causal,
      local_deliver,
    ));

    for addr in config.this_node.listen_addrs.clone() {
      let task_config = config.clone();
      let registry = registry.clone();
      let membership = membership.clone();
      tokio::spawn(async move {
        if let Err(e) = inbound::accept_loop(addr, task_config, registry, membership).await {
          tracing::error!(%addr, error = %e, "accept loop exited");
        }
      });
    }

    tokio::spawn(membership.clone().run_shuffle_timer());

    {
      let dispatcher = dispatcher.clone();
      let membership = membership.clone();
      tokio::spawn(async move {
        while let Some(delivery) = deliver_rx.recv().await {
          tracing::trace!(
            peer = %delivery.peer,
            channel = %delivery.channel,
            slot = delivery.slot,
            "frame delivered"
          );
          match delivery.frame {
            Frame::Hello(_) => {}
            Frame::Membership(ref msg) => {
              route_membership(&membership, &delivery.peer, msg.clone())
            }
            Frame::App { .. } => {
              if let Some((peer, causal, app)) = dispatch::as_app_frame(delivery) {
                dispatcher.on_app_frame(&peer, causal, app);
              }
            }
          }
        }
      });
    }

    Ok((
      Self {
        config,
        registry,
        membership,
        dispatcher,
        events,
        interposition,
      },
      local_rx,
    ))
  }

  pub async fn join(&self, contact: NodeSpec) -> Result<()> {
    self.membership.join(contact).await
  }

  pub fn leave(&self) {
    self.membership.leave();
  }

  pub fn members(&self) -> Vec<NodeSpec> {
    self.membership.active_view()
  }

  pub fn passive_members(&self) -> Vec<NodeSpec> {
    self.membership.passive_view()
  }

  pub fn is_active_peer(&self, peer: &str) -> bool {
    self.membership.is_active(peer)
  }

  pub fn get_local_state(&self) -> membership::ViewSnapshot {
    self.membership.get_local_state()
  }

  pub async fn send(&self, destination: &RemoteRef, payload: Bytes, options: Options) -> Result<()> {
    self.dispatcher.send(destination, payload, options).await
  }

  pub async fn forward(
    &self,
    destination: &RemoteRef,
    target: RemoteRef,
    payload: Bytes,
    options: Options,
  ) -> Result<()> {
    self.dispatcher.forward(destination, target, payload, options).await
  }

  pub fn add_interposition_fun(&self, peer: &str, tag: Tag, filter: Filter) {
    self.interposition.add_interposition_fun(peer, tag, filter);
  }

  pub fn remove_interposition_fun(&self, peer: &str, tag: Tag) {
    self.interposition.remove_interposition_fun(peer, tag);
  }

  pub fn subscribe_membership_changes(&self) -> tokio::sync::broadcast::Receiver<Vec<NodeSpec>> {
    self.events.subscribe()
  }

  pub fn is_connected(&self, peer: &str) -> bool {
    self.registry.is_connected(peer)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }
}

fn route_membership(membership: &Membership, from: &str, msg: wire::MembershipMessage) {
  use wire::MembershipMessage::*;
  match msg {
    ForwardJoin(m) => membership.consume_forward_join(from, m),
    Neighbor(m) => membership.consume_neighbor(from, m),
    NeighborAccepted(m) => membership.consume_neighbor_accepted(from, m),
    NeighborRejected(m) => membership.consume_neighbor_rejected(from, m),
    Shuffle(m) => membership.consume_shuffle(from, m),
    ShuffleReply(m) => membership.consume_shuffle_reply(from, m),
    Disconnect(m) => membership.consume_disconnect(from, m),
  }
}
