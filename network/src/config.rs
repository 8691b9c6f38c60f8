use {
  serde::{Deserialize, Serialize},
  std::{collections::HashMap, net::SocketAddr, path::PathBuf, time::Duration},
};

/// Identity of a peer: a globally unique name plus the addresses it can
/// be reached on. Two specs are equal iff their names are equal --
/// addresses and channel capabilities are metadata that may legitimately
/// differ between what we heard at different times about the same peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
  pub name: String,
  pub listen_addrs: Vec<SocketAddr>,
}

impl NodeSpec {
  pub fn new(name: impl Into<String>, listen_addrs: Vec<SocketAddr>) -> Self {
    Self {
      name: name.into(),
      listen_addrs,
    }
  }
}

impl PartialEq for NodeSpec {
  fn eq(&self, other: &Self) -> bool {
    self.name == other.name
  }
}

impl Eq for NodeSpec {}

impl std::hash::Hash for NodeSpec {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.name.hash(state);
  }
}

/// A named logical lane between two peers. The set of channels is fixed
/// per node at start; a `default` channel always exists (see
/// [`Config::default`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelConfig {
  pub monotonic: bool,
  pub parallelism: usize,
  /// `None` disables compression, `Some(level)` is a flate2 level 0-9.
  pub compression: Option<u32>,
}

impl Default for ChannelConfig {
  fn default() -> Self {
    Self {
      monotonic: false,
      parallelism: 1,
      compression: None,
    }
  }
}

/// Selects how a [`crate::wire::RemoteRef`] is rendered on the wire.
/// Either encoding round-trips; the choice only has to be bit-stable
/// within one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteRefFormat {
  ImproperList,
  Uri,
}

#[derive(Debug, Clone)]
pub struct TlsOptions {
  pub cert_path: PathBuf,
  pub key_path: PathBuf,
  /// Trusted CA bundle used to verify the remote end. When absent, the
  /// platform's native root store is used.
  pub ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
  pub server: Option<TlsOptions>,
  pub client: Option<TlsOptions>,
}

impl TlsConfig {
  pub fn enabled(&self) -> bool {
    self.server.is_some() || self.client.is_some()
  }
}

/// Network-wide configuration shared by every component. One instance
/// is built per node and handed by value (it is cheap to clone) to the
/// membership manager, registry and dispatcher at construction time.
#[derive(Debug, Clone)]
pub struct Config {
  /// Identity and listen addresses of the local node.
  pub this_node: NodeSpec,

  /// Fixed set of channels this node understands, keyed by name.
  /// Always contains an entry for `"default"`.
  pub channels: HashMap<String, ChannelConfig>,

  /// HyParView active view size bound (ACTIVE_SIZE).
  pub active_view_size: usize,
  /// HyParView passive view size bound (PASSIVE_SIZE).
  pub passive_view_size: usize,
  /// Active random walk length used by forward_join (ARWL).
  pub arwl: u8,
  /// Passive random walk length; forward_join adds to the passive view
  /// once ttl reaches this value (PRWL).
  pub prwl: u8,
  /// Period of the periodic shuffle timer.
  pub maintenance_interval: Duration,
  /// Number of active-view samples included in a shuffle exchange.
  pub k_active: usize,
  /// Number of passive-view samples included in a shuffle exchange.
  pub k_passive: usize,

  /// Bound on how long a connect attempt may take before it is
  /// reported as a `connect_timeout` error.
  pub connect_timeout: Duration,

  pub tls: TlsConfig,

  /// Directory under which `peer_service/cluster_state` is persisted.
  /// `None` disables persistence entirely.
  pub data_dir: Option<PathBuf>,

  /// Sleep applied before every outbound write.
  pub egress_delay: Duration,
  /// Sleep applied before delivering every inbound frame.
  pub ingress_delay: Duration,

  /// Pad frame bodies to a fixed alignment. Off by default; exists for
  /// interop with deployments that need fixed-size frames on the wire.
  pub binary_padding: Option<usize>,

  pub remote_ref_format: RemoteRefFormat,

  /// Causal labels this node participates in.
  pub causal_labels: Vec<String>,

  /// When true, `leave` broadcasts the membership delta to the full
  /// active view instead of only tearing down local state.
  pub broadcast: bool,

  /// Accepted for wire-compatibility with deployments that also run a
  /// legacy distributed-Erlang mesh alongside Partisan; this crate does
  /// not itself speak that protocol, so the flag has no effect here.
  pub connect_disterl: bool,
}

pub const DEFAULT_CHANNEL: &str = "default";

impl Config {
  /// Constructs a config for `this_node` with every other field at its
  /// documented default, and a single `default` channel registered.
  pub fn new(this_node: NodeSpec) -> Self {
    let mut channels = HashMap::new();
    channels.insert(DEFAULT_CHANNEL.to_string(), ChannelConfig::default());
    Self {
      this_node,
      channels,
      active_view_size: 5,
      passive_view_size: 30,
      arwl: 6,
      prwl: 3,
      maintenance_interval: Duration::from_millis(10_000),
      k_active: 3,
      k_passive: 4,
      connect_timeout: Duration::from_millis(1000),
      tls: TlsConfig::default(),
      data_dir: None,
      egress_delay: Duration::ZERO,
      ingress_delay: Duration::ZERO,
      binary_padding: None,
      remote_ref_format: RemoteRefFormat::ImproperList,
      causal_labels: Vec::new(),
      broadcast: false,
      connect_disterl: false,
    }
  }

  pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
    self.channels.get(name)
  }

  pub fn is_causal_label(&self, label: &str) -> bool {
    self.causal_labels.iter().any(|l| l == label)
  }
}
