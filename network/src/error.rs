use thiserror::Error;

/// Errors surfaced across the public API. Variants map directly onto
/// the error kinds named in the propagation policy: `connect_timeout`,
/// `closed` and `unexpected_peer` are handled internally (they drive
/// suspicion/reconnection and are only visible through `on_down`);
/// `not_connected`/`disconnected`/`ack_timeout`/`bad_frame` are the ones
/// callers of [`crate::dispatch::Dispatcher`] actually see.
#[derive(Debug, Error)]
pub enum Error {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("TLS error: {0}")]
  Tls(#[from] rustls::Error),

  #[error("connect to {0} timed out")]
  ConnectTimeout(String),

  #[error("connection to {0} closed")]
  Closed(String),

  #[error("peer identified itself as {actual}, expected {expected}")]
  UnexpectedPeer { expected: String, actual: String },

  #[error("not connected to {0}")]
  NotConnected(String),

  #[error("disconnected from {0}")]
  Disconnected(String),

  #[error("failed to send to {0}")]
  SendFailed(String),

  #[error("ack for message {0} timed out after {1} attempts")]
  AckTimeout(u64, u32),

  #[error("received malformed frame from {0}: {1}")]
  BadFrame(String, String),

  #[error("node has no configured listen address")]
  NoListenAddr,

  #[error("channel {0} is not configured")]
  UnknownChannel(String),
}

pub type Result<T> = std::result::Result<T, Error>;
