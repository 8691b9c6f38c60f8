//! Accept loop: binds every configured listen address, performs the
//! hello handshake on each newly accepted socket, and hands the result
//! to the connection registry. Frames arriving before the handshake
//! completes are rejected; a hello naming a node the listener did not
//! expect tears the socket down rather than silently accepting it.

use {
  crate::{
    config::{Config, NodeSpec},
    error::Error,
    membership::Membership,
    registry::ConnectionRegistry,
    socket::PeerSocket,
    wire::Frame,
  },
  std::{sync::Arc, time::Duration},
  tokio::net::TcpListener,
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs forever, accepting sockets on `config.this_node.listen_addrs`.
/// Intended to be spawned once per [`crate::Partisan`] instance, one
/// task per listen address.
pub async fn accept_loop(
  addr: std::net::SocketAddr,
  config: Config,
  registry: Arc<ConnectionRegistry>,
  membership: Membership,
) -> Result<(), Error> {
  let listener = TcpListener::bind(addr).await?;
  tracing::info!(%addr, "listening");

  loop {
    let (stream, peer_addr) = listener.accept().await?;
    let config = config.clone();
    let registry = registry.clone();
    let membership = membership.clone();
    tokio::spawn(async move {
      if let Err(e) = handshake_and_install(stream, peer_addr, &config, &registry, &membership).await
      {
        tracing::warn!(%peer_addr, error = %e, "inbound handshake failed");
      }
    });
  }
}

async fn handshake_and_install(
  stream: tokio::net::TcpStream,
  peer_addr: std::net::SocketAddr,
  config: &Config,
  registry: &ConnectionRegistry,
  membership: &Membership,
) -> Result<(), Error> {
  let mut socket =
    PeerSocket::from_accepted(stream, peer_addr, config.tls.server.as_ref()).await?;

  let bytes = tokio::time::timeout(HELLO_TIMEOUT, socket.recv_frame())
    .await
    .map_err(|_| Error::ConnectTimeout(peer_addr.to_string()))??
    .ok_or_else(|| Error::Closed(peer_addr.to_string()))?;

  let hello = match crate::wire::decode(&bytes, config.remote_ref_format)? {
    Frame::Hello(hello) => hello,
    other => {
      return Err(Error::BadFrame(
        peer_addr.to_string(),
        format!("expected hello, got {other:?}"),
      ))
    }
  };

  if config.channel(&hello.channel).is_none() {
    return Err(Error::UnknownChannel(hello.channel));
  }

  // Reject a hello whose name does not match a peer we already know to
  // listen on this address.
  let known = membership.peer_by_addr(&peer_addr);
  if let Some(expected) = &known {
    if expected.name != hello.node {
      return Err(Error::UnexpectedPeer {
        expected: expected.name.clone(),
        actual: hello.node,
      });
    }
  }

  let peer = known.unwrap_or_else(|| NodeSpec::new(&hello.node, vec![]));
  registry.install(peer, &hello.channel, hello.slot, socket);
  Ok(())
}
