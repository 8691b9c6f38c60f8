//! Bidirectional, message-framed transport. Framing is 4-byte
//! big-endian length || opaque payload; no partial frame ever surfaces
//! above this layer. TLS, when configured, wraps the raw TCP stream
//! before framing is applied.

use {
  crate::{config::TlsOptions, error::Error},
  bytes::Bytes,
  futures::{SinkExt, StreamExt},
  std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
  },
  tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
  },
  tokio_rustls::{TlsAcceptor, TlsConnector},
  tokio_util::codec::{Framed, LengthDelimitedCodec},
};

/// Erases the difference between a plain TCP stream and a TLS stream
/// wrapping one, so [`PeerSocket`] can hold either behind one type.
trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

pub(crate) struct BoxedStream(Box<dyn Duplex>);

impl AsyncRead for BoxedStream {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.0).poll_read(cx, buf)
  }
}

impl AsyncWrite for BoxedStream {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.0).poll_write(cx, buf)
  }

  fn poll_flush(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.0).poll_flush(cx)
  }

  fn poll_shutdown(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.0).poll_shutdown(cx)
  }
}

/// A single framed connection to a peer. Always binary-mode and
/// frame-delimited: callers only ever see whole frames.
pub struct PeerSocket {
  inner: Framed<BoxedStream, LengthDelimitedCodec>,
  pub peer_addr: SocketAddr,
}

/// Alias for the concrete `Framed` type, named so [`crate::connection`]
/// can refer to the split sink/stream halves without repeating the
/// underlying codec and stream types.
pub type FramedSocket = Framed<BoxedStream, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
  LengthDelimitedCodec::builder()
    .length_field_type::<u32>()
    .big_endian()
    .new_codec()
}

impl PeerSocket {
  /// Dials `addr`, optionally upgrading to TLS as a client. Returns
  /// [`Error::ConnectTimeout`] if the connect does not complete within
  /// `timeout`.
  pub async fn connect(
    addr: SocketAddr,
    tls: Option<&TlsOptions>,
    timeout: Duration,
  ) -> Result<Self, Error> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
      .await
      .map_err(|_| Error::ConnectTimeout(addr.to_string()))??;
    stream.set_nodelay(true)?;

    let boxed: BoxedStream = match tls {
      Some(opts) => {
        let connector = TlsConnector::from(Arc::new(build_client_config(opts)?));
        let server_name =
          rustls::pki_types::ServerName::try_from(addr.ip().to_string())
            .map_err(|e| Error::BadFrame(addr.to_string(), e.to_string()))?
            .to_owned();
        BoxedStream(Box::new(connector.connect(server_name, stream).await?))
      }
      None => BoxedStream(Box::new(stream)),
    };

    Ok(Self {
      inner: Framed::new(boxed, codec()),
      peer_addr: addr,
    })
  }

  /// Wraps an already-accepted TCP stream, optionally performing the
  /// server side of a TLS handshake.
  pub async fn from_accepted(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<&TlsOptions>,
  ) -> Result<Self, Error> {
    stream.set_nodelay(true)?;
    let boxed: BoxedStream = match tls {
      Some(opts) => {
        let acceptor = TlsAcceptor::from(Arc::new(build_server_config(opts)?));
        BoxedStream(Box::new(acceptor.accept(stream).await?))
      }
      None => BoxedStream(Box::new(stream)),
    };

    Ok(Self {
      inner: Framed::new(boxed, codec()),
      peer_addr,
    })
  }

  pub async fn send_frame(&mut self, bytes: Bytes) -> Result<(), Error> {
    self
      .inner
      .send(bytes)
      .await
      .map_err(|_| Error::Closed(self.peer_addr.to_string()))
  }

  /// Returns `Ok(None)` when the peer closed the socket gracefully
  /// after delivering all in-flight frames.
  pub async fn recv_frame(&mut self) -> Result<Option<Bytes>, Error> {
    match self.inner.next().await {
      Some(Ok(bytes)) => Ok(Some(bytes.freeze())),
      Some(Err(_)) => Err(Error::Closed(self.peer_addr.to_string())),
      None => Ok(None),
    }
  }

  /// Splits into independent sink and stream halves so a writer task
  /// and a reader task can each own one side of the socket.
  pub fn split_framed(
    self,
  ) -> (
    futures::stream::SplitSink<FramedSocket, Bytes>,
    futures::stream::SplitStream<FramedSocket>,
  ) {
    self.inner.split()
  }
}

fn build_client_config(opts: &TlsOptions) -> Result<rustls::ClientConfig, Error> {
  let ca_path = opts.ca_path.as_ref().ok_or_else(|| {
    Error::BadFrame(
      "tls".into(),
      "client TLS requires an explicit ca_path; there is no platform trust \
       store fallback"
        .into(),
    )
  })?;
  let mut roots = rustls::RootCertStore::empty();
  let ca_bytes = std::fs::read(ca_path)?;
  for cert in rustls_pemfile::certs(&mut ca_bytes.as_slice()) {
    roots.add(cert?).map_err(Error::Tls)?;
  }

  let cert_bytes = std::fs::read(&opts.cert_path)?;
  let key_bytes = std::fs::read(&opts.key_path)?;
  let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
    .collect::<Result<_, _>>()?;
  let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())?
    .ok_or_else(|| Error::BadFrame("tls".into(), "no private key in file".into()))?;

  rustls::ClientConfig::builder()
    .with_root_certificates(roots)
    .with_client_auth_cert(certs, key)
    .map_err(Error::Tls)
}

fn build_server_config(opts: &TlsOptions) -> Result<rustls::ServerConfig, Error> {
  let cert_bytes = std::fs::read(&opts.cert_path)?;
  let key_bytes = std::fs::read(&opts.key_path)?;
  let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
    .collect::<Result<_, _>>()?;
  let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())?
    .ok_or_else(|| Error::BadFrame("tls".into(), "no private key in file".into()))?;

  rustls::ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(Error::Tls)
}
