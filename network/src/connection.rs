//! Per-connection actors: one outbound writer and one inbound reader
//! per open [`PeerSocket`], matching the split between "Outbound
//! client" and inbound framing in the component design. A connection
//! is full-duplex regardless of which side dialed; the writer/reader
//! split only reflects which task owns which half of the socket.

use {
  crate::{
    config::{Config, RemoteRefFormat},
    wire::{self, Frame},
  },
  bytes::Bytes,
  futures::stream::{SplitSink, SplitStream},
  futures::{SinkExt, StreamExt},
  std::sync::{atomic::AtomicBool, Arc},
  tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle},
};

/// Delivered to whichever component is interested in frames received
/// on a given (peer, channel) pair: the membership manager for
/// [`Frame::Membership`] and hello traffic, the dispatcher for
/// [`Frame::App`].
#[derive(Debug)]
pub struct Delivery {
  pub peer: String,
  pub channel: String,
  pub slot: usize,
  pub frame: Frame,
}

/// One end of an established, hello-exchanged connection. Owned by the
/// [`crate::registry::ConnectionRegistry`]; dropping it tears down the
/// writer and reader tasks.
pub struct Connection {
  pub writer: tokio::sync::mpsc::UnboundedSender<Frame>,
  pub closed: Arc<AtomicBool>,
  writer_task: JoinHandle<()>,
  reader_task: JoinHandle<()>,
}

impl Connection {
  /// Spawns the writer and reader tasks for an established socket and
  /// returns a handle to send frames through it. `closed_notify` is
  /// invoked from the reader task the moment the peer goes away so the
  /// registry can react without polling.
  pub fn spawn(
    socket: crate::socket::PeerSocket,
    peer: String,
    channel: String,
    slot: usize,
    config: Config,
    deliver: tokio::sync::mpsc::UnboundedSender<Delivery>,
    closed_notify: tokio::sync::mpsc::UnboundedSender<(String, String, usize)>,
  ) -> Self {
    let (sink, stream) = socket.split_framed();
    let closed = Arc::new(AtomicBool::new(false));

    let (writer_tx, writer_rx) = tokio::sync::mpsc::unbounded_channel();
    let compression = config.channel(&channel).and_then(|c| c.compression);
    let writer_task = tokio::spawn(run_writer(
      sink,
      writer_rx,
      config.remote_ref_format,
      compression,
      config.binary_padding,
      config.egress_delay,
    ));

    let reader_task = tokio::spawn(run_reader(
      stream,
      peer.clone(),
      channel.clone(),
      slot,
      config.remote_ref_format,
      config.ingress_delay,
      deliver,
      closed.clone(),
      closed_notify,
    ));

    Self {
      writer: writer_tx,
      closed,
      writer_task,
      reader_task,
    }
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(std::sync::atomic::Ordering::Acquire)
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    self.writer_task.abort();
    self.reader_task.abort();
  }
}

async fn run_writer(
  mut sink: SplitSink<crate::socket::FramedSocket, Bytes>,
  mut rx: UnboundedReceiver<Frame>,
  remote_ref_format: RemoteRefFormat,
  compression: Option<u32>,
  binary_padding: Option<usize>,
  egress_delay: std::time::Duration,
) {
  while let Some(frame) = rx.recv().await {
    if !egress_delay.is_zero() {
      tokio::time::sleep(egress_delay).await;
    }
    let bytes = wire::encode(&frame, remote_ref_format, compression, binary_padding);
    if sink.send(bytes).await.is_err() {
      break;
    }
  }
}

#[allow(clippy::too_many_arguments)]
async fn run_reader(
  mut stream: SplitStream<crate::socket::FramedSocket>,
  peer: String,
  channel: String,
  slot: usize,
  remote_ref_format: RemoteRefFormat,
  ingress_delay: std::time::Duration,
  deliver: tokio::sync::mpsc::UnboundedSender<Delivery>,
  closed: Arc<AtomicBool>,
  closed_notify: tokio::sync::mpsc::UnboundedSender<(String, String, usize)>,
) {
  loop {
    match stream.next().await {
      Some(Ok(bytes)) => {
        if !ingress_delay.is_zero() {
          tokio::time::sleep(ingress_delay).await;
        }
        match wire::decode(&bytes, remote_ref_format) {
          Ok(frame) => {
            let _ = deliver.send(Delivery {
              peer: peer.clone(),
              channel: channel.clone(),
              slot,
              frame,
            });
          }
          Err(e) => {
            tracing::warn!("dropping bad frame from {peer}: {e}");
          }
        }
      }
      Some(Err(_)) | None => break,
    }
  }
  closed.store(true, std::sync::atomic::Ordering::Release);
  let _ = closed_notify.send((peer, channel, slot));
}
