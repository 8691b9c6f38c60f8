//! Defines the wire binary protocol messages structure for p2p communication.
//! Implements the membership exchange described in the HyParView paper:
//! https://asc.di.fct.unl.pt/~jleitao/pdf/dsn07-leitao.pdf
//! by Joao Leitao et al.

use {
  crate::{
    config::{NodeSpec, RemoteRefFormat},
    error::Error,
  },
  bytes::Bytes,
  serde::{Deserialize, Serialize},
  std::io::{Read, Write},
};

/// First frame sent on every newly opened socket. Carries the sender's
/// identity and the channel it intends to use this socket for, so the
/// listening side can route subsequent frames without an extra round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
  pub node: String,
  pub channel: String,
  /// Which parallelism slot of `channel` this socket fills. Always 0
  /// for channels configured with `parallelism = 1`.
  pub slot: usize,
}

/// Sent by a node attempting to join the cluster to any already-known
/// contact point, and relayed onward across the active view. `ttl` is
/// decremented on every hop; nodes on the last hop must add the
/// joining node to their active view even if it means evicting
/// one of their own active peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardJoin {
  pub node: NodeSpec,
  pub ttl: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
  High,
  Low,
}

/// Requests that the receiver add the sender to its active view.
/// Sent in response to JOIN/FORWARDJOIN, or when a suspected active
/// peer is being replaced from the passive view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
  pub peer: NodeSpec,
  pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborAccepted {
  pub peer: NodeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborRejected {
  pub peer: NodeSpec,
}

/// Periodic passive-view refresh. `exchange` is a sample of the sender's
/// own active and passive peers. Forwarded across the active view for
/// `ttl` hops, then answered with a [`ShuffleReply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shuffle {
  pub sender: NodeSpec,
  pub exchange: Vec<NodeSpec>,
  pub ttl: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleReply {
  pub exchange: Vec<NodeSpec>,
}

/// Informs the receiver that the sender is dropping it from its active
/// view. `graceful` distinguishes a deliberate protocol-level disconnect
/// (receiver should keep the sender in its passive view) from one
/// implying the sender may be gone for good.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disconnect {
  pub graceful: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MembershipMessage {
  ForwardJoin(ForwardJoin),
  Neighbor(Neighbor),
  NeighborAccepted(NeighborAccepted),
  NeighborRejected(NeighborRejected),
  Shuffle(Shuffle),
  ShuffleReply(ShuffleReply),
  Disconnect(Disconnect),
}

/// A destination identifier usable as a message target. Must round-trip
/// through the wire encoding bit-for-bit -- the choice of
/// [`RemoteRefFormat`](crate::config::RemoteRefFormat) is a local
/// rendering concern, the `RemoteRef` value itself is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteRef {
  /// A process registered under a well-known name on a node.
  Registered { node: String, name: String },
  /// An opaque, node-local process token.
  Process { node: String, id: u64 },
  /// A bare node name, used when the destination is the node itself.
  Node(String),
}

impl RemoteRef {
  pub fn node(&self) -> &str {
    match self {
      RemoteRef::Registered { node, .. } => node,
      RemoteRef::Process { node, .. } => node,
      RemoteRef::Node(node) => node,
    }
  }

  /// Renders to the wire string form selected by `format`. The two forms
  /// round-trip the same information; which one a cluster uses only
  /// matters for interop with peers expecting a particular shape.
  fn to_wire_string(&self, format: RemoteRefFormat) -> String {
    match format {
      RemoteRefFormat::ImproperList => match self {
        RemoteRef::Registered { node, name } => format!("{name}@{node}"),
        RemoteRef::Process { node, id } => format!("{id}@{node}"),
        RemoteRef::Node(node) => node.clone(),
      },
      RemoteRefFormat::Uri => match self {
        RemoteRef::Registered { node, name } => format!("partisan://{node}/registered/{name}"),
        RemoteRef::Process { node, id } => format!("partisan://{node}/process/{id}"),
        RemoteRef::Node(node) => format!("partisan://{node}"),
      },
    }
  }

  fn from_wire_string(s: &str, format: RemoteRefFormat) -> Result<Self, Error> {
    match format {
      RemoteRefFormat::ImproperList => match s.rsplit_once('@') {
        Some((head, node)) => match head.parse::<u64>() {
          Ok(id) => Ok(RemoteRef::Process { node: node.to_string(), id }),
          Err(_) => Ok(RemoteRef::Registered {
            node: node.to_string(),
            name: head.to_string(),
          }),
        },
        None => Ok(RemoteRef::Node(s.to_string())),
      },
      RemoteRefFormat::Uri => {
        let rest = s.strip_prefix("partisan://").ok_or_else(|| {
          Error::BadFrame("remote_ref".into(), format!("not a partisan uri: {s}"))
        })?;
        match rest.split_once('/') {
          Some((node, path)) => {
            if let Some(name) = path.strip_prefix("registered/") {
              Ok(RemoteRef::Registered {
                node: node.to_string(),
                name: name.to_string(),
              })
            } else if let Some(id) = path.strip_prefix("process/") {
              let id = id
                .parse::<u64>()
                .map_err(|e| Error::BadFrame("remote_ref".into(), e.to_string()))?;
              Ok(RemoteRef::Process { node: node.to_string(), id })
            } else {
              Err(Error::BadFrame("remote_ref".into(), format!("unknown uri path: {path}")))
            }
          }
          None => Ok(RemoteRef::Node(rest.to_string())),
        }
      }
    }
  }
}

/// Shadow of [`AppFrame`] with `target` rendered as a format-specific
/// string instead of the canonical [`RemoteRef`] enum, so the
/// configured [`RemoteRefFormat`] controls what actually goes on the
/// wire without `RemoteRef` itself needing a custom `Serialize` impl.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireAppFrame {
  Data(Bytes),
  Forward { target: String, payload: Bytes },
  DataWithId { id: u64, payload: Bytes },
  Ack { id: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WireFrame {
  Hello(Hello),
  Membership(MembershipMessage),
  App {
    causal: Option<CausalMetadata>,
    frame: WireAppFrame,
  },
}

fn to_wire(frame: &Frame, format: RemoteRefFormat) -> WireFrame {
  match frame {
    Frame::Hello(hello) => WireFrame::Hello(hello.clone()),
    Frame::Membership(msg) => WireFrame::Membership(msg.clone()),
    Frame::App { causal, frame } => WireFrame::App {
      causal: causal.clone(),
      frame: match frame {
        AppFrame::Data(payload) => WireAppFrame::Data(payload.clone()),
        AppFrame::Forward { target, payload } => WireAppFrame::Forward {
          target: target.to_wire_string(format),
          payload: payload.clone(),
        },
        AppFrame::DataWithId { id, payload } => {
          WireAppFrame::DataWithId { id: *id, payload: payload.clone() }
        }
        AppFrame::Ack { id } => WireAppFrame::Ack { id: *id },
      },
    },
  }
}

fn from_wire(frame: WireFrame, format: RemoteRefFormat) -> Result<Frame, Error> {
  Ok(match frame {
    WireFrame::Hello(hello) => Frame::Hello(hello),
    WireFrame::Membership(msg) => Frame::Membership(msg),
    WireFrame::App { causal, frame } => Frame::App {
      causal,
      frame: match frame {
        WireAppFrame::Data(payload) => AppFrame::Data(payload),
        WireAppFrame::Forward { target, payload } => AppFrame::Forward {
          target: RemoteRef::from_wire_string(&target, format)?,
          payload,
        },
        WireAppFrame::DataWithId { id, payload } => AppFrame::DataWithId { id, payload },
        WireAppFrame::Ack { id } => AppFrame::Ack { id },
      },
    },
  })
}

/// Application-level payload, opaque to the membership/dispatch layers
/// except for the envelope fields needed to route and (optionally)
/// acknowledge it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppFrame {
  Data(Bytes),
  Forward { target: RemoteRef, payload: Bytes },
  DataWithId { id: u64, payload: Bytes },
  Ack { id: u64 },
}

/// Causal metadata attached to an [`AppFrame`] when it is sent on a
/// channel carrying a causal label. Carried alongside the frame rather
/// than inside it so the causal layer can inspect dependencies without
/// decoding the application payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalMetadata {
  pub label: String,
  pub sender: String,
  pub dependency: Vec<(String, u64)>,
}

/// Every frame exchanged over a [`crate::socket::PeerSocket`] is one of
/// these three. `Hello` is only ever the first frame on a fresh socket;
/// everything after it is `Membership` or `App`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
  Hello(Hello),
  Membership(MembershipMessage),
  App {
    causal: Option<CausalMetadata>,
    frame: AppFrame,
  },
}

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_PADDED: u8 = 0b10;

/// Serialises `frame` to MessagePack, optionally deflating it, and
/// optionally padding the result up to a multiple of `padding` bytes
/// with trailing zeros -- a fixed-size trailer carries the real length
/// so [`decode`] can strip the padding back off. The leading flag byte
/// records which transforms were applied so the receiver never needs
/// to be told the sender's settings in advance.
pub fn encode(
  frame: &Frame,
  format: RemoteRefFormat,
  compression: Option<u32>,
  padding: Option<usize>,
) -> Bytes {
  let wire = to_wire(frame, format);
  let body = rmp_serde::to_vec(&wire).expect("Frame always serialises");
  let (flag, payload) = match compression {
    Some(level) => {
      let mut encoder = flate2::write::DeflateEncoder::new(
        Vec::with_capacity(body.len()),
        flate2::Compression::new(level),
      );
      encoder.write_all(&body).expect("writing to a Vec cannot fail");
      (FLAG_COMPRESSED, encoder.finish().expect("writing to a Vec cannot fail"))
    }
    None => (0u8, body),
  };

  match padding.filter(|&align| align > 1) {
    Some(align) => {
      let mut out = Vec::with_capacity(payload.len() + 5);
      out.push(flag | FLAG_PADDED);
      out.extend_from_slice(&payload);
      let unpadded_len = out.len() + 4;
      let remainder = unpadded_len % align;
      if remainder != 0 {
        out.resize(out.len() + (align - remainder), 0);
      }
      out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
      Bytes::from(out)
    }
    None => {
      let mut out = Vec::with_capacity(payload.len() + 1);
      out.push(flag);
      out.extend_from_slice(&payload);
      Bytes::from(out)
    }
  }
}

pub fn decode(bytes: &[u8], format: RemoteRefFormat) -> Result<Frame, Error> {
  let (flag, rest) = bytes
    .split_first()
    .ok_or_else(|| Error::BadFrame("?".into(), "empty frame".into()))?;

  let payload = if flag & FLAG_PADDED != 0 {
    if rest.len() < 4 {
      return Err(Error::BadFrame("?".into(), "padded frame too short for trailer".into()));
    }
    let (data_and_pad, trailer) = rest.split_at(rest.len() - 4);
    let orig_len = u32::from_be_bytes(trailer.try_into().unwrap()) as usize;
    data_and_pad
      .get(..orig_len)
      .ok_or_else(|| Error::BadFrame("?".into(), "padding trailer length out of range".into()))?
  } else {
    rest
  };

  let body = if flag & FLAG_COMPRESSED != 0 {
    let mut decoder = flate2::read::DeflateDecoder::new(payload);
    let mut out = Vec::new();
    decoder
      .read_to_end(&mut out)
      .map_err(|e| Error::BadFrame("?".into(), e.to_string()))?;
    out
  } else {
    payload.to_vec()
  };

  let wire: WireFrame =
    rmp_serde::from_slice(&body).map_err(|e| Error::BadFrame("?".into(), e.to_string()))?;
  from_wire(wire, format)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remote_ref_roundtrips_through_messagepack() {
    let refs = vec![
      RemoteRef::Node("n1".into()),
      RemoteRef::Registered {
        node: "n1".into(),
        name: "store_proc".into(),
      },
      RemoteRef::Process {
        node: "n1".into(),
        id: 42,
      },
    ];
    for r in refs {
      let bytes = rmp_serde::to_vec(&r).unwrap();
      let back: RemoteRef = rmp_serde::from_slice(&bytes).unwrap();
      assert_eq!(r, back);
    }
  }

  #[test]
  fn remote_ref_roundtrips_through_both_wire_formats() {
    let refs = vec![
      RemoteRef::Node("n1".into()),
      RemoteRef::Registered {
        node: "n1".into(),
        name: "store_proc".into(),
      },
      RemoteRef::Process {
        node: "n1".into(),
        id: 42,
      },
    ];
    for format in [RemoteRefFormat::ImproperList, RemoteRefFormat::Uri] {
      for r in &refs {
        let s = r.to_wire_string(format);
        let back = RemoteRef::from_wire_string(&s, format).unwrap();
        assert_eq!(*r, back);
      }
    }
  }

  #[test]
  fn forward_frame_encodes_with_configured_remote_ref_format() {
    let frame = Frame::App {
      causal: None,
      frame: AppFrame::Forward {
        target: RemoteRef::Registered {
          node: "n1".into(),
          name: "store_proc".into(),
        },
        payload: Bytes::from_static(b"hi"),
      },
    };
    for format in [RemoteRefFormat::ImproperList, RemoteRefFormat::Uri] {
      let bytes = encode(&frame, format, None, None);
      let back = decode(&bytes, format).unwrap();
      match back {
        Frame::App {
          frame: AppFrame::Forward { target, payload },
          ..
        } => {
          assert_eq!(
            target,
            RemoteRef::Registered {
              node: "n1".into(),
              name: "store_proc".into(),
            }
          );
          assert_eq!(payload, Bytes::from_static(b"hi"));
        }
        _ => panic!("unexpected frame variant"),
      }
    }
  }

  #[test]
  fn frame_roundtrips_through_messagepack() {
    let frame = Frame::App {
      causal: Some(CausalMetadata {
        label: "default".into(),
        sender: "n1".into(),
        dependency: vec![("n1".into(), 3)],
      }),
      frame: AppFrame::DataWithId {
        id: 7,
        payload: Bytes::from_static(b"hello"),
      },
    };
    let bytes = rmp_serde::to_vec(&frame).unwrap();
    let back: Frame = rmp_serde::from_slice(&bytes).unwrap();
    match back {
      Frame::App {
        frame: AppFrame::DataWithId { id, payload },
        ..
      } => {
        assert_eq!(id, 7);
        assert_eq!(payload, Bytes::from_static(b"hello"));
      }
      _ => panic!("unexpected frame variant"),
    }
  }

  #[test]
  fn encode_decode_roundtrips_uncompressed_and_compressed() {
    let frame = Frame::Hello(Hello {
      node: "n1".into(),
      channel: "default".into(),
      slot: 0,
    });
    for compression in [None, Some(0), Some(6), Some(9)] {
      let bytes = encode(&frame, RemoteRefFormat::ImproperList, compression, None);
      let back = decode(&bytes, RemoteRefFormat::ImproperList).unwrap();
      match back {
        Frame::Hello(h) => {
          assert_eq!(h.node, "n1");
          assert_eq!(h.channel, "default");
        }
        _ => panic!("unexpected frame variant"),
      }
    }
  }

  #[test]
  fn encode_decode_roundtrips_with_padding() {
    let frame = Frame::Hello(Hello {
      node: "n1".into(),
      channel: "default".into(),
      slot: 0,
    });
    for (compression, padding) in [(None, Some(64)), (Some(6), Some(64)), (None, Some(16))] {
      let bytes = encode(&frame, RemoteRefFormat::Uri, compression, padding);
      assert_eq!(bytes.len() % padding.unwrap(), 0);
      let back = decode(&bytes, RemoteRefFormat::Uri).unwrap();
      match back {
        Frame::Hello(h) => assert_eq!(h.node, "n1"),
        _ => panic!("unexpected frame variant"),
      }
    }
  }
}
