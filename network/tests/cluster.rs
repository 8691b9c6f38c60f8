use {
  partisan::{ChannelConfig, Config, Destination, Node, Partisan, SendOptions, Tag, Verdict},
  std::{sync::Arc, time::Duration},
};

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if check() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_join_and_exchange_a_message() {
  let a_addr = "127.0.0.1:18901".parse().unwrap();
  let b_addr = "127.0.0.1:18902".parse().unwrap();

  let a_node = Node::new("a", vec![a_addr]);
  let b_node = Node::new("b", vec![b_addr]);

  let (a, _a_inbox) = Partisan::start(Config::new(a_node.clone())).await.unwrap();
  let (b, mut b_inbox) = Partisan::start(Config::new(b_node.clone())).await.unwrap();

  b.join(a_node.clone()).await.unwrap();

  let converged = wait_until(
    || a.members().iter().any(|n| n.name == "b") && b.members().iter().any(|n| n.name == "a"),
    Duration::from_secs(5),
  )
  .await;
  assert!(converged, "nodes did not converge: a={:?} b={:?}", a.members(), b.members());

  a.send(&Destination::Node("b".into()), vec![1, 2, 3].into(), SendOptions::default())
    .await
    .unwrap();

  let (from, payload) = tokio::time::timeout(Duration::from_secs(5), b_inbox.recv())
    .await
    .expect("timed out waiting for message")
    .expect("inbox closed");
  assert_eq!(from.node(), "a");
  assert_eq!(payload.as_ref(), &[1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn acked_send_round_trips() {
  let a_addr = "127.0.0.1:18903".parse().unwrap();
  let b_addr = "127.0.0.1:18904".parse().unwrap();

  let a_node = Node::new("a2", vec![a_addr]);
  let b_node = Node::new("b2", vec![b_addr]);

  let (a, _a_inbox) = Partisan::start(Config::new(a_node.clone())).await.unwrap();
  let (b, mut b_inbox) = Partisan::start(Config::new(b_node.clone())).await.unwrap();

  b.join(a_node.clone()).await.unwrap();
  wait_until(|| a.is_connected("b2") && b.is_connected("a2"), Duration::from_secs(5)).await;

  tokio::spawn(async move {
    let _ = b_inbox.recv().await;
  });

  let options = SendOptions {
    ack: true,
    ..Default::default()
  };
  tokio::time::timeout(
    Duration::from_secs(5),
    a.send(&Destination::Node("b2".into()), vec![9].into(), options),
  )
  .await
  .expect("ack send timed out")
  .expect("ack send failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn monotonic_channel_preserves_send_order() {
  let a_addr = "127.0.0.1:18905".parse().unwrap();
  let b_addr = "127.0.0.1:18906".parse().unwrap();

  let a_node = Node::new("c1", vec![a_addr]);
  let b_node = Node::new("c2", vec![b_addr]);

  let vnode = ChannelConfig {
    monotonic: true,
    parallelism: 4,
    compression: None,
  };
  let mut a_config = Config::new(a_node.clone());
  a_config.channels.insert("vnode".into(), vnode);
  let mut b_config = Config::new(b_node.clone());
  b_config.channels.insert("vnode".into(), vnode);

  let (a, _a_inbox) = Partisan::start(a_config).await.unwrap();
  let (b, mut b_inbox) = Partisan::start(b_config).await.unwrap();

  b.join(a_node.clone()).await.unwrap();
  wait_until(|| a.is_connected("c2") && b.is_connected("c1"), Duration::from_secs(5)).await;

  const N: u32 = 200;
  for i in 0..N {
    let options = SendOptions {
      channel: Some("vnode".into()),
      ..Default::default()
    };
    a.send(&Destination::Node("c2".into()), i.to_be_bytes().to_vec().into(), options)
      .await
      .unwrap();
  }

  let mut received = Vec::with_capacity(N as usize);
  for _ in 0..N {
    let (_, payload) = tokio::time::timeout(Duration::from_secs(5), b_inbox.recv())
      .await
      .expect("timed out waiting for message")
      .expect("inbox closed");
    received.push(u32::from_be_bytes(payload.as_ref().try_into().unwrap()));
  }

  let expected: Vec<u32> = (0..N).collect();
  assert_eq!(received, expected, "monotonic channel reordered messages");
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_delivers_to_the_addressed_target() {
  let a_addr = "127.0.0.1:18907".parse().unwrap();
  let b_addr = "127.0.0.1:18908".parse().unwrap();

  let a_node = Node::new("f1", vec![a_addr]);
  let b_node = Node::new("f2", vec![b_addr]);

  let (a, _a_inbox) = Partisan::start(Config::new(a_node.clone())).await.unwrap();
  let (b, mut b_inbox) = Partisan::start(Config::new(b_node.clone())).await.unwrap();

  b.join(a_node.clone()).await.unwrap();
  wait_until(|| a.is_connected("f2") && b.is_connected("f1"), Duration::from_secs(5)).await;

  a.forward(
    &Destination::Node("f2".into()),
    Destination::Registered {
      node: "f2".into(),
      name: "store_proc".into(),
    },
    vec![0x42].into(),
    SendOptions::default(),
  )
  .await
  .unwrap();

  let (target, payload) = tokio::time::timeout(Duration::from_secs(5), b_inbox.recv())
    .await
    .expect("timed out waiting for forwarded message")
    .expect("inbox closed");
  assert_eq!(
    target,
    Destination::Registered {
      node: "f2".into(),
      name: "store_proc".into(),
    }
  );
  assert_eq!(payload.as_ref(), &[0x42]);
}

#[tokio::test(flavor = "multi_thread")]
async fn interposition_filter_drops_then_removal_restores_delivery() {
  let a_addr = "127.0.0.1:18909".parse().unwrap();
  let b_addr = "127.0.0.1:18910".parse().unwrap();

  let a_node = Node::new("i1", vec![a_addr]);
  let b_node = Node::new("i2", vec![b_addr]);

  let (a, _a_inbox) = Partisan::start(Config::new(a_node.clone())).await.unwrap();
  let (b, mut b_inbox) = Partisan::start(Config::new(b_node.clone())).await.unwrap();

  b.join(a_node.clone()).await.unwrap();
  wait_until(|| a.is_connected("i2") && b.is_connected("i1"), Duration::from_secs(5)).await;

  a.add_interposition_fun("i2", Tag::ForwardMessage, Arc::new(|_, _, _| Verdict::Drop));

  a.send(&Destination::Node("i2".into()), vec![1].into(), SendOptions::default())
    .await
    .unwrap();
  let dropped = tokio::time::timeout(Duration::from_millis(500), b_inbox.recv()).await;
  assert!(dropped.is_err(), "message should have been dropped by the filter");

  a.remove_interposition_fun("i2", Tag::ForwardMessage);
  a.send(&Destination::Node("i2".into()), vec![2].into(), SendOptions::default())
    .await
    .unwrap();
  let (_, payload) = tokio::time::timeout(Duration::from_secs(1), b_inbox.recv())
    .await
    .expect("message should be received once the filter is removed")
    .expect("inbox closed");
  assert_eq!(payload.as_ref(), &[2]);
}
