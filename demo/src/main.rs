use {
  crate::cli::CliOptions,
  clap::Parser,
  metrics_exporter_prometheus::PrometheusBuilder,
  partisan::{Config, Destination, Node, Partisan, SendOptions},
  tracing::info,
  tracing_subscriber::FmtSubscriber,
};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing::subscriber::set_global_default(FmtSubscriber::new())?;
  PrometheusBuilder::new()
    .install()
    .expect("failed to install metrics exporter");

  let opts = CliOptions::parse();
  info!("starting node {} on {}", opts.name, opts.listen);

  let mut config = Config::new(Node::new(opts.name.clone(), vec![opts.listen]));
  config.data_dir = opts.data_dir;

  let (node, mut inbox) = Partisan::start(config).await?;

  if let Some((name, addr)) = opts.contact {
    info!("joining cluster through {name}@{addr}");
    node.join(Node::new(name, vec![addr])).await?;
  }

  {
    let node = node.clone();
    tokio::spawn(async move {
      while let Some((from, payload)) = inbox.recv().await {
        info!(from = %from.node(), bytes = payload.len(), "received gossip");
      }
      let _ = node;
    });
  }

  {
    let node = node.clone();
    tokio::spawn(async move {
      let mut changes = node.subscribe_membership_changes();
      while let Ok(view) = changes.recv().await {
        let names: Vec<_> = view.iter().map(|n| n.name.as_str()).collect();
        info!(active_view = ?names, "membership changed");
      }
    });
  }

  tokio::time::sleep(std::time::Duration::from_secs(2)).await;
  for peer in node.members() {
    node
      .send(
        &Destination::Node(peer.name.clone()),
        vec![1u8, 2, 3].into(),
        SendOptions::default(),
      )
      .await?;
  }

  tokio::signal::ctrl_c().await?;
  node.leave();
  Ok(())
}
