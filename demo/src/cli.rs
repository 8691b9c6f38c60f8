use {clap::Parser, std::net::SocketAddr};

/// Starts a single Partisan node, joins it to a cluster through an
/// optional contact peer, and gossips a test message to every node it
/// becomes connected to.
#[derive(Debug, Parser)]
pub struct CliOptions {
  /// Name this node advertises to the rest of the cluster.
  #[arg(long)]
  pub name: String,

  /// Address this node listens on.
  #[arg(long)]
  pub listen: SocketAddr,

  /// `name@address` of a node already in the cluster to join through.
  /// Omit to start a fresh single-node cluster.
  #[arg(long, value_parser = parse_contact)]
  pub contact: Option<(String, SocketAddr)>,

  /// Directory to persist the active/passive view snapshot under.
  #[arg(long)]
  pub data_dir: Option<std::path::PathBuf>,
}

fn parse_contact(raw: &str) -> Result<(String, SocketAddr), String> {
  let (name, addr) = raw
    .split_once('@')
    .ok_or_else(|| format!("expected name@address, got {raw:?}"))?;
  let addr = addr
    .parse()
    .map_err(|e| format!("bad contact address {addr:?}: {e}"))?;
  Ok((name.to_string(), addr))
}
