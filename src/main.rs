//! Simulation binary: publish random values across an in-process cluster and
//! read them back from random nodes.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=kadstore=debug cargo run -- --nodes 100 --puts 200 --gets 100 --seed 7
//! ```
//!
//! Exits with an error if any read returns the wrong value or nothing.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadstore::sim::{build_cluster, NetworkRegistry};
use kadstore::{DhtConfig, Key};

#[derive(Parser, Debug)]
#[command(name = "kadstore")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Nodes in the simulated cluster.
    #[arg(short, long, default_value = "100")]
    nodes: usize,

    /// Random values to publish.
    #[arg(short, long, default_value = "200")]
    puts: usize,

    /// Random reads to verify.
    #[arg(short, long, default_value = "100")]
    gets: usize,

    /// Nodes taken offline between the publish and read phases.
    #[arg(long, default_value = "0")]
    offline: usize,

    /// Bucket size / replication factor; overrides the config file.
    #[arg(short)]
    k: Option<usize>,

    /// Lookup parallelism; overrides the config file.
    #[arg(long)]
    alpha: Option<usize>,

    /// RNG seed for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// JSON config file.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => DhtConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DhtConfig::default(),
    };
    if let Some(k) = args.k {
        config.bucket_size = k;
    }
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    config.validate()?;

    if args.nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    if args.offline >= args.nodes {
        bail!("--offline must leave at least one node online");
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    info!(
        seed,
        nodes = args.nodes,
        k = config.bucket_size,
        alpha = config.alpha,
        "starting simulation"
    );

    let registry = NetworkRegistry::new();
    let mut nodes = build_cluster(&registry, args.nodes, &config).await?;

    let mut published: Vec<(Key, Vec<u8>)> = Vec::with_capacity(args.puts);
    let mut failed_puts = 0usize;
    for _ in 0..args.puts {
        let len = rng.gen_range(1..=10);
        let value = Alphanumeric.sample_string(&mut rng, len).into_bytes();
        let node = &nodes[rng.gen_range(0..nodes.len())];
        match node.put(value.clone()).await {
            Ok(key) => published.push((key, value)),
            Err(err) => {
                warn!(node = %node.contact(), error = %err, "put failed");
                failed_puts += 1;
            }
        }
    }
    info!(published = published.len(), failed = failed_puts, "publish phase done");

    for _ in 0..args.offline {
        let victim = nodes.swap_remove(rng.gen_range(0..nodes.len()));
        registry.unregister(&victim.node_id()).await;
        info!(node = %victim.contact(), "node taken offline");
    }

    let expected: HashMap<Key, Vec<u8>> = published.iter().cloned().collect();
    let mut mismatches = 0usize;
    if !published.is_empty() {
        for _ in 0..args.gets {
            let (key, _) = &published[rng.gen_range(0..published.len())];
            let node = &nodes[rng.gen_range(0..nodes.len())];
            let got = match node.get(key).await {
                Ok(got) => got,
                Err(err) => {
                    warn!(node = %node.contact(), error = %err, "get failed");
                    None
                }
            };
            if got.as_ref() != expected.get(key) {
                warn!(key = %hex::encode(key), node = %node.contact(), "get returned an incorrect value");
                mismatches += 1;
            }
        }
    }

    let copies: usize = nodes.iter().map(|n| n.telemetry_snapshot().stored_keys).sum();
    info!(
        gets = args.gets,
        mismatches,
        failed_puts,
        stored_copies = copies,
        "simulation finished"
    );

    if mismatches > 0 || failed_puts > 0 {
        bail!("{mismatches} incorrect reads, {failed_puts} failed puts");
    }
    Ok(())
}
