use std::time::Duration;

use clap::Parser;

use crate::client::RepositoryClient;
use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod client;
mod stresstest;
mod workload;

/// Drives a running chunkdrop server with concurrent chunked uploads.
#[derive(Debug, Parser)]
struct Args {
    /// Base URL of the server.
    #[arg(long, default_value = "http://localhost:3024")]
    url: String,
    /// Directory the stress files are written to, created if missing.
    #[arg(long, default_value = "stresstest")]
    directory: String,
    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: u64,
    #[arg(long, default_value_t = 32)]
    concurrency: usize,
    /// How long to keep issuing new operations, in seconds.
    #[arg(long, default_value_t = 10)]
    duration: u64,
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // cargo run --release -- --url http://localhost:3024
    let args = Args::parse();
    anyhow::ensure!(args.chunk_size > 0, "--chunk-size must be positive");

    let remote = RepositoryClient {
        base_url: args.url.trim_end_matches('/').to_owned(),
        directory: args.directory,
        chunk_size: args.chunk_size,
        client: reqwest::Client::new(),
    };

    let mut small_files = Workload::builder("small files")
        .concurrency(args.concurrency)
        .size_distribution(16 * 1024, 1024 * 1024) // p50 = 16K, p99 = 1M
        .action_weights(80, 10, 10);
    let mut large_files = Workload::builder("large files")
        .concurrency((args.concurrency / 8).max(1))
        .size_distribution(4 * 1024 * 1024, 64 * 1024 * 1024)
        .action_weights(60, 20, 20);
    if let Some(seed) = args.seed {
        small_files = small_files.seed(seed);
        large_files = large_files.seed(seed.wrapping_add(1));
    }

    perform_stresstest(
        remote,
        vec![small_files.build()?, large_files.build()?],
        Duration::from_secs(args.duration),
    )
    .await
}
