//! Command-line interface definitions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// tidepool - in-memory cache with TTL expiration and durable secondary indexes
#[derive(Parser, Debug)]
#[command(name = "tidepool")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Data directory for index WALs and snapshots
    #[arg(long, default_value = "tidepool-data", value_name = "PATH")]
    pub data_dir: PathBuf,

    /// Port for the HTTP API
    #[arg(long, short = 'p', default_value = "7700")]
    pub port: u16,

    /// How often the background sweeper removes expired items
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub sweep_interval: Duration,

    /// How often every index is snapshotted and its WAL truncated
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    pub checkpoint_interval: Duration,

    /// Shared password clients must present as a bearer token.
    /// Falls back to the TIDEPOOL_PASSWORD environment variable.
    #[arg(long)]
    pub password: Option<String>,
}
