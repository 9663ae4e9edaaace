use clap::Parser;

/// booksync: keep a live Kraken order book in sync and print it.
#[derive(Parser, Debug)]
#[command(name = "booksync", version)]
pub struct Args {
    /// Kraken pair (e.g. XBT/USD)
    pub pair: String,

    /// Book depth to subscribe to (10, 25, 100, 500 or 1000)
    #[arg(long, default_value = "10")]
    pub depth: usize,

    /// Levels per side to print on each update
    #[arg(long, default_value = "1")]
    pub levels: usize,

    /// Output as JSON instead of TSV
    #[arg(long)]
    pub json: bool,

    /// WebSocket endpoint
    #[arg(long, default_value = booksync::KRAKEN_PUBLIC_WS)]
    pub url: String,

    /// Seconds to wait for a snapshot on start/resync
    #[arg(long, default_value = "10")]
    pub snapshot_timeout_secs: u64,

    /// Resync when no update arrives for this many seconds (0 disables)
    #[arg(long, default_value = "0")]
    pub stale_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
