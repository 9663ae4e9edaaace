mod cli;
mod output;

use std::io::{self, BufWriter};
use std::time::Duration;

use booksync::{KrakenTransport, SyncConfig, SyncController};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = cli::Args::parse();

    // Initialize tracing
    let filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(pair = %args.pair, depth = args.depth, json = args.json, "booksync starting");

    let transport = match KrakenTransport::new(&args.url) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "invalid transport configuration");
            std::process::exit(1);
        }
    };

    let config = SyncConfig {
        market: args.pair.clone(),
        depth_limit: args.depth,
        snapshot_timeout: Duration::from_secs(args.snapshot_timeout_secs),
        stale_after: (args.stale_secs > 0).then(|| Duration::from_secs(args.stale_secs)),
        ..Default::default()
    };
    let controller = SyncController::new(config, transport);
    let cancel = setup_signal_handlers();

    tokio::select! {
        result = controller.start() => {
            if let Err(e) = result {
                error!(error = %e, "initial synchronization failed");
                std::process::exit(1);
            }
        }
        _ = cancel.cancelled() => {
            controller.stop();
            return;
        }
    }

    print_book(&controller, &args, &cancel).await;
    controller.stop();
}

/// Print a line per published book view until cancelled or the controller
/// stops on its own.
async fn print_book(
    controller: &SyncController<KrakenTransport>,
    args: &cli::Args,
    cancel: &CancellationToken,
) {
    let mut book_rx = controller.subscribe_book();
    let mut status_rx = controller.subscribe_status();
    let mut writer = BufWriter::new(io::stdout().lock());
    let mut buf = String::with_capacity(512);

    loop {
        let view = book_rx.borrow_and_update().clone();
        let state = *status_rx.borrow_and_update();
        if let Err(e) = output::write_book(
            &mut writer,
            &args.pair,
            state,
            &view,
            args.levels,
            args.json,
            &mut buf,
        ) {
            warn!(error = %e, "stdout closed");
            return;
        }

        tokio::select! {
            changed = book_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = *status_rx.borrow();
                if !state.is_active() {
                    if let Some(e) = controller.last_error() {
                        error!(error = %e, "book sync gave up");
                    }
                    return;
                }
            }
            _ = cancel.cancelled() => {
                info!("shutdown requested");
                return;
            }
        }
    }
}

/// Cancel the returned token on the first SIGINT or SIGTERM.
fn setup_signal_handlers() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(signal, "shutting down");
        token.cancel();
    });

    cancel
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
