//! Server entry point: CLI parsing, signal wiring, and lifecycle.

use clap::Parser;
use log::{info, warn};
use server::network::Server;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

/// Two-player match server with persistent session ratings.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Port to listen on (required)
    #[clap(short, long)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Note: set RUST_LOG=info (or debug) to see server logs");
    }

    let args = Args::parse();
    let server = Server::new();

    // SIGHUP drives graceful shutdown; installed through the runtime's
    // sigaction-based handler so it is safe for a multithreaded process.
    // SIGINT is deliberately left at its default so the server can still
    // be killed ungracefully.
    let mut hangup = signal(SignalKind::hangup())?;

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!("match server starting on port {}", args.port);

    tokio::select! {
        result = server.serve(listener) => {
            // The accept loop only returns on listener failure.
            if let Err(err) = result {
                warn!("accept loop failed: {}", err);
                return Err(err.into());
            }
        }
        _ = hangup.recv() => {
            info!("SIGHUP received");
        }
    }

    // The serve future (and with it the listening socket) is gone; drain
    // the live connections and finish.
    server.shutdown().await;
    info!("match server terminated");
    Ok(())
}
