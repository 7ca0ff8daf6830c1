//! mlink-stress - flood a peer with messages and measure completions.
//!
//! Sink:   `mlink-stress sink --listen 0.0.0.0:4500`
//! Source: `mlink-stress flood --listen 0.0.0.0:4501 --peer 10.0.0.9:4500 \
//!              --count 10000 --size 2048 --synchronous`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::info;

use mlink::ipc::{
    ChannelService, CompletionStatus, Configuration, JsonProtocol, Message, downcast, flags,
};

#[derive(Debug, Serialize, Deserialize)]
struct StressMessage {
    seq: u64,
    payload: String,
}

impl Message for StressMessage {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

const STRESS_TYPE: u32 = 1;

#[derive(Parser)]
#[command(name = "mlink-stress", version, about = "Stress tool for the mlink transport")]
struct Cli {
    /// Local listening address.
    #[arg(short, long, default_value = "0.0.0.0:4500")]
    listen: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Receive messages and report throughput every thousand.
    Sink,

    /// Send a burst of messages and wait for every completion.
    Flood {
        /// The sink address.
        #[arg(short, long)]
        peer: SocketAddr,

        /// Messages to send.
        #[arg(short, long, default_value_t = 1000)]
        count: u64,

        /// Payload size per message, in bytes.
        #[arg(short, long, default_value_t = 1024)]
        size: usize,

        /// Send with the synchronous flag (strict peer-side ordering).
        #[arg(long)]
        synchronous: bool,
    },
}

fn protocol() -> Arc<JsonProtocol> {
    let mut p = JsonProtocol::new();
    p.register::<StressMessage>(STRESS_TYPE);
    Arc::new(p)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Configuration::new(cli.listen);
    let mut node = ChannelService::start(config, protocol()).await?;

    match cli.command {
        Command::Sink => {
            info!(listen = %cli.listen, "sink running");
            let mut received = 0u64;
            let mut window_start = Instant::now();
            while let Some(incoming) = node.incoming.next().await {
                let _ = downcast::<StressMessage>(&incoming.msg);
                received += 1;
                if received % 1000 == 0 {
                    let elapsed = window_start.elapsed();
                    info!(
                        received,
                        rate = format!("{:.0} msg/s", 1000.0 / elapsed.as_secs_f64()),
                        "progress"
                    );
                    window_start = Instant::now();
                }
            }
        }
        Command::Flood {
            peer,
            count,
            size,
            synchronous,
        } => {
            let msg_flags = if synchronous { flags::SYNCHRONOUS } else { 0 };
            let payload = "x".repeat(size);
            let started = Instant::now();
            for seq in 0..count {
                node.service
                    .send_message(
                        peer,
                        Arc::new(StressMessage {
                            seq,
                            payload: payload.clone(),
                        }),
                        STRESS_TYPE,
                        msg_flags,
                    )
                    .await?;
            }
            info!(count, "burst submitted, waiting for completions");

            let mut ok = 0u64;
            let mut failed = 0u64;
            for _ in 0..count {
                let Some(completed) = node.completed.recv().await else {
                    break;
                };
                if completed.status == CompletionStatus::Success {
                    ok += 1;
                } else {
                    failed += 1;
                }
            }
            let elapsed = started.elapsed();
            println!(
                "{ok} delivered, {failed} failed in {elapsed:.2?} \
                 ({:.0} msg/s, {:.1} MiB/s)",
                ok as f64 / elapsed.as_secs_f64(),
                (ok as f64 * size as f64) / (1024.0 * 1024.0) / elapsed.as_secs_f64(),
            );
            node.service.stop();
        }
    }

    Ok(())
}
