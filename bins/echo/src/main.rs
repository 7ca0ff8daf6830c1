//! mlink-echo - echo server and client over the mlink transport.
//!
//! Server: `mlink-echo serve --listen 0.0.0.0:4500`
//! Client: `mlink-echo send --listen 0.0.0.0:4501 --peer 10.0.0.9:4500 hello world`

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::info;

use mlink::ipc::{ChannelService, Configuration, JsonProtocol, Message, downcast, flags};

#[derive(Debug, Serialize, Deserialize)]
struct EchoMessage {
    text: String,
}

impl Message for EchoMessage {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

const ECHO_TYPE: u32 = 1;

#[derive(Parser)]
#[command(name = "mlink-echo", version, about = "Echo tool for the mlink transport")]
struct Cli {
    /// Local listening address.
    #[arg(short, long, default_value = "0.0.0.0:4500")]
    listen: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an echo server: every message comes back on its session.
    Serve,

    /// Send each argument as one message and print the echoes.
    Send {
        /// The echo server address.
        #[arg(short, long)]
        peer: SocketAddr,

        /// Wait for a correlated response instead of a plain echo.
        #[arg(short, long)]
        request: bool,

        /// Message texts to send.
        #[arg(required = true)]
        texts: Vec<String>,
    },
}

fn protocol() -> Arc<JsonProtocol> {
    let mut p = JsonProtocol::new();
    p.register::<EchoMessage>(ECHO_TYPE);
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
        Command::Serve => {
            info!(listen = %cli.listen, "echo server running");
            while let Some(incoming) = node.incoming.next().await {
                let text = downcast::<EchoMessage>(&incoming.msg)
                    .map(|m| m.text.clone())
                    .unwrap_or_default();
                info!(peer = %incoming.ctx.peer_address, %text, "echoing");
                if incoming.ctx.request_uid.is_valid() {
                    node.service.respond(
                        incoming.ctx.connection,
                        incoming.ctx.request_uid,
                        incoming.msg,
                        ECHO_TYPE,
                        0,
                    )?;
                } else {
                    node.service.send_message_to(
                        incoming.ctx.connection,
                        incoming.msg,
                        ECHO_TYPE,
                        0,
                    )?;
                }
            }
        }
        Command::Send {
            peer,
            request,
            texts,
        } => {
            let msg_flags = if request { flags::WAIT_RESPONSE } else { 0 };
            let count = texts.len();
            for text in texts {
                node.service
                    .send_message(
                        peer,
                        Arc::new(EchoMessage { text }),
                        ECHO_TYPE,
                        msg_flags,
                    )
                    .await?;
            }
            if request {
                for _ in 0..count {
                    let Some(completed) = node.completed.recv().await else {
                        break;
                    };
                    match completed.response {
                        Some(response) => {
                            let text = downcast::<EchoMessage>(&response)
                                .map(|m| m.text.as_str().to_owned())
                                .unwrap_or_default();
                            println!("{text}");
                        }
                        None => println!("<{:?}>", completed.status),
                    }
                }
            } else {
                for _ in 0..count {
                    let Some(incoming) = node.incoming.next().await else {
                        break;
                    };
                    let text = downcast::<EchoMessage>(&incoming.msg)
                        .map(|m| m.text.as_str().to_owned())
                        .unwrap_or_default();
                    println!("{text}");
                }
            }
            node.service.stop();
        }
    }

    Ok(())
}
