//! CLI for pubsub_bridge
//!
//! Subcommands:
//! - `emulator`: run the WebSocket broker emulator with the configured topic and subscription
//! - `app`: run the sample application; every stdin line is published through the gateway

use std::sync::Arc;

use clap::Parser;
use pubsub_bridge::app::{Application, provision};
use pubsub_bridge::broker::{Broker, BrokerClient, LocalClient};
use pubsub_bridge::config::{Settings, load_config};
use pubsub_bridge::transport::{WebSocketClient, start_websocket_server};
use pubsub_bridge::utils::logging;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pubsub_bridge")]
enum Command {
    /// Start the WebSocket broker emulator
    Emulator,
    /// Run the sample application against a broker
    App {
        /// Emulator URL to connect to (default: built from server.host/server.port)
        #[arg(long, conflicts_with = "local")]
        url: Option<String>,
        /// Use an in-process broker instead of connecting to an emulator
        #[arg(long)]
        local: bool,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);
    if let Err(e) = settings.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    let result = match cmd {
        Command::Emulator => run_emulator(&settings).await,
        Command::App { url, local } => run_app(&settings, url, local).await,
    };
    if let Err(e) = result {
        error!("Exited with error: {}", e);
        std::process::exit(1);
    }
}

async fn run_emulator(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::with_max_message_bytes(settings.pubsub.max_message_bytes).shared();
    provision(&broker, settings)?;

    tokio::spawn(Broker::start_lease_loop(
        broker.clone(),
        settings.lease_check_interval(),
    ));

    let addr = settings.server_addr();
    tokio::select! {
        result = start_websocket_server(&addr, broker) => {
            result?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

async fn run_app(
    settings: &Settings,
    url: Option<String>,
    local: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let client: Arc<dyn BrokerClient> = if local {
        let broker = Broker::with_max_message_bytes(settings.pubsub.max_message_bytes).shared();
        provision(&broker, settings)?;
        tokio::spawn(Broker::start_lease_loop(
            broker.clone(),
            settings.lease_check_interval(),
        ));
        Arc::new(LocalClient::new(broker))
    } else {
        let url = url.unwrap_or_else(|| format!("ws://{}", settings.server_addr()));
        Arc::new(
            WebSocketClient::connect(&url, settings.reconnect_policy(), settings.publish_timeout())
                .await?,
        )
    };

    let mut app = Application::start(settings, client).await?;
    info!("Type a line to publish it to `{}`", settings.pubsub.topic);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = app.gateway().send(line.as_str()).await {
                        warn!("Failed to publish: {}", e);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }

    app.stop().await;
    Ok(())
}
