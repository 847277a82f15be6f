// Message Bus Gateway - Server
// Run with: cargo run --bin server -- --in-memory

//! # Message Bus Server Binary
//!
//! Starts the gateway and its compensation worker, then runs until Ctrl-C.
//!
//! ## Modes
//!
//! - default: producers publish to NATS JetStream (`nats.urls`)
//! - `--in-memory`: no broker; producers keep messages in memory and a demo
//!   application is registered so the pipeline can be exercised locally
//!
//! ## Configuration
//!
//! Settings come from `config/messagebus.toml` (or `--config`), overridden
//! by `MESSAGEBUS__*` environment variables. A `.env` file is loaded first
//! when present. `RUST_LOG` wins over the configured log level.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use message_bus::settings::{LogLevel, DEFAULT_CONFIG_PATH};
use message_bus::{
    AppConfig, CallbackConfig, GatewayBuilder, GatewayConfig, InMemoryConfigResolver,
    InMemoryProducerFactory, Message, MessageConfig, TransportType,
};

/// Demo application registered in `--in-memory` mode
const DEMO_APP_ID: &str = "demo";

#[derive(Parser, Debug)]
#[command(name = "message-bus", version, about = "Message bus gateway server")]
struct Cli {
    /// Settings file (TOML); missing files fall back to defaults
    #[arg(short, long, env = "MESSAGEBUS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, env = "MESSAGEBUS_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Run without a broker, with a demo application
    #[arg(long)]
    in_memory: bool,

    /// Callback URL of the demo application
    #[arg(long, env = "DEMO_CALLBACK_URL", default_value = "http://localhost:8080/notify")]
    demo_callback_url: String,
}

fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn demo_app(callback_url: &str) -> AppConfig {
    AppConfig::new(DEMO_APP_ID, TransportType::Nats).with_message_config(
        MessageConfig::new("order_paid")
            .with_callback(CallbackConfig::new("demo_order_paid_notify", callback_url)),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let dotenv_result = dotenv();

    let cli = Cli::parse();
    let mut config = GatewayConfig::load_from(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if cli.in_memory {
        config.nats.enabled = false;
    }

    init_tracing(config.log_level);
    if let Err(e) = dotenv_result {
        warn!("no .env file loaded: {}", e);
    }

    info!("Starting message bus gateway");
    info!(config = %cli.config.display(), in_memory = cli.in_memory, "settings loaded");

    let resolver = Arc::new(InMemoryConfigResolver::new());
    let mut builder = GatewayBuilder::new(config).with_config_resolver(resolver.clone());

    if cli.in_memory {
        resolver.upsert(demo_app(&cli.demo_callback_url))?;
        builder = builder.with_producer_factory(Arc::new(InMemoryProducerFactory::new()));
        info!(app_id = DEMO_APP_ID, callback = %cli.demo_callback_url, "demo application registered");
    }

    let gateway = builder.build().await?;
    gateway.start_worker();

    if cli.in_memory {
        let message = Message::new(DEMO_APP_ID, "order_paid", "demo-1", r#"{"orderId":1}"#)
            .with_client_ip("127.0.0.1");
        match gateway.publish(message).await {
            Ok(receipt) => info!(?receipt, "demo message published"),
            Err(e) => error!(error = %e, "demo message rejected"),
        }
    }

    info!("Message bus gateway running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }

    gateway.shutdown().await;
    Ok(())
}
