//! `ClassChat` hub: realtime topic broadcast and message-thread RPCs.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000
//! cargo run --bin classchat-hub
//!
//! # Run on custom address
//! cargo run --bin classchat-hub -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! HUB_ADDR=127.0.0.1:8080 cargo run --bin classchat-hub
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use classchat_hub::config::{HubCliArgs, HubConfig};
use classchat_hub::hub::{self, HubState};
use classchat_hub::store::ThreadStore;
use classchat_hub::topics::TopicRegistry;

/// How long connected clients get to receive their Close frame on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let cli = HubCliArgs::parse();

    let config = match HubConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting classchat hub");

    let state = Arc::new(HubState::with_config(
        config.max_payload_size,
        TopicRegistry::with_max_topics(config.max_topics_per_client),
        ThreadStore::with_max_messages(config.max_messages_per_thread),
    ));

    let started = hub::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await;
    let (bound_addr, handle) = match started {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "failed to start hub");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %bound_addr, "hub listening");

    tokio::select! {
        res = handle => {
            if let Err(e) = res {
                tracing::error!(error = %e, "hub server task failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested, closing client connections");
            state.close_all_connections().await;
            if !state.wait_drained(SHUTDOWN_GRACE).await {
                tracing::warn!("some clients did not close within the grace period");
            }
        }
    }
}
