// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use series_federation::config::load_config_with_env;
use series_federation::{Client, MigrationScheduler, WriteBatcher};

/// Series Federation - Route and migrate time series across storage tiers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Sweep interval in seconds (overrides config file)
    #[arg(short, long)]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let mut config = load_config_with_env(&args.config)?;

    // Apply CLI overrides
    if let Some(interval) = args.interval {
        config.migration.interval_seconds = interval.max(1);
    }

    // Initialize tracing with configured level
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Series Federation");
    info!("Loaded configuration from: {:?}", args.config);
    if config.logging.format != "text" {
        warn!("Log format '{}' requested, writing text", config.logging.format);
    }

    let client = Arc::new(Client::from_config(&config)?);

    for (name, healthy) in client.health_check().await {
        if healthy {
            info!("Storage '{}' is healthy", name);
        } else {
            warn!("Storage '{}' failed its health check", name);
        }
    }

    let batcher = WriteBatcher::from_client(client.clone());

    let scheduler = MigrationScheduler::from_settings(client.clone(), &config.migration);
    if config.migration.enabled {
        for key in &config.migration.keys {
            scheduler
                .schedule(key.clone(), config.migration.interval())
                .await;
        }
        info!(
            "Sweeping {} keys every {:?}",
            config.migration.keys.len(),
            config.migration.interval()
        );
    }

    // Replay shunted writes while running
    let cancel = CancellationToken::new();
    let drain = if config.temporary.backend != "none" {
        let client = client.clone();
        let token = cancel.clone();
        let batch_size = config.client.batch_size;
        let every = Duration::from_secs(config.migration.interval_seconds);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.move_from_temporary_storage(batch_size).await {
                            error!("Replay from temporary storage failed: {}", e);
                        }
                    }
                }
            }
        }))
    } else {
        None
    };

    // Run until Ctrl+C
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    // Cleanup
    cancel.cancel();
    if let Some(drain) = drain {
        if let Err(e) = drain.await {
            error!("Temporary storage replay ended abnormally: {}", e);
        }
    }
    scheduler.shutdown().await;
    batcher.shutdown().await;
    info!("Series Federation shut down successfully");

    Ok(())
}
