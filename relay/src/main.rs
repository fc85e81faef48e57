// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use app_core::ledger::Ledger;
use tracing_subscriber::EnvFilter;

use relay::batcher::BatcherConfig;
use relay::committer::PeerBroadcasterConfig;
use relay::da::{DaClient, HttpDaClient, MemoryDa};
use relay::node::{RelayConfig, RelayNode};
use relay::storage;
use relay::submitter::{Backoff, SubmitterConfig};

const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DB_PATH: &str = "relay.db";
const DEFAULT_SQLITE_SYNCHRONOUS: &str = "NORMAL";
const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_APP_ID: u32 = 0;
const DEFAULT_DA_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BATCH_INTERVAL_MS: u64 = 3_000;
const DEFAULT_MAX_BATCH_TXS: usize = 1024;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_INCLUSION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_FINALITY_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_RETRY_BUDGET: u32 = 5;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
const DEFAULT_BROADCAST_ATTEMPTS: u32 = 3;
const DEFAULT_BROADCAST_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_WS_PAGE_SIZE: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    match config.da_url.clone() {
        Some(url) => {
            let da = HttpDaClient::new(url.as_str(), config.da_request_timeout)?;
            tracing::info!(da_url = %url, app_id = config.app_id, "using light client da");
            run(config, Arc::new(da)).await
        }
        None => {
            tracing::warn!("RELAY_DA_URL not set, using in-memory da (dev mode)");
            run(config, Arc::new(MemoryDa::auto_finalizing())).await
        }
    }
}

async fn run<D: DaClient>(config: Config, da: Arc<D>) -> Result<(), Box<dyn std::error::Error>> {
    let storage = storage::Storage::open(&config.db_path, &config.sqlite_synchronous)?;
    let mut node = RelayNode::start(config.relay_config(), storage, da, config.genesis.clone())?;

    let app = relay::api::router(node.app_state(), config.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    let stop = node.stop_handle();
    let shutdown_signal = async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
        stop.request_shutdown();
    };

    tracing::info!(address = %config.http_addr, "listening");
    tokio::select! {
        server_result = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal) => {
            node.shutdown().await?;
            server_result?;
        }
        failure = node.failed() => {
            return Err(format!("relay pipeline exited: {failure}").into());
        }
    }

    Ok(())
}

struct Config {
    http_addr: String,
    db_path: String,
    sqlite_synchronous: String,
    max_body_bytes: usize,
    app_id: u32,
    da_url: Option<String>,
    da_request_timeout: Duration,
    batch_interval: Duration,
    max_batch_txs: usize,
    poll_interval: Duration,
    inclusion_timeout: Duration,
    finality_timeout: Duration,
    retry_budget: u32,
    backoff: Backoff,
    shutdown_grace: Duration,
    peers: Vec<String>,
    broadcast_attempts: u32,
    subscriber_buffer: usize,
    /// Written to storage on first start only.
    genesis: Ledger,
}

impl Config {
    fn from_env() -> Result<Self, String> {
        let backoff_initial = env_u64("RELAY_BACKOFF_INITIAL_MS", DEFAULT_BACKOFF_INITIAL_MS).max(1);
        Ok(Self {
            http_addr: env_string("RELAY_HTTP_ADDR", DEFAULT_HTTP_ADDR),
            db_path: env_string("RELAY_DB_PATH", DEFAULT_DB_PATH),
            sqlite_synchronous: env_string("RELAY_SQLITE_SYNCHRONOUS", DEFAULT_SQLITE_SYNCHRONOUS),
            max_body_bytes: env_usize("RELAY_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES).max(1),
            app_id: env_u32("RELAY_APP_ID", DEFAULT_APP_ID),
            da_url: std::env::var("RELAY_DA_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            da_request_timeout: Duration::from_millis(
                env_u64("RELAY_DA_REQUEST_TIMEOUT_MS", DEFAULT_DA_REQUEST_TIMEOUT_MS).max(1),
            ),
            batch_interval: Duration::from_millis(
                env_u64("RELAY_BATCH_INTERVAL_MS", DEFAULT_BATCH_INTERVAL_MS).max(1),
            ),
            max_batch_txs: env_usize("RELAY_MAX_BATCH_TXS", DEFAULT_MAX_BATCH_TXS).max(1),
            poll_interval: Duration::from_millis(
                env_u64("RELAY_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS).max(1),
            ),
            inclusion_timeout: Duration::from_millis(
                env_u64("RELAY_INCLUSION_TIMEOUT_MS", DEFAULT_INCLUSION_TIMEOUT_MS).max(1),
            ),
            finality_timeout: Duration::from_millis(
                env_u64("RELAY_FINALITY_TIMEOUT_MS", DEFAULT_FINALITY_TIMEOUT_MS).max(1),
            ),
            retry_budget: env_u32("RELAY_RETRY_BUDGET", DEFAULT_RETRY_BUDGET),
            backoff: Backoff {
                initial: Duration::from_millis(backoff_initial),
                max: Duration::from_millis(
                    env_u64("RELAY_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS).max(backoff_initial),
                ),
            },
            shutdown_grace: Duration::from_millis(env_u64(
                "RELAY_SHUTDOWN_GRACE_MS",
                DEFAULT_SHUTDOWN_GRACE_MS,
            )),
            peers: env_string("RELAY_PEERS", "")
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(str::to_string)
                .collect(),
            broadcast_attempts: env_u32("RELAY_BROADCAST_ATTEMPTS", DEFAULT_BROADCAST_ATTEMPTS)
                .max(1),
            subscriber_buffer: env_usize("RELAY_SUBSCRIBER_BUFFER", DEFAULT_SUBSCRIBER_BUFFER)
                .max(1),
            genesis: parse_genesis(&env_string("RELAY_GENESIS", ""))?,
        })
    }

    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            batcher: BatcherConfig {
                interval: self.batch_interval,
                max_batch_txs: self.max_batch_txs,
            },
            submitter: SubmitterConfig {
                app_id: self.app_id,
                poll_interval: self.poll_interval,
                inclusion_timeout: self.inclusion_timeout,
                finality_timeout: self.finality_timeout,
                retry_budget: self.retry_budget,
                backoff: self.backoff,
                shutdown_grace: self.shutdown_grace,
            },
            broadcaster: PeerBroadcasterConfig {
                peers: self.peers.clone(),
                attempts: self.broadcast_attempts,
                retry_delay: DEFAULT_BROADCAST_RETRY_DELAY,
                request_timeout: self.da_request_timeout,
                subscriber_buffer_capacity: self.subscriber_buffer,
                outbox_capacity: DEFAULT_CHANNEL_CAPACITY,
            },
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            ws_page_size: DEFAULT_WS_PAGE_SIZE,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// `0xaddr=amount,0xaddr=amount`; amounts are decimal or 0x-prefixed hex.
fn parse_genesis(value: &str) -> Result<Ledger, String> {
    let mut balances = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (account, amount) = entry
            .split_once('=')
            .ok_or_else(|| format!("genesis entry {entry:?} must be 0xaddr=amount"))?;
        let account = parse_address(account.trim())?;
        let amount = U256::from_str(amount.trim())
            .map_err(|e| format!("invalid genesis amount for {account}: {e}"))?;
        if balances.iter().any(|(existing, _)| *existing == account) {
            return Err(format!("genesis lists {account} twice"));
        }
        balances.push((account, amount));
    }
    Ok(Ledger::genesis(balances))
}

fn parse_address(value: &str) -> Result<Address, String> {
    if !value.starts_with("0x") {
        return Err("address must be 0x-prefixed hex".to_string());
    }
    let bytes =
        alloy_primitives::hex::decode(value).map_err(|e| format!("invalid address hex: {e}"))?;
    if bytes.len() != 20 {
        return Err("address must be 20 bytes".to_string());
    }
    Ok(Address::from_slice(&bytes))
}
