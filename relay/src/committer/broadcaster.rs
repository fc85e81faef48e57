// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::B256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::batch::Batch;

#[derive(Debug, Clone)]
pub struct PeerBroadcasterConfig {
    /// Base URLs of full nodes that receive `POST {peer}/peer/batches`.
    pub peers: Vec<String>,
    pub attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub subscriber_buffer_capacity: usize,
    pub outbox_capacity: usize,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("cannot build peer http client")]
    Client {
        #[source]
        source: reqwest::Error,
    },
    #[error("push to {peer} failed")]
    Transport {
        peer: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("peer {peer} answered {status}")]
    Rejected { peer: String, status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastBatchMessage {
    Committed {
        sequence_number: u64,
        settled_height: u64,
        prev_state_root: B256,
        post_state_root: B256,
        da_height: Option<u64>,
        tx_ids: Vec<B256>,
        blob: String,
    },
    Halted {
        sequence_number: u64,
        reason: String,
    },
}

impl BroadcastBatchMessage {
    pub fn committed(batch: &Batch) -> Self {
        Self::Committed {
            sequence_number: batch.sequence_number,
            settled_height: batch.sequence_number,
            prev_state_root: batch.prev_state_root,
            post_state_root: batch.post_state_root,
            da_height: batch.inclusion_height,
            tx_ids: batch.transactions.iter().map(|tx| tx.id).collect(),
            blob: STANDARD.encode(batch.blob.as_slice()),
        }
    }

    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::Committed {
                sequence_number, ..
            }
            | Self::Halted {
                sequence_number, ..
            } => *sequence_number,
        }
    }
}

pub struct LiveSubscription {
    pub receiver: mpsc::Receiver<BroadcastBatchMessage>,
    /// First sequence number this subscription receives live; older ones come from storage.
    pub live_start_sequence: u64,
}

/// Fans committed batches out to WebSocket subscribers and, through a single ordered outbox,
/// pushes them to configured peers over HTTP. Delivery is best-effort: slow subscribers are
/// dropped and peer failures are only logged.
#[derive(Clone)]
pub struct PeerBroadcaster {
    inner: Arc<BroadcasterInner>,
}

struct BroadcasterInner {
    subscriber_buffer_capacity: usize,
    next_subscriber_id: AtomicU64,
    subscribers: Mutex<Subscribers>,
    outbox: Option<mpsc::Sender<BroadcastBatchMessage>>,
}

struct Subscribers {
    // Next sequence number to be published.
    head: u64,
    senders: HashMap<u64, mpsc::Sender<BroadcastBatchMessage>>,
}

impl PeerBroadcaster {
    /// `settled_height` is the last committed sequence number at start.
    pub fn start(
        config: PeerBroadcasterConfig,
        settled_height: u64,
    ) -> Result<Self, BroadcastError> {
        let outbox = if config.peers.is_empty() {
            None
        } else {
            let client = reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()
                .map_err(|source| BroadcastError::Client { source })?;
            let (tx, rx) = mpsc::channel(config.outbox_capacity.max(1));
            let pusher = PeerPusher {
                client,
                peers: config.peers.clone(),
                attempts: config.attempts.max(1),
                retry_delay: config.retry_delay,
            };
            tokio::spawn(pusher.run(rx));
            Some(tx)
        };

        Ok(Self {
            inner: Arc::new(BroadcasterInner {
                subscriber_buffer_capacity: config.subscriber_buffer_capacity.max(1),
                next_subscriber_id: AtomicU64::new(0),
                subscribers: Mutex::new(Subscribers {
                    head: settled_height.saturating_add(1),
                    senders: HashMap::new(),
                }),
                outbox,
            }),
        })
    }

    /// Broadcaster with no peers, for tests and single-node setups.
    pub fn local(subscriber_buffer_capacity: usize, settled_height: u64) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                subscriber_buffer_capacity: subscriber_buffer_capacity.max(1),
                next_subscriber_id: AtomicU64::new(0),
                subscribers: Mutex::new(Subscribers {
                    head: settled_height.saturating_add(1),
                    senders: HashMap::new(),
                }),
                outbox: None,
            }),
        }
    }

    pub fn subscribe(&self) -> LiveSubscription {
        let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer_capacity);
        let subscriber_id = self
            .inner
            .next_subscriber_id
            .fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.lock_subscribers();
        subscribers.senders.insert(subscriber_id, tx);
        LiveSubscription {
            receiver: rx,
            live_start_sequence: subscribers.head,
        }
    }

    pub fn publish(&self, message: BroadcastBatchMessage) {
        self.fanout(&message);
        if let Some(outbox) = &self.inner.outbox {
            match outbox.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => warn!(
                    sequence_number = message.sequence_number(),
                    "peer outbox full, batch not pushed to peers"
                ),
                Err(TrySendError::Closed(_)) => warn!("peer pusher stopped"),
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().senders.len()
    }

    fn fanout(&self, message: &BroadcastBatchMessage) {
        let mut subscribers = self.lock_subscribers();
        if let BroadcastBatchMessage::Committed {
            sequence_number, ..
        } = message
        {
            subscribers.head = sequence_number.saturating_add(1);
        }

        let mut to_remove = Vec::new();
        for (subscriber_id, sender) in subscribers.senders.iter() {
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => {
                    to_remove.push(*subscriber_id);
                    debug!(subscriber_id, "batch broadcaster removed closed subscriber");
                }
                Err(TrySendError::Full(_)) => {
                    to_remove.push(*subscriber_id);
                    warn!(
                        subscriber_id,
                        "batch broadcaster dropped slow subscriber due to full channel"
                    );
                }
            }
        }
        for subscriber_id in to_remove {
            subscribers.senders.remove(&subscriber_id);
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.inner
            .subscribers
            .lock()
            .expect("batch broadcaster subscribers mutex poisoned")
    }
}

struct PeerPusher {
    client: reqwest::Client,
    peers: Vec<String>,
    attempts: u32,
    retry_delay: Duration,
}

impl PeerPusher {
    async fn run(self, mut outbox: mpsc::Receiver<BroadcastBatchMessage>) {
        while let Some(message) = outbox.recv().await {
            for peer in &self.peers {
                if let Err(err) = self.push_with_retry(peer, &message).await {
                    warn!(
                        peer = peer.as_str(),
                        sequence_number = message.sequence_number(),
                        error = %err,
                        "peer broadcast gave up"
                    );
                }
            }
        }
    }

    async fn push_with_retry(
        &self,
        peer: &str,
        message: &BroadcastBatchMessage,
    ) -> Result<(), BroadcastError> {
        let mut attempt = 1;
        loop {
            match self.push(peer, message).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.attempts => {
                    debug!(peer, attempt, error = %err, "peer broadcast failed, retrying");
                    tokio::time::sleep(self.retry_delay.saturating_mul(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn push(&self, peer: &str, message: &BroadcastBatchMessage) -> Result<(), BroadcastError> {
        let url = format!("{}/peer/batches", peer.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .json(message)
            .send()
            .await
            .map_err(|source| BroadcastError::Transport {
                peer: peer.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(BroadcastError::Rejected {
                peer: peer.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BroadcastBatchMessage, PeerBroadcaster, PeerBroadcasterConfig};
    use crate::batch::Batch;
    use alloy_primitives::{Address, B256, U256};
    use app_core::application::{Method, Transfer};
    use app_core::transaction::Transaction;
    use axum::Router;
    use axum::extract::{Json, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn committed(sequence_number: u64) -> Batch {
        let tx = Transaction::new(
            B256::from([sequence_number as u8; 32]),
            Address::from_slice(&[0x11; 20]),
            &Method::Transfer(Transfer {
                amount: U256::from(1),
                to: Address::from_slice(&[0x22; 20]),
            }),
            0,
        );
        let mut batch = Batch::seal(sequence_number, vec![tx], B256::ZERO, B256::ZERO, 0);
        batch.inclusion_height = Some(7);
        batch
    }

    #[test]
    fn committed_message_serializes_with_kind_and_base64_blob() {
        let batch = committed(2);
        let json = serde_json::to_string(&BroadcastBatchMessage::committed(&batch))
            .expect("serialize");
        assert!(json.contains("\"kind\":\"committed\""));
        assert!(json.contains("\"sequence_number\":2"));
        assert!(json.contains("\"settled_height\":2"));
        assert!(json.contains("\"da_height\":7"));
        assert!(!json.contains("\"blob\":\"\""));
    }

    #[tokio::test]
    async fn subscribers_see_live_start_and_slow_ones_are_dropped() {
        let broadcaster = PeerBroadcaster::local(1, 4);
        let mut fast = broadcaster.subscribe();
        let slow = broadcaster.subscribe();
        assert_eq!(fast.live_start_sequence, 5);
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.publish(BroadcastBatchMessage::committed(&committed(5)));
        let received = fast.receiver.recv().await.expect("first message");
        assert_eq!(received.sequence_number(), 5);

        // `slow` never reads, so its single-slot buffer is still full.
        broadcaster.publish(BroadcastBatchMessage::committed(&committed(6)));
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(broadcaster.subscribe().live_start_sequence, 7);
        drop(slow);
    }

    #[derive(Clone, Default)]
    struct PeerState {
        failures_left: Arc<AtomicUsize>,
        received: Arc<Mutex<Vec<u64>>>,
    }

    async fn receive(
        State(state): State<PeerState>,
        Json(message): Json<BroadcastBatchMessage>,
    ) -> StatusCode {
        if state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        state
            .received
            .lock()
            .expect("received lock")
            .push(message.sequence_number());
        StatusCode::OK
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peers_receive_pushes_in_order_after_transient_failures() {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return,
            Err(err) => panic!("bind peer listener: {err}"),
        };
        let addr = listener.local_addr().expect("peer addr");
        let state = PeerState::default();
        state.failures_left.store(1, Ordering::SeqCst);
        let app = Router::new()
            .route("/peer/batches", post(receive))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let broadcaster = PeerBroadcaster::start(
            PeerBroadcasterConfig {
                peers: vec![format!("http://{addr}/")],
                attempts: 3,
                retry_delay: Duration::from_millis(5),
                request_timeout: Duration::from_secs(2),
                subscriber_buffer_capacity: 4,
                outbox_capacity: 8,
            },
            0,
        )
        .expect("start broadcaster");
        broadcaster.publish(BroadcastBatchMessage::committed(&committed(1)));
        broadcaster.publish(BroadcastBatchMessage::committed(&committed(2)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while state.received.lock().expect("received lock").len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer receives both batches");
        assert_eq!(*state.received.lock().expect("received lock"), vec![1, 2]);
    }
}
