// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod error;

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use app_core::application::Method;
use app_core::ledger::LedgerSnapshot;
use app_core::transaction::Transaction;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Json, Path, Query, State};
use axum::http::Method as HttpMethod;
use axum::response::Response;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::committer::{BroadcastBatchMessage, LiveSubscription, PeerBroadcaster};
use crate::intake::Intake;
use crate::projector::SimulatedResult;
use crate::shutdown::StopSignal;
use crate::status::{BatchView, Halt, PipelineStatus};
use crate::storage::{self, SharedStorage, TxLocation, now_unix_ms};
use crate::submitter::{RetryError, SubmitterCommand};

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<Intake>,
    pub status: Arc<PipelineStatus>,
    pub storage: SharedStorage,
    pub broadcaster: PeerBroadcaster,
    pub submitter: mpsc::Sender<SubmitterCommand>,
    pub stop: StopSignal,
    pub admin_timeout: Duration,
    pub ws_page_size: usize,
}

#[derive(Debug, Deserialize)]
struct TxRequest {
    id: String,
    sender: String,
    method: Method,
    submitted_at: Option<u64>,
}

#[derive(Debug, Serialize)]
struct TxResponse {
    ok: bool,
    tx_id: String,
    position: u64,
    simulated: SimulatedResult,
}

#[derive(Debug, Serialize)]
struct SimulateResponse {
    ok: bool,
    simulated: SimulatedResult,
}

#[derive(Debug, Serialize)]
struct StateResponse {
    ok: bool,
    settled_height: u64,
    da_finalized_height: Option<u64>,
    state: LedgerSnapshot,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ok: bool,
    settled_height: u64,
    da_finalized_height: Option<u64>,
    pending_count: usize,
    in_flight: Vec<BatchView>,
    halted: Option<Halt>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    ok: bool,
    batch: BatchView,
    prev_state_root: B256,
    post_state_root: B256,
    tx_ids: Vec<B256>,
}

#[derive(Debug, Serialize)]
struct TxStatusResponse {
    ok: bool,
    tx_id: String,
    #[serde(flatten)]
    location: TxLocation,
    finalized: bool,
    settled_height: u64,
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    ok: bool,
    sequence_number: u64,
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    from: Option<u64>,
}

pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([HttpMethod::GET, HttpMethod::POST])
        .allow_headers(Any);

    Router::new()
        .route("/tx", post(submit_tx))
        .route("/tx/{id}", get(get_tx))
        .route("/simulate", post(simulate_tx))
        .route("/state", get(get_state))
        .route("/status", get(get_status))
        .route("/batches/{sequence_number}", get(get_batch))
        .route(
            "/admin/batches/{sequence_number}/retry",
            post(retry_batch),
        )
        .route("/ws/batches", get(subscribe_batches))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn submit_tx(
    State(state): State<Arc<AppState>>,
    req: Result<Json<TxRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<TxResponse>, ApiError> {
    if state.stop.is_requested() {
        return Err(ApiError::unavailable("relay is shutting down"));
    }
    let Json(req) = req.map_err(|err| ApiError::bad_request(format!("invalid JSON: {err}")))?;
    let tx = build_transaction(req)?;
    let tx_id = tx.id;

    // Admission appends to `pending_txs` under the overlay lock.
    let intake = Arc::clone(&state.intake);
    let accepted = tokio::task::spawn_blocking(move || intake.submit(tx))
        .await
        .map_err(|err| ApiError::internal_error(format!("intake task failed: {err}")))??;
    info!(
        tx_id = %tx_id,
        position = accepted.position,
        settled_height = accepted.simulated.settled_height,
        "tx accepted"
    );

    Ok(Json(TxResponse {
        ok: true,
        tx_id: encode_hex(&tx_id),
        position: accepted.position,
        simulated: accepted.simulated,
    }))
}

async fn simulate_tx(
    State(state): State<Arc<AppState>>,
    req: Result<Json<TxRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<SimulateResponse>, ApiError> {
    let Json(req) = req.map_err(|err| ApiError::bad_request(format!("invalid JSON: {err}")))?;
    let tx = build_transaction(req)?;
    let simulated = state.intake.simulate(&tx)?;
    Ok(Json(SimulateResponse {
        ok: true,
        simulated,
    }))
}

async fn get_state(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    let ledger = state.intake.projector().authoritative();
    Json(StateResponse {
        ok: true,
        settled_height: ledger.height(),
        da_finalized_height: state.status.da_finalized_height(),
        state: ledger.snapshot(),
    })
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snapshot = state.status.snapshot();
    Json(StatusResponse {
        ok: true,
        settled_height: snapshot.settled_height,
        da_finalized_height: snapshot.da_finalized_height,
        pending_count: state.intake.pending_count(),
        in_flight: snapshot.in_flight,
        halted: snapshot.halted,
    })
}

async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(sequence_number): Path<u64>,
) -> Result<Json<BatchResponse>, ApiError> {
    let stored = storage::blocking(&state.storage, move |storage| {
        storage.load_batch(sequence_number)
    })
    .await
    .map_err(|err| ApiError::internal_error(format!("cannot load batch: {err}")))?;
    let Some(mut batch) = stored else {
        return Err(ApiError::not_found(format!(
            "batch {sequence_number} does not exist"
        )));
    };
    // Trackers persist on transitions; the in-memory view also carries polled DA heights.
    if let Some(view) = state.status.batch(sequence_number) {
        batch.da_finalized_height = view.da_finalized_height.or(batch.da_finalized_height);
    }

    Ok(Json(BatchResponse {
        ok: true,
        batch: BatchView::of(&batch),
        prev_state_root: batch.prev_state_root,
        post_state_root: batch.post_state_root,
        tx_ids: batch.transactions.iter().map(|tx| tx.id).collect(),
    }))
}

async fn get_tx(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TxStatusResponse>, ApiError> {
    let tx_id = parse_b256(&id).map_err(ApiError::bad_request)?;
    let location = storage::blocking(&state.storage, move |storage| storage.locate_tx(&tx_id))
        .await
        .map_err(|err| ApiError::internal_error(format!("cannot locate tx: {err}")))?
        .ok_or_else(|| ApiError::not_found(format!("tx {id} is unknown")))?;
    let finalized = matches!(
        location,
        TxLocation::Batched { status, .. } if status.is_finalized()
    );

    Ok(Json(TxStatusResponse {
        ok: true,
        tx_id: encode_hex(&tx_id),
        location,
        finalized,
        settled_height: state.status.settled_height(),
    }))
}

async fn retry_batch(
    State(state): State<Arc<AppState>>,
    Path(sequence_number): Path<u64>,
) -> Result<Json<RetryResponse>, ApiError> {
    let (respond_to, response) = oneshot::channel();
    let command = SubmitterCommand::Retry {
        sequence_number,
        respond_to,
    };
    state
        .submitter
        .send_timeout(command, state.admin_timeout)
        .await
        .map_err(|_| ApiError::from(RetryError::SubmitterClosed))?;
    let result = tokio::time::timeout(state.admin_timeout, response)
        .await
        .map_err(|_| ApiError::unavailable("submitter did not answer in time"))?
        .map_err(|_| ApiError::from(RetryError::SubmitterClosed))?;
    result?;

    info!(sequence_number, "operator retry accepted");
    Ok(Json(RetryResponse {
        ok: true,
        sequence_number,
    }))
}

async fn subscribe_batches(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let from = query.from.unwrap_or(1).max(1);
    ws.on_upgrade(move |socket| stream_batches(socket, state, from))
}

/// Replays committed batches from storage up to the live start, then forwards live ones.
async fn stream_batches(mut socket: WebSocket, state: Arc<AppState>, from: u64) {
    let LiveSubscription {
        mut receiver,
        live_start_sequence,
    } = state.broadcaster.subscribe();
    let mut next = from;

    while next < live_start_sequence {
        let page_size = state.ws_page_size;
        let page = storage::blocking(&state.storage, move |storage| {
            storage.load_committed_batches_from(next, page_size)
        })
        .await;
        let page = match page {
            Ok(page) if !page.is_empty() => page,
            Ok(_) => break,
            Err(err) => {
                warn!(error = %err, from = next, "cannot replay committed batches");
                return;
            }
        };
        for batch in page {
            if batch.sequence_number >= live_start_sequence {
                break;
            }
            next = batch.sequence_number + 1;
            if send_message(&mut socket, &BroadcastBatchMessage::committed(&batch))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    let mut stop = state.stop.clone();
    loop {
        tokio::select! {
            _ = stop.requested() => break,
            live = receiver.recv() => {
                let Some(message) = live else {
                    debug!("batch subscriber dropped by broadcaster");
                    break;
                };
                if let BroadcastBatchMessage::Committed { sequence_number, .. } = &message {
                    if *sequence_number < next {
                        continue;
                    }
                    next = sequence_number + 1;
                }
                if send_message(&mut socket, &message).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_message(
    socket: &mut WebSocket,
    message: &BroadcastBatchMessage,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "cannot serialize batch message");
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}

fn build_transaction(req: TxRequest) -> Result<Transaction, ApiError> {
    let id = parse_b256(&req.id).map_err(ApiError::bad_request)?;
    let sender = parse_address(&req.sender).map_err(ApiError::bad_request)?;
    let submitted_at = req
        .submitted_at
        .unwrap_or_else(|| u64::try_from(now_unix_ms()).unwrap_or_default());
    Ok(Transaction::new(id, sender, &req.method, submitted_at))
}

fn decode_hex_0x(value: &str) -> Result<Vec<u8>, String> {
    if !value.starts_with("0x") {
        return Err("hex string must start with 0x".to_string());
    }
    alloy_primitives::hex::decode(value).map_err(|err| format!("invalid hex: {err}"))
}

fn parse_address(value: &str) -> Result<Address, String> {
    let bytes = decode_hex_0x(value)?;
    if bytes.len() != 20 {
        return Err("address must be 20 bytes".to_string());
    }
    Ok(Address::from_slice(&bytes))
}

fn parse_b256(value: &str) -> Result<B256, String> {
    let bytes = decode_hex_0x(value)?;
    if bytes.len() != 32 {
        return Err("transaction id must be 32 bytes".to_string());
    }
    Ok(B256::from_slice(&bytes))
}

fn encode_hex(value: &B256) -> String {
    alloy_primitives::hex::encode_prefixed(value.as_slice())
}
