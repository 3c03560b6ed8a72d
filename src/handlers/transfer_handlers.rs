//! Storage-node WebSocket surface.
//!
//! `GET /stream` upgrades to a WebSocket carrying one JSON [`Chunk`] per
//! text frame. A read pump and a write pump move frames between the socket
//! and a [`QueueChannel`] that the transfer service drives; the pumps share
//! nothing but the queues and the connection's cancellation token. When the
//! service returns, the outcome goes back to the client as the close code.

use std::time::Duration;

use axum::{
    Json,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    errors::CLOSE_NORMAL,
    models::{chunk::Chunk, progress::UploadProgress},
    services::{
        channel::{ChannelError, PeerHandle, QueueChannel},
        token::bearer_token,
        transfer_service::{StreamSummary, TransferResult, TransferService},
    },
};

/// Messages buffered per direction between the socket and the service.
const QUEUE_DEPTH: usize = 32;

/// How long the write pump gets to flush status and the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// WebSocket close reasons are capped at 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

/// Shared state of the storage node's router.
#[derive(Clone)]
pub struct StorageState {
    pub transfer: TransferService,
    /// Cancelled on shutdown; every connection runs under a child token.
    pub shutdown: CancellationToken,
    /// Largest WebSocket message accepted from a client.
    pub max_message_bytes: usize,
}

/// `GET /stream`
pub async fn stream_file(
    State(state): State<StorageState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);

    let limit = state.max_message_bytes;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| serve_socket(state, socket, token))
}

/// `GET /uploads/active`
pub async fn list_active(State(state): State<StorageState>) -> impl IntoResponse {
    Json::<Vec<UploadProgress>>(state.transfer.active().snapshot())
}

async fn serve_socket(state: StorageState, socket: WebSocket, token: Option<String>) {
    let cancel = state.shutdown.child_token();
    let (channel, peer) = QueueChannel::pair_with_token(QUEUE_DEPTH, cancel.clone());
    let PeerHandle { tx, rx, .. } = peer;
    let (sink, stream) = socket.split();
    let (close_tx, close_rx) = oneshot::channel();

    let reader = tokio::spawn(read_pump(stream, tx, cancel.clone()));
    let mut writer = tokio::spawn(write_pump(sink, rx, close_rx, cancel.clone()));

    let result = state.transfer.stream_file(channel, token.as_deref()).await;
    let _ = close_tx.send(close_frame(&result));

    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        debug!("write pump did not finish within grace period");
        writer.abort();
    }
    cancel.cancel();
    let _ = reader.await;
}

/// Socket → service. Ends on a close frame (clean end of input), on a
/// transport error or undecodable frame (forwarded as a fault), or on
/// cancellation.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    tx: mpsc::Sender<Result<Chunk, ChannelError>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = stream.next() => msg,
        };
        let item = match next {
            Some(Ok(Message::Text(text))) => decode(text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => decode(&bytes),
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "client closed the stream");
                return;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => Err(ChannelError::Disconnected(err.to_string())),
            None => Err(ChannelError::Disconnected(
                "connection dropped without a close frame".into(),
            )),
        };

        let fatal = item.is_err();
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(item) => if sent.is_err() { return },
        }
        if fatal {
            return;
        }
    }
}

fn decode(bytes: &[u8]) -> Result<Chunk, ChannelError> {
    serde_json::from_slice(bytes).map_err(|err| ChannelError::Malformed(err.to_string()))
}

/// Service → socket. Drains status chunks until the service drops its end,
/// then sends the close frame describing the outcome. The close is sent even
/// after a failed status write, since it also flushes the reply to a close
/// the client started.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Chunk>,
    close: oneshot::Receiver<CloseFrame>,
    cancel: CancellationToken,
) {
    while let Some(chunk) = rx.recv().await {
        let text = match serde_json::to_string(&chunk) {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to encode status chunk: {}", err);
                continue;
            }
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            sent = sink.send(Message::Text(text.into())) => sent,
        };
        if let Err(err) = sent {
            debug!("status not delivered: {}", err);
            break;
        }
    }

    if let Ok(frame) = close.await {
        if let Err(err) = sink.send(Message::Close(Some(frame))).await {
            debug!("close frame not delivered: {}", err);
        }
    }
}

fn close_frame(result: &TransferResult<StreamSummary>) -> CloseFrame {
    match result {
        Ok(_) => CloseFrame {
            code: CLOSE_NORMAL,
            reason: "upload stream finished".into(),
        },
        Err(err) => CloseFrame {
            code: err.code().close_code(),
            reason: truncate_reason(err.to_string()).into(),
        },
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    reason
}
