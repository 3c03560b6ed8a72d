//! The chunk stream as seen by the transfer service.
//!
//! A [`ChunkChannel`] is an ordered, bidirectional message channel between
//! one client and one storage node. Its receive side distinguishes a clean
//! end of input (`Ok(None)`) from a cancellation or transport fault.
//!
//! [`QueueChannel`] is the in-process implementation: two bounded queues and
//! a cancellation token. Wire adapters (see `handlers::transfer_handlers`)
//! pump frames into one; tests drive one directly through its
//! [`PeerHandle`].

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::chunk::Chunk;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("stream cancelled")]
    Cancelled,
    #[error("peer disconnected: {0}")]
    Disconnected(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

pub trait ChunkChannel: Send {
    /// Next message from the peer. `Ok(None)` is a clean end of input.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Chunk>, ChannelError>> + Send;

    /// Send a message to the peer.
    fn send(&mut self, chunk: Chunk) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

/// Server side of an in-process chunk stream.
#[derive(Debug)]
pub struct QueueChannel {
    inbound: mpsc::Receiver<Result<Chunk, ChannelError>>,
    outbound: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
}

/// Client side of a [`QueueChannel`].
#[derive(Debug)]
pub struct PeerHandle {
    pub tx: mpsc::Sender<Result<Chunk, ChannelError>>,
    pub rx: mpsc::Receiver<Chunk>,
    pub cancel: CancellationToken,
}

impl QueueChannel {
    /// A connected pair with `capacity` slots in each direction.
    pub fn pair(capacity: usize) -> (Self, PeerHandle) {
        Self::pair_with_token(capacity, CancellationToken::new())
    }

    pub fn pair_with_token(capacity: usize, cancel: CancellationToken) -> (Self, PeerHandle) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound: in_rx,
                outbound: out_tx,
                cancel: cancel.clone(),
            },
            PeerHandle {
                tx: in_tx,
                rx: out_rx,
                cancel,
            },
        )
    }
}

impl ChunkChannel for QueueChannel {
    async fn recv(&mut self) -> Result<Option<Chunk>, ChannelError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled),
            msg = self.inbound.recv() => msg.transpose(),
        }
    }

    async fn send(&mut self, chunk: Chunk) -> Result<(), ChannelError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled),
            res = self.outbound.send(chunk) => res
                .map_err(|_| ChannelError::Disconnected("outbound queue closed".into())),
        }
    }
}

impl PeerHandle {
    /// Queue a chunk for the server. Fails once the server side is gone.
    pub async fn send(&self, chunk: Chunk) -> Result<(), ChannelError> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| ChannelError::Disconnected("server side closed".into()))
    }

    /// Inject a transport fault after everything already queued.
    pub async fn fail(&self, err: ChannelError) {
        let _ = self.tx.send(Err(err)).await;
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clean end of input: dropping the sender is what the server sees.
    pub fn finish(self) -> mpsc::Receiver<Chunk> {
        self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(offset: u64) -> Chunk {
        Chunk {
            file_id: "f".into(),
            offset,
            chunk_index: 0,
            data: Bytes::from_static(b"x"),
        }
    }

    #[tokio::test]
    async fn delivers_in_order_then_clean_end() {
        let (mut server, peer) = QueueChannel::pair(4);
        peer.send(chunk(0)).await.unwrap();
        peer.send(chunk(1)).await.unwrap();
        let _rx = peer.finish();

        assert_eq!(server.recv().await.unwrap().unwrap().offset, 0);
        assert_eq!(server.recv().await.unwrap().unwrap().offset, 1);
        assert_eq!(server.recv().await, Ok(None));
    }

    #[tokio::test]
    async fn fault_is_distinct_from_clean_end() {
        let (mut server, peer) = QueueChannel::pair(4);
        peer.fail(ChannelError::Disconnected("reset".into())).await;
        assert_eq!(
            server.recv().await,
            Err(ChannelError::Disconnected("reset".into()))
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_pending_recv() {
        let (mut server, peer) = QueueChannel::pair(4);
        let waiter = tokio::spawn(async move { server.recv().await });
        tokio::task::yield_now().await;
        peer.cancel();
        assert_eq!(waiter.await.unwrap(), Err(ChannelError::Cancelled));
    }

    #[tokio::test]
    async fn send_reaches_peer() {
        let (mut server, mut peer) = QueueChannel::pair(4);
        server.send(Chunk::status("f", 7)).await.unwrap();
        assert_eq!(peer.rx.recv().await.unwrap().offset, 7);
    }
}
