//! Relay WebSocket Handler
//!
//! One socket per browser. The socket multiplexes every target the client
//! attaches to; frames are binary envelopes in both directions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tmux_wire::{
    ChunkReassembler, DEFAULT_MAX_STREAMS, Envelope, ErrorPayload, FLAG_CHUNK, Message,
    MessageKind, WireError, split_into_chunks,
};

use super::client_state::ClientSessionStore;
use super::dispatch::{ConnectionContext, handle_frame};
use super::protocol::OUTBOUND_CAPACITY;
use crate::config::ServerConfig;
use crate::registry::ConnectionRegistry;

/// Sequence numbers and chunk stream ids for one direction of a socket.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    next_seq: u32,
    next_stream: u32,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn seq(&mut self) -> u32 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.next_seq
    }

    /// Encode `msg` into one or more websocket frames no larger than
    /// `max_frame_bytes`.
    pub fn encode(&mut self, msg: &Message, max_frame_bytes: usize) -> Result<Vec<Vec<u8>>, WireError> {
        let kind = msg.kind().as_u16();
        let payload = msg.encode();
        let seq = self.seq();

        self.next_stream = self.next_stream.wrapping_add(1);
        let chunks = split_into_chunks(&payload, kind, seq, max_frame_bytes, self.next_stream)?;
        if chunks.is_empty() {
            return Ok(vec![Envelope::new(kind, payload, seq).encode()]);
        }

        Ok(chunks
            .iter()
            .map(|chunk| {
                Envelope::new(MessageKind::Chunk.as_u16(), chunk.encode(), self.seq())
                    .with_flags(FLAG_CHUNK)
                    .encode()
            })
            .collect())
    }
}

/// Handle a relay WebSocket connection
pub async fn handle_relay_ws(
    socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    config: Arc<ServerConfig>,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %connection_id, "relay socket opened");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let max_frame_bytes = Arc::new(AtomicU32::new(config.max_frame_bytes));

    // Task to send messages to WebSocket
    let writer_frame_size = max_frame_bytes.clone();
    let writer_conn = connection_id.clone();
    let sender_task = async move {
        let mut encoder = FrameEncoder::new();
        while let Some(msg) = rx.recv().await {
            let limit = writer_frame_size.load(Ordering::Relaxed) as usize;
            let frames = match encoder.encode(&msg, limit) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(conn_id = %writer_conn, kind = msg.kind().name(), error = %e, "dropping oversized message");
                    let notice = Message::Error(ErrorPayload::from(&e));
                    match encoder.encode(&notice, limit) {
                        Ok(frames) => frames,
                        Err(_) => continue,
                    }
                }
            };
            for frame in frames {
                if ws_sender.send(WsMessage::Binary(frame.into())).await.is_err() {
                    return;
                }
            }
        }
    };

    let store = ClientSessionStore::new(registry, tx.clone());
    let mut ctx = ConnectionContext {
        connection_id: connection_id.clone(),
        out: tx.clone(),
        store: store.clone(),
        reassembler: ChunkReassembler::with_limits(config.chunk_ttl, DEFAULT_MAX_STREAMS),
        max_frame_bytes,
        server_max_frame_bytes: config.max_frame_bytes,
        heartbeat_ms: config.heartbeat_ms,
    };
    let cleanup_every = config.chunk_ttl;

    // Task to handle incoming messages
    let input_task = async move {
        let mut cleanup = tokio::time::interval(cleanup_every);
        cleanup.tick().await;
        loop {
            tokio::select! {
                _ = cleanup.tick() => {
                    let evicted = ctx.reassembler.cleanup();
                    if evicted > 0 {
                        debug!(conn_id = %ctx.connection_id, evicted, "evicted stale chunk streams");
                    }
                }
                msg = ws_receiver.next() => match msg {
                    Some(Ok(WsMessage::Binary(bytes))) => handle_frame(&mut ctx, &bytes).await,
                    Some(Ok(WsMessage::Text(_))) => {
                        let err = WireError::InvalidFrame("text frames are not accepted".into());
                        let _ = ctx.out.send(Message::Error(ErrorPayload::from(&err))).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(conn_id = %ctx.connection_id, error = %e, "socket read failed");
                        break;
                    }
                },
            }
        }
    };
    drop(tx);

    tokio::select! {
        _ = sender_task => {}
        _ = input_task => {}
    }

    store.close_all().await;
    info!(conn_id = %connection_id, "relay socket closed");
}
