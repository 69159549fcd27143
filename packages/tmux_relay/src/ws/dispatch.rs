//! Inbound frame handling for one socket.
//!
//! Frames are decoded, reassembled when chunked and routed to the session
//! store. Anything malformed is answered with an ERROR frame; the socket
//! stays open.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use tmux_wire::{
    Chunk, ChunkReassembler, ErrorPayload, FLAG_CHUNK, HelloAck, Message, MessageKind,
    PROTOCOL_VERSION, SUPPORTED_VERSIONS, WireError, decode_envelope,
};

use super::client_state::ClientSessionStore;
use super::protocol::Outbound;

pub const SERVER_NAME: &str = "tmux-relay";

/// Per-connection state shared by the input loop and the dispatcher.
pub(crate) struct ConnectionContext {
    pub connection_id: String,
    pub out: Outbound,
    pub store: Arc<ClientSessionStore>,
    pub reassembler: ChunkReassembler,
    /// Frame size the writer chunks against; lowered by HELLO.
    pub max_frame_bytes: Arc<AtomicU32>,
    pub server_max_frame_bytes: u32,
    pub heartbeat_ms: u32,
}

impl ConnectionContext {
    async fn send(&self, msg: Message) {
        let _ = self.out.send(msg).await;
    }

    async fn reject(&self, err: &WireError, seq: Option<u32>) {
        debug!(conn_id = %self.connection_id, error = %err, "rejecting frame");
        let mut payload = ErrorPayload::from(err);
        if let Some(seq) = seq {
            payload = payload.in_reply_to(seq);
        }
        self.send(Message::Error(payload)).await;
    }
}

/// Handle one binary websocket message.
pub(crate) async fn handle_frame(ctx: &mut ConnectionContext, bytes: &[u8]) {
    let envelope = match decode_envelope(bytes) {
        Ok(envelope) => envelope,
        Err(e) => return ctx.reject(&e, None).await,
    };

    let is_chunk =
        envelope.flags & FLAG_CHUNK != 0 || envelope.kind == MessageKind::Chunk.as_u16();
    if !is_chunk {
        return dispatch_payload(ctx, envelope.kind, envelope.seq, &envelope.payload).await;
    }

    let chunk = match Chunk::decode(&envelope.payload) {
        Ok(chunk) => chunk,
        Err(e) => return ctx.reject(&e, Some(envelope.seq)).await,
    };
    match ctx.reassembler.add_chunk(chunk) {
        Ok(Some(done)) => dispatch_payload(ctx, done.kind, done.seq, &done.payload).await,
        Ok(None) => {}
        Err(e) => ctx.reject(&e, Some(envelope.seq)).await,
    }
}

async fn dispatch_payload(ctx: &mut ConnectionContext, kind: u16, seq: u32, payload: &[u8]) {
    match Message::decode(kind, payload) {
        Ok(msg) => dispatch(ctx, seq, msg).await,
        Err(e) => ctx.reject(&e, Some(seq)).await,
    }
}

/// Route one decoded client message.
pub(crate) async fn dispatch(ctx: &mut ConnectionContext, seq: u32, msg: Message) {
    match msg {
        Message::HelloC2s(hello) => {
            if !SUPPORTED_VERSIONS.contains(&hello.version) {
                warn!(
                    conn_id = %ctx.connection_id,
                    version = hello.version,
                    client = %hello.client_name,
                    "unsupported protocol version"
                );
                return ctx
                    .reject(&WireError::UnsupportedProtocol(hello.version), Some(seq))
                    .await;
            }
            let max_frame_bytes = negotiate_frame_size(ctx.server_max_frame_bytes, hello.max_frame_bytes);
            ctx.max_frame_bytes.store(max_frame_bytes, Ordering::Relaxed);
            debug!(
                conn_id = %ctx.connection_id,
                client = %hello.client_name,
                max_frame_bytes,
                "hello"
            );
            ctx.send(Message::HelloS2c(HelloAck {
                version: PROTOCOL_VERSION,
                server_name: SERVER_NAME.to_string(),
                max_frame_bytes,
                heartbeat_ms: ctx.heartbeat_ms,
            }))
            .await;
        }
        Message::Ping(ping) => ctx.send(Message::Pong(ping)).await,
        Message::Pong(_) => {}
        Message::Error(err) => {
            debug!(conn_id = %ctx.connection_id, code = err.code, message = %err.message, "client reported error");
        }
        Message::DeviceConnect(target) => {
            // Connecting can take seconds; keep reading meanwhile.
            let store = ctx.store.clone();
            tokio::spawn(async move { store.connect(&target.target_id).await });
        }
        Message::DeviceDisconnect(target) => ctx.store.disconnect(&target.target_id).await,
        Message::TmuxSelect(select) => ctx.store.select(select).await,
        Message::TermInput(input) => ctx.store.input(input).await,
        Message::TermPaste(paste) => ctx.store.paste(paste).await,
        Message::TermResize(resize) => ctx.store.resize(resize).await,
        Message::TermSyncSize(sync) => ctx.store.sync_size(sync).await,
        other => {
            let err = WireError::InvalidFrame(format!(
                "{} is not accepted from clients",
                other.kind().name()
            ));
            ctx.reject(&err, Some(seq)).await;
        }
    }
}

/// Smallest frame size a client may ask for. Below this even an ERROR
/// notice cannot be chunked.
pub const MIN_FRAME_BYTES: u32 = 1024;

/// The smaller of the two limits, never below [`MIN_FRAME_BYTES`] unless the
/// server's own limit is lower. Zero from the client means no preference.
pub fn negotiate_frame_size(server: u32, client: u32) -> u32 {
    if client == 0 {
        server
    } else {
        server.min(client.max(MIN_FRAME_BYTES))
    }
}
