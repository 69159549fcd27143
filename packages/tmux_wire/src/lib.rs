//! tmux_wire - binary protocol spoken between the browser and the relay
//!
//! Every message is a 16-byte little-endian envelope followed by a payload.
//! Payloads larger than the negotiated frame size travel as a sequence of
//! CHUNK messages and are rebuilt on the receiving side.
//!
//! # Example
//!
//! ```
//! use tmux_wire::{decode_envelope, Envelope, Message, Ping};
//!
//! let ping = Message::Ping(Ping { nonce: 7 });
//! let bytes = Envelope::new(ping.kind().as_u16(), ping.encode(), 1).encode();
//!
//! let env = decode_envelope(&bytes).unwrap();
//! assert_eq!(Message::decode(env.kind, &env.payload).unwrap(), ping);
//! ```

pub mod chunk;
pub mod codec;
pub mod error;
pub mod frame;
pub mod kind;
pub mod payload;

pub use chunk::{
    CHUNK_HEADER_LEN, Chunk, ChunkReassembler, DEFAULT_CHUNK_TTL, DEFAULT_MAX_STREAMS, MAX_CHUNKS,
    Reassembled, split_into_chunks,
};
pub use error::{ErrorCode, WireError};
pub use frame::{
    Envelope, FLAG_CHUNK, HEADER_LEN, MAGIC, PROTOCOL_VERSION, SUPPORTED_VERSIONS,
    decode_envelope, encode_envelope, has_magic,
};
pub use kind::MessageKind;
pub use payload::*;
