//! Fixed 16-byte envelope header.
//!
//! Wire format (little-endian):
//!
//! ```text
//! [0..2)   magic "TX"
//! [2..4)   version      u16
//! [4..6)   kind         u16
//! [6..8)   flags        u16
//! [8..12)  seq          u32
//! [12..16) payload_len  u32
//! [16..)   payload
//! ```

use crate::error::WireError;

/// Two magic bytes opening every envelope.
pub const MAGIC: [u8; 2] = *b"TX";

/// Header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Version this build speaks by default.
pub const PROTOCOL_VERSION: u16 = 1;

/// Versions this build can decode.
pub const SUPPORTED_VERSIONS: &[u16] = &[1];

/// Set on envelopes whose payload is a CHUNK of a larger message.
pub const FLAG_CHUNK: u16 = 0x0001;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u16,
    /// Raw kind; unknown kinds are left for the dispatcher to reject.
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(kind: u16, payload: Vec<u8>, seq: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            flags: 0,
            seq,
            payload,
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    /// Total encoded size of this envelope.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_envelope(self.kind, &self.payload, self.seq, self.flags, self.version)
    }
}

/// Encode a payload behind a header.
pub fn encode_envelope(kind: u16, payload: &[u8], seq: u32, flags: u16, version: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Whether `bytes` opens with the envelope magic.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && bytes[..MAGIC.len()] == MAGIC
}

/// Decode one complete envelope.
///
/// The buffer must hold exactly one envelope: a declared payload length that
/// disagrees with the bytes actually carried is an invalid frame.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::InvalidFrame(format!(
            "frame is {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if !has_magic(bytes) {
        return Err(WireError::InvalidFrame("bad magic".to_string()));
    }

    let version = u16::from_le_bytes([bytes[2], bytes[3]]);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(WireError::UnsupportedProtocol(version));
    }

    let kind = u16::from_le_bytes([bytes[4], bytes[5]]);
    let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
    let seq = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let payload_len = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;

    let carried = bytes.len() - HEADER_LEN;
    if payload_len != carried {
        return Err(WireError::InvalidFrame(format!(
            "payload_len {} but {} bytes carried",
            payload_len, carried
        )));
    }

    Ok(Envelope {
        version,
        kind,
        flags,
        seq,
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}
