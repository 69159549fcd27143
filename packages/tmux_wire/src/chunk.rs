//! Splitting oversized payloads into CHUNK messages and reassembling them.
//!
//! A chunk is index-addressed, so a receiver can accept the pieces of a
//! stream in any order. Streams that never complete are evicted after a TTL.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec::{ByteReader, ByteWriter};
use crate::error::WireError;
use crate::frame::HEADER_LEN;

/// Upper bound on `total_chunks` for one stream.
pub const MAX_CHUNKS: u16 = 1024;

/// Encoded size of a chunk payload excluding its data bytes:
/// stream id (4) + original kind (2) + original seq (4) + total (2) + index (2)
/// + data length prefix (4).
pub const CHUNK_HEADER_LEN: usize = 18;

/// Default lifetime of an incomplete stream.
pub const DEFAULT_CHUNK_TTL: Duration = Duration::from_secs(30);

/// Default cap on streams being reassembled at once.
pub const DEFAULT_MAX_STREAMS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_stream_id: u32,
    pub original_kind: u16,
    pub original_seq: u32,
    pub total_chunks: u16,
    pub chunk_index: u16,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(CHUNK_HEADER_LEN + self.data.len());
        self.write_to(&mut w);
        w.into_inner()
    }

    pub(crate) fn write_to(&self, w: &mut ByteWriter) {
        w.put_u32(self.chunk_stream_id);
        w.put_u16(self.original_kind);
        w.put_u32(self.original_seq);
        w.put_u16(self.total_chunks);
        w.put_u16(self.chunk_index);
        w.put_bytes(&self.data);
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(payload);
        let chunk = Self::read_from(&mut r)?;
        r.finish()?;
        Ok(chunk)
    }

    pub(crate) fn read_from(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            chunk_stream_id: r.u32()?,
            original_kind: r.u16()?,
            original_seq: r.u32()?,
            total_chunks: r.u16()?,
            chunk_index: r.u16()?,
            data: r.bytes()?,
        })
    }
}

/// Split `payload` into chunks whose CHUNK envelopes each fit `max_frame_bytes`.
///
/// Returns an empty vector when the unchunked envelope already fits.
pub fn split_into_chunks(
    payload: &[u8],
    kind: u16,
    seq: u32,
    max_frame_bytes: usize,
    stream_id: u32,
) -> Result<Vec<Chunk>, WireError> {
    if HEADER_LEN + payload.len() <= max_frame_bytes {
        return Ok(Vec::new());
    }

    let overhead = HEADER_LEN + CHUNK_HEADER_LEN;
    if max_frame_bytes <= overhead {
        return Err(WireError::FrameTooLarge(format!(
            "max frame of {} bytes leaves no room for chunk data (overhead {})",
            max_frame_bytes, overhead
        )));
    }
    let per_chunk = max_frame_bytes - overhead;

    let total = payload.len().div_ceil(per_chunk);
    if total > MAX_CHUNKS as usize {
        return Err(WireError::FrameTooLarge(format!(
            "{} byte payload needs {} chunks (max {})",
            payload.len(),
            total,
            MAX_CHUNKS
        )));
    }

    Ok(payload
        .chunks(per_chunk)
        .enumerate()
        .map(|(i, data)| Chunk {
            chunk_stream_id: stream_id,
            original_kind: kind,
            original_seq: seq,
            total_chunks: total as u16,
            chunk_index: i as u16,
            data: data.to_vec(),
        })
        .collect())
}

/// A message rebuilt from all of its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub kind: u16,
    pub seq: u32,
    pub payload: Vec<u8>,
}

struct ChunkStream {
    original_kind: u16,
    original_seq: u32,
    total_chunks: u16,
    parts: BTreeMap<u16, Vec<u8>>,
    created_at: Instant,
}

/// Receiver-side buffer of partially received chunk streams.
pub struct ChunkReassembler {
    streams: HashMap<u32, ChunkStream>,
    ttl: Duration,
    max_streams: usize,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CHUNK_TTL, DEFAULT_MAX_STREAMS)
    }

    pub fn with_limits(ttl: Duration, max_streams: usize) -> Self {
        Self {
            streams: HashMap::new(),
            ttl,
            max_streams,
        }
    }

    /// Number of incomplete streams held.
    pub fn pending_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn add_chunk(&mut self, chunk: Chunk) -> Result<Option<Reassembled>, WireError> {
        self.add_chunk_at(chunk, Instant::now())
    }

    /// Add a chunk, using `now` as the arrival time of a new stream.
    pub fn add_chunk_at(
        &mut self,
        chunk: Chunk,
        now: Instant,
    ) -> Result<Option<Reassembled>, WireError> {
        if chunk.total_chunks == 0 || chunk.total_chunks > MAX_CHUNKS {
            return Err(WireError::ChunkRejected(format!(
                "total_chunks {} outside 1..={}",
                chunk.total_chunks, MAX_CHUNKS
            )));
        }
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(WireError::ChunkRejected(format!(
                "chunk_index {} >= total_chunks {}",
                chunk.chunk_index, chunk.total_chunks
            )));
        }

        if !self.streams.contains_key(&chunk.chunk_stream_id) {
            if self.streams.len() >= self.max_streams {
                return Err(WireError::ChunkRejected(format!(
                    "too many open chunk streams ({})",
                    self.streams.len()
                )));
            }
            self.streams.insert(
                chunk.chunk_stream_id,
                ChunkStream {
                    original_kind: chunk.original_kind,
                    original_seq: chunk.original_seq,
                    total_chunks: chunk.total_chunks,
                    parts: BTreeMap::new(),
                    created_at: now,
                },
            );
        }

        let stream_id = chunk.chunk_stream_id;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(None);
        };

        if stream.original_kind != chunk.original_kind
            || stream.original_seq != chunk.original_seq
            || stream.total_chunks != chunk.total_chunks
        {
            return Err(WireError::ChunkRejected(format!(
                "chunk header mismatch in stream {}",
                stream_id
            )));
        }
        if stream.parts.contains_key(&chunk.chunk_index) {
            return Err(WireError::ChunkRejected(format!(
                "duplicate chunk_index {} in stream {}",
                chunk.chunk_index, stream_id
            )));
        }

        stream.parts.insert(chunk.chunk_index, chunk.data);
        if stream.parts.len() < stream.total_chunks as usize {
            return Ok(None);
        }

        let Some(stream) = self.streams.remove(&stream_id) else {
            return Ok(None);
        };
        let size = stream.parts.values().map(Vec::len).sum();
        let mut payload = Vec::with_capacity(size);
        // BTreeMap iterates in index order.
        for part in stream.parts.into_values() {
            payload.extend_from_slice(&part);
        }
        debug!(
            stream = stream_id,
            chunks = stream.total_chunks,
            bytes = payload.len(),
            "chunk stream reassembled"
        );
        Ok(Some(Reassembled {
            kind: stream.original_kind,
            seq: stream.original_seq,
            payload,
        }))
    }

    /// Evict streams older than the TTL. Returns how many were dropped.
    pub fn cleanup(&mut self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.streams.len();
        self.streams
            .retain(|_, s| now.saturating_duration_since(s.created_at) < ttl);
        let evicted = before - self.streams.len();
        if evicted > 0 {
            warn!(evicted, "evicted abandoned chunk streams");
        }
        evicted
    }
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new()
    }
}
