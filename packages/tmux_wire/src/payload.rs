//! Structured payloads for every message kind.
//!
//! Each payload knows how to write itself to and read itself from the
//! primitive codec. [`Message`] ties a payload to its [`MessageKind`] so
//! dispatch is an exhaustive `match` instead of a lookup on raw numbers.

use crate::chunk::Chunk;
use crate::codec::{ByteReader, ByteWriter};
use crate::error::{ErrorCode, WireError};
use crate::kind::MessageKind;

/// Per-payload binary layout.
pub trait Payload: Sized {
    fn write(&self, w: &mut ByteWriter);
    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.write(&mut w);
        w.into_inner()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(bytes);
        let value = Self::read(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}

/// 16 random bytes naming one focus-change transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SelectToken(pub [u8; 16]);

impl SelectToken {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for SelectToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SelectToken({})", self)
    }
}

impl std::fmt::Display for SelectToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// How the `data` bytes of a terminal payload should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataEncoding {
    Utf8 = 0,
    Binary = 1,
}

impl DataEncoding {
    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        match r.u8()? {
            0 => Ok(Self::Utf8),
            1 => Ok(Self::Binary),
            other => Err(WireError::PayloadDecode(format!(
                "unknown data encoding {}",
                other
            ))),
        }
    }

    /// Pick UTF-8 when the bytes are valid UTF-8, raw otherwise.
    pub fn for_bytes(data: &[u8]) -> Self {
        if std::str::from_utf8(data).is_ok() {
            Self::Utf8
        } else {
            Self::Binary
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub client_name: String,
    pub max_frame_bytes: u32,
}

impl Payload for Hello {
    fn write(&self, w: &mut ByteWriter) {
        w.put_u16(self.version);
        w.put_str(&self.client_name);
        w.put_u32(self.max_frame_bytes);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            version: r.u16()?,
            client_name: r.string()?,
            max_frame_bytes: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloAck {
    pub version: u16,
    pub server_name: String,
    pub max_frame_bytes: u32,
    pub heartbeat_ms: u32,
}

impl Payload for HelloAck {
    fn write(&self, w: &mut ByteWriter) {
        w.put_u16(self.version);
        w.put_str(&self.server_name);
        w.put_u32(self.max_frame_bytes);
        w.put_u32(self.heartbeat_ms);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            version: r.u16()?,
            server_name: r.string()?,
            max_frame_bytes: r.u32()?,
            heartbeat_ms: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

impl Payload for Ping {
    fn write(&self, w: &mut ByteWriter) {
        w.put_u64(self.nonce);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self { nonce: r.u64()? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: u16,
    pub retryable: bool,
    pub message: String,
    pub target_id: Option<String>,
    /// Seq of the request that caused the error, when there was one.
    pub ref_seq: Option<u32>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            retryable,
            message: message.into(),
            target_id: None,
            ref_seq: None,
        }
    }

    pub fn for_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn in_reply_to(mut self, seq: u32) -> Self {
        self.ref_seq = Some(seq);
        self
    }
}

impl From<&WireError> for ErrorPayload {
    fn from(err: &WireError) -> Self {
        ErrorPayload::new(err.code(), err.retryable(), err.to_string())
    }
}

impl Payload for ErrorPayload {
    fn write(&self, w: &mut ByteWriter) {
        w.put_u16(self.code);
        w.put_bool(self.retryable);
        w.put_str(&self.message);
        w.put_opt_str(self.target_id.as_deref());
        w.put_opt_u32(self.ref_seq);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            code: r.u16()?,
            retryable: r.bool()?,
            message: r.string()?,
            target_id: r.opt_string()?,
            ref_seq: r.opt_u32()?,
        })
    }
}

/// Payload carrying only a target id (DEVICE_CONNECT, DEVICE_DISCONNECT).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub target_id: String,
}

impl Payload for TargetRef {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConnected {
    pub target_id: String,
    pub session_name: String,
}

impl Payload for DeviceConnected {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_str(&self.session_name);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            session_name: r.string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDisconnected {
    pub target_id: String,
    pub reason: Option<String>,
}

impl Payload for DeviceDisconnected {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_opt_str(self.reason.as_deref());
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            reason: r.opt_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceEventKind {
    Error = 0,
    Exit = 1,
    Closed = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub target_id: String,
    pub event: DeviceEventKind,
    /// Machine-readable sub-code, e.g. `auth_failed`.
    pub code: Option<String>,
    pub message: String,
}

impl Payload for DeviceEvent {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_u8(self.event as u8);
        w.put_opt_str(self.code.as_deref());
        w.put_str(&self.message);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let target_id = r.string()?;
        let event = match r.u8()? {
            0 => DeviceEventKind::Error,
            1 => DeviceEventKind::Exit,
            2 => DeviceEventKind::Closed,
            other => {
                return Err(WireError::PayloadDecode(format!(
                    "unknown device event {}",
                    other
                )));
            }
        };
        Ok(Self {
            target_id,
            event,
            code: r.opt_string()?,
            message: r.string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxSelect {
    pub target_id: String,
    pub window_id: Option<String>,
    pub pane_id: Option<String>,
    pub select_token: SelectToken,
    pub want_history: bool,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl Payload for TmuxSelect {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_opt_str(self.window_id.as_deref());
        w.put_opt_str(self.pane_id.as_deref());
        w.put_fixed(self.select_token.as_bytes());
        w.put_bool(self.want_history);
        w.put_opt_u16(self.cols);
        w.put_opt_u16(self.rows);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            window_id: r.opt_string()?,
            pane_id: r.opt_string()?,
            select_token: SelectToken(r.fixed::<16>()?),
            want_history: r.bool()?,
            cols: r.opt_u16()?,
            rows: r.opt_u16()?,
        })
    }
}

/// Structural tmux notifications forwarded to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TmuxEvent {
    WindowAdded {
        window_id: String,
    },
    WindowClosed {
        window_id: String,
    },
    WindowRenamed {
        window_id: String,
        name: String,
    },
    PaneClosed {
        pane_id: String,
    },
    SessionChanged {
        session_id: String,
        name: String,
    },
    LayoutChanged {
        window_id: String,
        layout: String,
    },
    Bell {
        pane_id: Option<String>,
        window_id: Option<String>,
    },
    WindowPaneChanged {
        window_id: String,
        pane_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxEventPayload {
    pub target_id: String,
    pub event: TmuxEvent,
}

impl Payload for TmuxEventPayload {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        match &self.event {
            TmuxEvent::WindowAdded { window_id } => {
                w.put_u8(0);
                w.put_str(window_id);
            }
            TmuxEvent::WindowClosed { window_id } => {
                w.put_u8(1);
                w.put_str(window_id);
            }
            TmuxEvent::WindowRenamed { window_id, name } => {
                w.put_u8(2);
                w.put_str(window_id);
                w.put_str(name);
            }
            TmuxEvent::PaneClosed { pane_id } => {
                w.put_u8(3);
                w.put_str(pane_id);
            }
            TmuxEvent::SessionChanged { session_id, name } => {
                w.put_u8(4);
                w.put_str(session_id);
                w.put_str(name);
            }
            TmuxEvent::LayoutChanged { window_id, layout } => {
                w.put_u8(5);
                w.put_str(window_id);
                w.put_str(layout);
            }
            TmuxEvent::Bell { pane_id, window_id } => {
                w.put_u8(6);
                w.put_opt_str(pane_id.as_deref());
                w.put_opt_str(window_id.as_deref());
            }
            TmuxEvent::WindowPaneChanged { window_id, pane_id } => {
                w.put_u8(7);
                w.put_str(window_id);
                w.put_str(pane_id);
            }
        }
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let target_id = r.string()?;
        let event = match r.u8()? {
            0 => TmuxEvent::WindowAdded {
                window_id: r.string()?,
            },
            1 => TmuxEvent::WindowClosed {
                window_id: r.string()?,
            },
            2 => TmuxEvent::WindowRenamed {
                window_id: r.string()?,
                name: r.string()?,
            },
            3 => TmuxEvent::PaneClosed {
                pane_id: r.string()?,
            },
            4 => TmuxEvent::SessionChanged {
                session_id: r.string()?,
                name: r.string()?,
            },
            5 => TmuxEvent::LayoutChanged {
                window_id: r.string()?,
                layout: r.string()?,
            },
            6 => TmuxEvent::Bell {
                pane_id: r.opt_string()?,
                window_id: r.opt_string()?,
            },
            7 => TmuxEvent::WindowPaneChanged {
                window_id: r.string()?,
                pane_id: r.string()?,
            },
            other => {
                return Err(WireError::PayloadDecode(format!(
                    "unknown tmux event tag {}",
                    other
                )));
            }
        };
        Ok(Self { target_id, event })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSession {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotWindow {
    pub id: String,
    pub name: String,
    pub index: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPane {
    pub id: String,
    pub window_id: String,
    pub index: u32,
    pub title: Option<String>,
    pub active: bool,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub target_id: String,
    pub session: SnapshotSession,
    pub windows: Vec<SnapshotWindow>,
    pub panes: Vec<SnapshotPane>,
}

impl Payload for StateSnapshot {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_str(&self.session.id);
        w.put_str(&self.session.name);
        w.put_u32(self.windows.len() as u32);
        for win in &self.windows {
            w.put_str(&win.id);
            w.put_str(&win.name);
            w.put_u32(win.index);
            w.put_bool(win.active);
        }
        w.put_u32(self.panes.len() as u32);
        for pane in &self.panes {
            w.put_str(&pane.id);
            w.put_str(&pane.window_id);
            w.put_u32(pane.index);
            w.put_opt_str(pane.title.as_deref());
            w.put_bool(pane.active);
            w.put_u16(pane.width);
            w.put_u16(pane.height);
        }
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let target_id = r.string()?;
        let session = SnapshotSession {
            id: r.string()?,
            name: r.string()?,
        };
        let window_count = r.u32()? as usize;
        // Each window needs at least 13 bytes; bound the allocation by what
        // the buffer could actually hold.
        let mut windows = Vec::with_capacity(window_count.min(r.remaining() / 13));
        for _ in 0..window_count {
            windows.push(SnapshotWindow {
                id: r.string()?,
                name: r.string()?,
                index: r.u32()?,
                active: r.bool()?,
            });
        }
        let pane_count = r.u32()? as usize;
        let mut panes = Vec::with_capacity(pane_count.min(r.remaining() / 18));
        for _ in 0..pane_count {
            panes.push(SnapshotPane {
                id: r.string()?,
                window_id: r.string()?,
                index: r.u32()?,
                title: r.opt_string()?,
                active: r.bool()?,
                width: r.u16()?,
                height: r.u16()?,
            });
        }
        Ok(Self {
            target_id,
            session,
            windows,
            panes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermInput {
    pub target_id: String,
    pub pane_id: String,
    pub encoding: DataEncoding,
    pub data: Vec<u8>,
    pub is_composing: bool,
}

impl Payload for TermInput {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_str(&self.pane_id);
        w.put_u8(self.encoding as u8);
        w.put_bytes(&self.data);
        w.put_bool(self.is_composing);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            pane_id: r.string()?,
            encoding: DataEncoding::read(r)?,
            data: r.bytes()?,
            is_composing: r.bool()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermPaste {
    pub target_id: String,
    pub pane_id: String,
    pub data: Vec<u8>,
}

impl Payload for TermPaste {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_str(&self.pane_id);
        w.put_bytes(&self.data);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            pane_id: r.string()?,
            data: r.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermResize {
    pub target_id: String,
    pub pane_id: String,
    pub cols: u16,
    pub rows: u16,
}

impl Payload for TermResize {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_str(&self.pane_id);
        w.put_u16(self.cols);
        w.put_u16(self.rows);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            pane_id: r.string()?,
            cols: r.u16()?,
            rows: r.u16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermSyncSize {
    pub target_id: String,
    pub cols: u16,
    pub rows: u16,
}

impl Payload for TermSyncSize {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_u16(self.cols);
        w.put_u16(self.rows);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            cols: r.u16()?,
            rows: r.u16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermOutput {
    pub target_id: String,
    pub pane_id: String,
    pub encoding: DataEncoding,
    pub data: Vec<u8>,
}

impl Payload for TermOutput {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_str(&self.pane_id);
        w.put_u8(self.encoding as u8);
        w.put_bytes(&self.data);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            pane_id: r.string()?,
            encoding: DataEncoding::read(r)?,
            data: r.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermHistory {
    pub target_id: String,
    pub pane_id: String,
    pub select_token: SelectToken,
    pub encoding: DataEncoding,
    pub data: Vec<u8>,
}

impl Payload for TermHistory {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_str(&self.pane_id);
        w.put_fixed(self.select_token.as_bytes());
        w.put_u8(self.encoding as u8);
        w.put_bytes(&self.data);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            pane_id: r.string()?,
            select_token: SelectToken(r.fixed::<16>()?),
            encoding: DataEncoding::read(r)?,
            data: r.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchAck {
    pub target_id: String,
    pub window_id: String,
    pub pane_id: String,
    pub select_token: SelectToken,
}

impl Payload for SwitchAck {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_str(&self.window_id);
        w.put_str(&self.pane_id);
        w.put_fixed(self.select_token.as_bytes());
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            window_id: r.string()?,
            pane_id: r.string()?,
            select_token: SelectToken(r.fixed::<16>()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveResume {
    pub target_id: String,
    pub pane_id: String,
    pub select_token: SelectToken,
}

impl Payload for LiveResume {
    fn write(&self, w: &mut ByteWriter) {
        w.put_str(&self.target_id);
        w.put_str(&self.pane_id);
        w.put_fixed(self.select_token.as_bytes());
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            target_id: r.string()?,
            pane_id: r.string()?,
            select_token: SelectToken(r.fixed::<16>()?),
        })
    }
}

impl Payload for Chunk {
    fn write(&self, w: &mut ByteWriter) {
        self.write_to(w);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, WireError> {
        Chunk::read_from(r)
    }
}

macro_rules! messages {
    ($($variant:ident($ty:ty),)+) => {
        /// One decoded message of any kind.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $($variant($ty),)+
        }

        impl Message {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(Message::$variant(_) => MessageKind::$variant,)+
                }
            }

            pub fn encode(&self) -> Vec<u8> {
                match self {
                    $(Message::$variant(p) => p.to_bytes(),)+
                }
            }

            /// Decode a payload for a known kind.
            pub fn decode_kind(kind: MessageKind, payload: &[u8]) -> Result<Self, WireError> {
                match kind {
                    $(MessageKind::$variant => Ok(Message::$variant(<$ty>::from_bytes(payload)?)),)+
                }
            }
        }
    };
}

messages! {
    HelloC2s(Hello),
    HelloS2c(HelloAck),
    Ping(Ping),
    Pong(Ping),
    Error(ErrorPayload),
    DeviceConnect(TargetRef),
    DeviceConnected(DeviceConnected),
    DeviceDisconnect(TargetRef),
    DeviceDisconnected(DeviceDisconnected),
    DeviceEvent(DeviceEvent),
    TmuxSelect(TmuxSelect),
    TmuxEvent(TmuxEventPayload),
    StateSnapshot(StateSnapshot),
    TermInput(TermInput),
    TermPaste(TermPaste),
    TermResize(TermResize),
    TermSyncSize(TermSyncSize),
    TermOutput(TermOutput),
    TermHistory(TermHistory),
    SwitchAck(SwitchAck),
    LiveResume(LiveResume),
    Chunk(Chunk),
}

impl Message {
    /// Decode a payload from the raw kind carried in an envelope.
    pub fn decode(kind: u16, payload: &[u8]) -> Result<Self, WireError> {
        Self::decode_kind(MessageKind::from_u16(kind)?, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(b: u8) -> SelectToken {
        SelectToken([b; 16])
    }

    fn roundtrip(msg: Message) {
        let bytes = msg.encode();
        let back = Message::decode(msg.kind().as_u16(), &bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn term_input_roundtrip() {
        roundtrip(Message::TermInput(TermInput {
            target_id: "t1".into(),
            pane_id: "%3".into(),
            encoding: DataEncoding::Binary,
            data: vec![0, 1, 0x1b, 0xff],
            is_composing: true,
        }));
    }

    #[test]
    fn tmux_select_roundtrip_with_and_without_optionals() {
        roundtrip(Message::TmuxSelect(TmuxSelect {
            target_id: "t1".into(),
            window_id: Some("@1".into()),
            pane_id: Some("%2".into()),
            select_token: token(7),
            want_history: true,
            cols: Some(120),
            rows: Some(40),
        }));
        roundtrip(Message::TmuxSelect(TmuxSelect {
            target_id: "t1".into(),
            window_id: None,
            pane_id: None,
            select_token: token(1),
            want_history: false,
            cols: None,
            rows: None,
        }));
    }

    #[test]
    fn barrier_messages_roundtrip() {
        roundtrip(Message::SwitchAck(SwitchAck {
            target_id: "t".into(),
            window_id: "@1".into(),
            pane_id: "%1".into(),
            select_token: token(2),
        }));
        roundtrip(Message::TermHistory(TermHistory {
            target_id: "t".into(),
            pane_id: "%1".into(),
            select_token: token(2),
            encoding: DataEncoding::Utf8,
            data: b"line\nline2".to_vec(),
        }));
        roundtrip(Message::LiveResume(LiveResume {
            target_id: "t".into(),
            pane_id: "%1".into(),
            select_token: token(2),
        }));
    }

    #[test]
    fn snapshot_roundtrip() {
        roundtrip(Message::StateSnapshot(StateSnapshot {
            target_id: "t".into(),
            session: SnapshotSession {
                id: "$0".into(),
                name: "main".into(),
            },
            windows: vec![SnapshotWindow {
                id: "@1".into(),
                name: "zsh".into(),
                index: 0,
                active: true,
            }],
            panes: vec![
                SnapshotPane {
                    id: "%1".into(),
                    window_id: "@1".into(),
                    index: 0,
                    title: Some("host".into()),
                    active: true,
                    width: 80,
                    height: 24,
                },
                SnapshotPane {
                    id: "%2".into(),
                    window_id: "@1".into(),
                    index: 1,
                    title: None,
                    active: false,
                    width: 80,
                    height: 24,
                },
            ],
        }));
    }

    #[test]
    fn tmux_event_variants_roundtrip() {
        for event in [
            TmuxEvent::WindowAdded {
                window_id: "@4".into(),
            },
            TmuxEvent::WindowRenamed {
                window_id: "@4".into(),
                name: "logs".into(),
            },
            TmuxEvent::Bell {
                pane_id: Some("%9".into()),
                window_id: None,
            },
            TmuxEvent::LayoutChanged {
                window_id: "@4".into(),
                layout: "b25d,80x24,0,0,1".into(),
            },
        ] {
            roundtrip(Message::TmuxEvent(TmuxEventPayload {
                target_id: "t".into(),
                event,
            }));
        }
    }

    #[test]
    fn control_messages_roundtrip() {
        roundtrip(Message::HelloC2s(Hello {
            version: 1,
            client_name: "web".into(),
            max_frame_bytes: 65536,
        }));
        roundtrip(Message::Ping(Ping { nonce: u64::MAX }));
        roundtrip(Message::Error(
            ErrorPayload::new(ErrorCode::TargetNotFound, false, "no such target")
                .for_target("t9")
                .in_reply_to(12),
        ));
        roundtrip(Message::DeviceEvent(DeviceEvent {
            target_id: "t".into(),
            event: DeviceEventKind::Error,
            code: Some("auth_failed".into()),
            message: "Permission denied".into(),
        }));
    }

    #[test]
    fn unknown_kind_fails_decode() {
        assert_eq!(
            Message::decode(0x0666, &[]).unwrap_err(),
            WireError::UnknownKind(0x0666)
        );
    }

    #[test]
    fn trailing_bytes_fail_decode() {
        let mut bytes = Ping { nonce: 1 }.to_bytes();
        bytes.push(0);
        assert!(matches!(
            Message::decode(MessageKind::Ping.as_u16(), &bytes),
            Err(WireError::PayloadDecode(_))
        ));
    }

    #[test]
    fn truncated_payload_fails_decode() {
        let bytes = TargetRef {
            target_id: "abcdef".into(),
        }
        .to_bytes();
        assert!(Message::decode(MessageKind::DeviceConnect.as_u16(), &bytes[..6]).is_err());
    }

    #[test]
    fn huge_declared_counts_do_not_allocate() {
        let mut w = ByteWriter::new();
        w.put_str("t");
        w.put_str("$0");
        w.put_str("s");
        w.put_u32(u32::MAX);
        let err = StateSnapshot::from_bytes(&w.into_inner()).unwrap_err();
        assert!(matches!(err, WireError::PayloadDecode(_)));
    }

    #[test]
    fn select_token_displays_hex() {
        assert_eq!(token(0xab).to_string(), "ab".repeat(16));
    }

    #[test]
    fn data_encoding_detection() {
        assert_eq!(DataEncoding::for_bytes(b"plain"), DataEncoding::Utf8);
        assert_eq!(DataEncoding::for_bytes(&[0xff, 0xfe]), DataEncoding::Binary);
    }
}
