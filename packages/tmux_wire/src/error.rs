//! Error types and the numeric codes carried by ERROR frames.

/// Numeric code carried in an ERROR frame.
///
/// Protocol-level codes live below 100; device and target codes are grouped
/// by hundreds so clients can branch on ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    UnsupportedProtocol = 1,
    InvalidFrame = 2,
    UnknownKind = 3,
    PayloadDecodeFailed = 4,
    FrameTooLarge = 5,
    ChunkRejected = 6,
    DeviceConnectFailed = 100,
    TargetNotFound = 200,
    TargetNotReady = 201,
    CommandFailed = 202,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::UnsupportedProtocol,
            2 => Self::InvalidFrame,
            3 => Self::UnknownKind,
            4 => Self::PayloadDecodeFailed,
            5 => Self::FrameTooLarge,
            6 => Self::ChunkRejected,
            100 => Self::DeviceConnectFailed,
            200 => Self::TargetNotFound,
            201 => Self::TargetNotReady,
            202 => Self::CommandFailed,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            Self::InvalidFrame => "INVALID_FRAME",
            Self::UnknownKind => "UNKNOWN_KIND",
            Self::PayloadDecodeFailed => "PAYLOAD_DECODE_FAILED",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
            Self::ChunkRejected => "CHUNK_REJECTED",
            Self::DeviceConnectFailed => "DEVICE_CONNECT_FAILED",
            Self::TargetNotFound => "TARGET_NOT_FOUND",
            Self::TargetNotReady => "TARGET_NOT_READY",
            Self::CommandFailed => "COMMAND_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while framing, chunking or decoding messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u16),

    #[error("unknown message kind 0x{0:04x}")]
    UnknownKind(u16),

    #[error("payload decode failed: {0}")]
    PayloadDecode(String),

    #[error("frame too large: {0}")]
    FrameTooLarge(String),

    #[error("chunk rejected: {0}")]
    ChunkRejected(String),
}

impl WireError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidFrame(_) => ErrorCode::InvalidFrame,
            Self::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            Self::UnknownKind(_) => ErrorCode::UnknownKind,
            Self::PayloadDecode(_) => ErrorCode::PayloadDecodeFailed,
            Self::FrameTooLarge(_) => ErrorCode::FrameTooLarge,
            Self::ChunkRejected(_) => ErrorCode::ChunkRejected,
        }
    }

    /// Protocol errors describe a malformed message; resending the same
    /// bytes cannot succeed.
    pub fn retryable(&self) -> bool {
        false
    }
}
