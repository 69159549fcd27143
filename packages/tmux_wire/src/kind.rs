//! Message kind identifiers carried in the envelope header.

use crate::error::WireError;

macro_rules! message_kinds {
    ($($variant:ident = $value:literal => $name:literal,)+) => {
        /// Every message kind the protocol knows about.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum MessageKind {
            $($variant = $value,)+
        }

        impl MessageKind {
            pub const ALL: &'static [MessageKind] = &[$(MessageKind::$variant,)+];

            pub fn as_u16(self) -> u16 {
                self as u16
            }

            pub fn from_u16(value: u16) -> Result<Self, WireError> {
                match value {
                    $($value => Ok(MessageKind::$variant),)+
                    other => Err(WireError::UnknownKind(other)),
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(MessageKind::$variant => $name,)+
                }
            }
        }
    };
}

message_kinds! {
    HelloC2s = 0x0001 => "HELLO_C2S",
    HelloS2c = 0x0002 => "HELLO_S2C",
    Ping = 0x0003 => "PING",
    Pong = 0x0004 => "PONG",
    Error = 0x0005 => "ERROR",
    DeviceConnect = 0x0101 => "DEVICE_CONNECT",
    DeviceConnected = 0x0102 => "DEVICE_CONNECTED",
    DeviceDisconnect = 0x0103 => "DEVICE_DISCONNECT",
    DeviceDisconnected = 0x0104 => "DEVICE_DISCONNECTED",
    DeviceEvent = 0x0105 => "DEVICE_EVENT",
    TmuxSelect = 0x0201 => "TMUX_SELECT",
    TmuxEvent = 0x0207 => "TMUX_EVENT",
    StateSnapshot = 0x0208 => "STATE_SNAPSHOT",
    TermInput = 0x0301 => "TERM_INPUT",
    TermPaste = 0x0302 => "TERM_PASTE",
    TermResize = 0x0303 => "TERM_RESIZE",
    TermSyncSize = 0x0304 => "TERM_SYNC_SIZE",
    TermOutput = 0x0305 => "TERM_OUTPUT",
    TermHistory = 0x0306 => "TERM_HISTORY",
    SwitchAck = 0x0401 => "SWITCH_ACK",
    LiveResume = 0x0402 => "LIVE_RESUME",
    Chunk = 0x0501 => "CHUNK",
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:04x})", self.name(), self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_wire_values() {
        assert_eq!(MessageKind::HelloC2s.as_u16(), 0x0001);
        assert_eq!(MessageKind::DeviceEvent.as_u16(), 0x0105);
        assert_eq!(MessageKind::TmuxEvent.as_u16(), 0x0207);
        assert_eq!(MessageKind::TermHistory.as_u16(), 0x0306);
        assert_eq!(MessageKind::LiveResume.as_u16(), 0x0402);
        assert_eq!(MessageKind::Chunk.as_u16(), 0x0501);
    }

    #[test]
    fn every_kind_parses_back() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_u16(kind.as_u16()).unwrap(), *kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(
            MessageKind::from_u16(0x0999),
            Err(WireError::UnknownKind(0x0999))
        );
    }

    #[test]
    fn display_includes_hex() {
        assert_eq!(MessageKind::SwitchAck.to_string(), "SWITCH_ACK(0x0401)");
    }
}
