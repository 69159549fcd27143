//! Line-oriented parser for tmux control mode.
//!
//! Bytes are appended as they arrive from the child process; complete lines
//! are turned into [`ControlEvent`]s. Command replies arrive wrapped in
//! `%begin`/`%end` (or `%error`) guards and are surfaced as a single
//! [`Block`], never as spontaneous notifications.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::octal::decode_octal;

/// A guarded command reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub time: u64,
    pub number: u64,
    /// Non-zero when the command was issued by this client.
    pub flags: u32,
    /// `false` when the block closed with `%error`.
    pub success: bool,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Output { pane_id: String, data: Vec<u8> },
    WindowAdd { window_id: String },
    WindowClose { window_id: String },
    WindowRenamed { window_id: String, name: String },
    PaneClosed { pane_id: String },
    SessionChanged { session_id: String, name: String },
    LayoutChange { window_id: String, layout: String },
    WindowPaneChanged { window_id: String, pane_id: String },
    Bell {
        pane_id: Option<String>,
        window_id: Option<String>,
    },
    /// The control client is going away.
    Exit { reason: Option<String> },
    Block(Block),
    Unknown { line: String },
}

impl ControlEvent {
    /// Whether this notification changes the session/window/pane tree.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ControlEvent::WindowAdd { .. }
                | ControlEvent::WindowClose { .. }
                | ControlEvent::WindowRenamed { .. }
                | ControlEvent::PaneClosed { .. }
                | ControlEvent::SessionChanged { .. }
                | ControlEvent::LayoutChange { .. }
                | ControlEvent::WindowPaneChanged { .. }
        )
    }
}

struct OpenBlock {
    time: u64,
    number: u64,
    flags: u32,
    lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum EscState {
    #[default]
    Ground,
    Esc,
    Osc,
    OscEsc,
}

/// Incremental control-mode parser.
#[derive(Default)]
pub struct ControlParser {
    buf: Vec<u8>,
    block: Option<OpenBlock>,
    /// Per-pane escape state, so an OSC split across two `%output` lines
    /// still swallows its BEL terminator.
    esc: HashMap<String, EscState>,
}

impl ControlParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every event completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ControlEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.parse_line(&line, &mut events);
        }
        events
    }

    /// Drop any unterminated partial line.
    pub fn flush(&mut self) {
        if !self.buf.is_empty() {
            trace!(bytes = self.buf.len(), "discarding partial control line");
        }
        self.buf.clear();
    }

    /// Forget escape state for a pane that no longer exists.
    pub fn forget_pane(&mut self, pane_id: &str) {
        self.esc.remove(pane_id);
    }

    fn parse_line(&mut self, raw: &[u8], events: &mut Vec<ControlEvent>) {
        // Output data is raw bytes; a multi-byte character may be split
        // across two lines, so it never goes through a string.
        if self.block.is_none() && self.parse_output(raw, events) {
            return;
        }

        let line = String::from_utf8_lossy(raw);

        if let Some(block) = self.block.as_mut() {
            if let Some((success, rest)) = guard_end(&line) {
                if guard_matches(rest, block.time, block.number) {
                    if let Some(open) = self.block.take() {
                        events.push(ControlEvent::Block(Block {
                            time: open.time,
                            number: open.number,
                            flags: open.flags,
                            success,
                            lines: open.lines,
                        }));
                    }
                    return;
                }
            }
            block.lines.push(line.to_string());
            return;
        }

        if !line.starts_with('%') {
            debug!(line = %line, "plain text from control client");
            return;
        }

        let (name, rest) = match line.split_once(' ') {
            Some((n, r)) => (n, r),
            None => (line.as_ref(), ""),
        };

        match name {
            "%begin" => {
                let mut fields = rest.split(' ');
                let time = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let number = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                let flags = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                self.block = Some(OpenBlock {
                    time,
                    number,
                    flags,
                    lines: Vec::new(),
                });
            }
            "%end" | "%error" => {
                trace!(line = %line, "block guard without %begin");
            }
            "%window-add" => events.push(ControlEvent::WindowAdd {
                window_id: first_field(rest),
            }),
            "%window-close" | "%unlinked-window-close" => events.push(ControlEvent::WindowClose {
                window_id: first_field(rest),
            }),
            "%window-renamed" => {
                let (window_id, name) = split_first(rest);
                events.push(ControlEvent::WindowRenamed { window_id, name });
            }
            "%pane-exited" | "%pane-closed" => {
                let pane_id = first_field(rest);
                self.forget_pane(&pane_id);
                events.push(ControlEvent::PaneClosed { pane_id });
            }
            "%session-changed" => {
                let (session_id, name) = split_first(rest);
                events.push(ControlEvent::SessionChanged { session_id, name });
            }
            "%layout-change" => {
                let mut fields = rest.split(' ');
                let window_id = fields.next().unwrap_or_default().to_string();
                let layout = fields.next().unwrap_or_default().to_string();
                events.push(ControlEvent::LayoutChange { window_id, layout });
            }
            "%window-pane-changed" => {
                let (window_id, pane_id) = split_first(rest);
                events.push(ControlEvent::WindowPaneChanged { window_id, pane_id });
            }
            "%bell" => {
                let mut pane_id = None;
                let mut window_id = None;
                for field in rest.split(' ') {
                    if field.starts_with('%') {
                        pane_id = Some(field.to_string());
                    } else if field.starts_with('@') {
                        window_id = Some(field.to_string());
                    }
                }
                events.push(ControlEvent::Bell { pane_id, window_id });
            }
            "%exit" => {
                let reason = (!rest.is_empty()).then(|| rest.to_string());
                events.push(ControlEvent::Exit { reason });
            }
            _ => {
                debug!(line = %line, "unhandled control notification");
                events.push(ControlEvent::Unknown {
                    line: line.to_string(),
                });
            }
        }
    }

    /// Handle `%output` and `%extended-output` on the undecoded line.
    fn parse_output(&mut self, raw: &[u8], events: &mut Vec<ControlEvent>) -> bool {
        if let Some(rest) = raw.strip_prefix(b"%output ") {
            let (pane, data) = split_field(rest);
            if !pane.is_empty() {
                self.push_output(&String::from_utf8_lossy(pane), decode_octal(data), events);
            }
            return true;
        }
        if let Some(rest) = raw.strip_prefix(b"%extended-output ") {
            // %extended-output %<pane> <age> ... : <data>
            let (pane, _) = split_field(rest);
            let data = rest
                .windows(3)
                .position(|w| w == b" : ")
                .map_or(&[][..], |pos| &rest[pos + 3..]);
            self.push_output(&String::from_utf8_lossy(pane), decode_octal(data), events);
            return true;
        }
        false
    }

    fn push_output(&mut self, pane: &str, data: Vec<u8>, events: &mut Vec<ControlEvent>) {
        let state = self.esc.entry(pane.to_string()).or_default();
        let rang = scan_for_bell(state, &data);
        events.push(ControlEvent::Output {
            pane_id: pane.to_string(),
            data,
        });
        if rang {
            events.push(ControlEvent::Bell {
                pane_id: Some(pane.to_string()),
                window_id: None,
            });
        }
    }
}

/// Walk `data` updating the escape state; true when a BEL outside an OSC
/// string was seen.
fn scan_for_bell(state: &mut EscState, data: &[u8]) -> bool {
    let mut rang = false;
    for &b in data {
        *state = match (*state, b) {
            (EscState::Ground, 0x07) => {
                rang = true;
                EscState::Ground
            }
            (EscState::Ground, 0x1b) => EscState::Esc,
            (EscState::Ground, _) => EscState::Ground,
            (EscState::Esc, b']') => EscState::Osc,
            (EscState::Esc, 0x1b) => EscState::Esc,
            (EscState::Esc, _) => EscState::Ground,
            // BEL terminates the OSC string
            (EscState::Osc, 0x07) => EscState::Ground,
            (EscState::Osc, 0x1b) => EscState::OscEsc,
            (EscState::Osc, _) => EscState::Osc,
            // ESC \ (ST)
            (EscState::OscEsc, b'\\') => EscState::Ground,
            (EscState::OscEsc, 0x1b) => EscState::OscEsc,
            (EscState::OscEsc, _) => EscState::Osc,
        };
    }
    rang
}

/// Split off the first space-separated field of a raw line.
fn split_field(rest: &[u8]) -> (&[u8], &[u8]) {
    match rest.iter().position(|&b| b == b' ') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, &[]),
    }
}

fn guard_end(line: &str) -> Option<(bool, &str)> {
    if let Some(rest) = line.strip_prefix("%end ") {
        Some((true, rest))
    } else {
        line.strip_prefix("%error ").map(|rest| (false, rest))
    }
}

fn guard_matches(rest: &str, time: u64, number: u64) -> bool {
    let mut fields = rest.split(' ');
    let t = fields.next().and_then(|s| s.parse::<u64>().ok());
    let n = fields.next().and_then(|s| s.parse::<u64>().ok());
    t == Some(time) && n == Some(number)
}

fn first_field(rest: &str) -> String {
    rest.split(' ').next().unwrap_or_default().to_string()
}

fn split_first(rest: &str) -> (String, String) {
    match rest.split_once(' ') {
        Some((a, b)) => (a.to_string(), b.to_string()),
        None => (rest.to_string(), String::new()),
    }
}
