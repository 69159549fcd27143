//! Mapping session-link events onto wire messages.

use tokio::sync::mpsc;

use tmux_link::{ControlEvent, SessionSnapshot};
use tmux_wire::{
    DataEncoding, Message, SnapshotPane, SnapshotSession, SnapshotWindow, StateSnapshot,
    TermOutput, TmuxEvent, TmuxEventPayload,
};

/// Queue feeding one socket's writer task.
pub type Outbound = mpsc::Sender<Message>;

/// Outbound queue depth per socket.
pub const OUTBOUND_CAPACITY: usize = 256;

pub fn term_output(target_id: &str, pane_id: String, data: Vec<u8>) -> Message {
    Message::TermOutput(TermOutput {
        target_id: target_id.to_string(),
        pane_id,
        encoding: DataEncoding::for_bytes(&data),
        data,
    })
}

/// Structural notifications become TMUX_EVENT; anything else has no
/// TMUX_EVENT form.
pub fn tmux_event(target_id: &str, event: ControlEvent) -> Option<Message> {
    let event = match event {
        ControlEvent::WindowAdd { window_id } => TmuxEvent::WindowAdded { window_id },
        ControlEvent::WindowClose { window_id } => TmuxEvent::WindowClosed { window_id },
        ControlEvent::WindowRenamed { window_id, name } => {
            TmuxEvent::WindowRenamed { window_id, name }
        }
        ControlEvent::PaneClosed { pane_id } => TmuxEvent::PaneClosed { pane_id },
        ControlEvent::SessionChanged { session_id, name } => {
            TmuxEvent::SessionChanged { session_id, name }
        }
        ControlEvent::LayoutChange { window_id, layout } => {
            TmuxEvent::LayoutChanged { window_id, layout }
        }
        ControlEvent::WindowPaneChanged { window_id, pane_id } => {
            TmuxEvent::WindowPaneChanged { window_id, pane_id }
        }
        ControlEvent::Bell { pane_id, window_id } => TmuxEvent::Bell { pane_id, window_id },
        ControlEvent::Output { .. }
        | ControlEvent::Exit { .. }
        | ControlEvent::Block(_)
        | ControlEvent::Unknown { .. } => return None,
    };
    Some(Message::TmuxEvent(TmuxEventPayload {
        target_id: target_id.to_string(),
        event,
    }))
}

pub fn state_snapshot(target_id: &str, snapshot: &SessionSnapshot) -> Message {
    Message::StateSnapshot(StateSnapshot {
        target_id: target_id.to_string(),
        session: SnapshotSession {
            id: snapshot.session.id.clone(),
            name: snapshot.session.name.clone(),
        },
        windows: snapshot
            .windows
            .iter()
            .map(|w| SnapshotWindow {
                id: w.id.clone(),
                name: w.name.clone(),
                index: w.index,
                active: w.active,
            })
            .collect(),
        panes: snapshot
            .panes
            .iter()
            .map(|p| SnapshotPane {
                id: p.id.clone(),
                window_id: p.window_id.clone(),
                index: p.index,
                title: p.title.clone(),
                active: p.active,
                width: p.width,
                height: p.height,
            })
            .collect(),
    })
}
