//! Switch barrier: ordering a focus change against live output.
//!
//! A TMUX_SELECT opens a transaction tagged with the client's select token.
//! Until LIVE_RESUME goes out, every per-target frame from the link is held
//! back in arrival order; the client therefore sees SWITCH_ACK, then the
//! pane history, then LIVE_RESUME, then whatever happened meanwhile. A newer
//! select replaces the transaction outright: its pending frames are
//! discarded and nothing more is sent under the old token.

use tokio::sync::Mutex;
use tracing::{debug, warn};

use tmux_link::SessionControl;
use tmux_wire::{DataEncoding, LiveResume, Message, SelectToken, SwitchAck, TermHistory, TmuxSelect};

use super::protocol::Outbound;
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPhase {
    Idle,
    Selecting,
    Acked,
    HistorySent,
    Resumed,
    Cancelled,
}

impl SelectPhase {
    fn holds_output(self) -> bool {
        matches!(
            self,
            SelectPhase::Selecting | SelectPhase::Acked | SelectPhase::HistorySent
        )
    }
}

#[derive(Debug, Clone)]
struct Transaction {
    token: SelectToken,
    phase: SelectPhase,
    window_id: Option<String>,
    pane_id: Option<String>,
}

#[derive(Default)]
struct BarrierState {
    current: Option<Transaction>,
    held: Vec<Message>,
}

/// Per (socket, target) barrier.
pub struct SwitchBarrier {
    target_id: String,
    out: Outbound,
    state: Mutex<BarrierState>,
}

impl SwitchBarrier {
    pub fn new(target_id: impl Into<String>, out: Outbound) -> Self {
        Self {
            target_id: target_id.into(),
            out,
            state: Mutex::new(BarrierState::default()),
        }
    }

    #[cfg(test)]
    pub async fn phase(&self) -> SelectPhase {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .map_or(SelectPhase::Idle, |t| t.phase)
    }

    /// Pass a live frame through, or hold it while a switch is in flight.
    pub async fn forward(&self, msg: Message) {
        let mut state = self.state.lock().await;
        if state.current.as_ref().is_some_and(|t| t.phase.holds_output()) {
            state.held.push(msg);
            return;
        }
        // The lock stays held so a concurrent flush cannot overtake us.
        let _ = self.out.send(msg).await;
    }

    /// Open a transaction for `select`, cancelling any unfinished one.
    ///
    /// Callers that run [`complete`](Self::complete) on another task must
    /// call this first, in arrival order.
    pub async fn begin(&self, select: &TmuxSelect) {
        let mut state = self.state.lock().await;
        let dropped = state.held.len();
        if let Some(prev) = state.current.as_mut() {
            if prev.phase.holds_output() {
                debug!(
                    target = %self.target_id,
                    old = %prev.token,
                    new = %select.select_token,
                    dropped,
                    "select superseded"
                );
                prev.phase = SelectPhase::Cancelled;
            }
        }
        state.held.clear();
        state.current = Some(Transaction {
            token: select.select_token,
            phase: SelectPhase::Selecting,
            window_id: select.window_id.clone(),
            pane_id: select.pane_id.clone(),
        });
    }

    /// Send `msg` and move to `next` only if `token` is still current and in
    /// `from`.
    async fn advance(
        &self,
        token: SelectToken,
        from: &[SelectPhase],
        next: SelectPhase,
        msg: Message,
    ) -> bool {
        let mut state = self.state.lock().await;
        let Some(current) = state.current.as_mut() else {
            return false;
        };
        if current.token != token || !from.contains(&current.phase) {
            debug!(target = %self.target_id, token = %token, "stale select step suppressed");
            return false;
        }
        current.phase = next;
        let _ = self.out.send(msg).await;
        true
    }

    async fn ack(&self, token: SelectToken, window_id: &str, pane_id: &str) -> bool {
        {
            let mut state = self.state.lock().await;
            if let Some(t) = state.current.as_mut().filter(|t| t.token == token) {
                t.window_id = Some(window_id.to_string());
                t.pane_id = Some(pane_id.to_string());
            }
        }
        self.advance(
            token,
            &[SelectPhase::Selecting],
            SelectPhase::Acked,
            Message::SwitchAck(SwitchAck {
                target_id: self.target_id.clone(),
                window_id: window_id.to_string(),
                pane_id: pane_id.to_string(),
                select_token: token,
            }),
        )
        .await
    }

    async fn history(&self, token: SelectToken, pane_id: &str, data: Vec<u8>) -> bool {
        self.advance(
            token,
            &[SelectPhase::Acked],
            SelectPhase::HistorySent,
            Message::TermHistory(TermHistory {
                target_id: self.target_id.clone(),
                pane_id: pane_id.to_string(),
                select_token: token,
                encoding: DataEncoding::for_bytes(&data),
                data,
            }),
        )
        .await
    }

    /// Emit LIVE_RESUME and release everything held since the select.
    async fn resume(&self, token: SelectToken, pane_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(current) = state.current.as_mut() else {
            return false;
        };
        if current.token != token
            || !matches!(current.phase, SelectPhase::Acked | SelectPhase::HistorySent)
        {
            debug!(target = %self.target_id, token = %token, "stale resume suppressed");
            return false;
        }
        current.phase = SelectPhase::Resumed;
        let _ = self
            .out
            .send(Message::LiveResume(LiveResume {
                target_id: self.target_id.clone(),
                pane_id: pane_id.to_string(),
                select_token: token,
            }))
            .await;
        for msg in std::mem::take(&mut state.held) {
            let _ = self.out.send(msg).await;
        }
        true
    }

    /// Give up on `token` before it was acked; held frames go out as-is.
    async fn abort(&self, token: SelectToken) {
        let mut state = self.state.lock().await;
        if state.current.as_ref().is_none_or(|t| t.token != token) {
            return;
        }
        state.current = None;
        for msg in std::mem::take(&mut state.held) {
            let _ = self.out.send(msg).await;
        }
    }

    async fn is_current(&self, token: SelectToken) -> bool {
        self.state
            .lock()
            .await
            .current
            .as_ref()
            .is_some_and(|t| t.token == token && t.phase.holds_output())
    }

    #[cfg(test)]
    pub async fn select(
        &self,
        control: &dyn SessionControl,
        select: TmuxSelect,
    ) -> Result<(), RelayError> {
        self.begin(&select).await;
        self.complete(control, select).await
    }

    /// Drive the transaction opened by [`begin`](Self::begin) to the end.
    ///
    /// Stale transactions end silently; only a failure to resolve the pane
    /// is reported back.
    pub async fn complete(
        &self,
        control: &dyn SessionControl,
        select: TmuxSelect,
    ) -> Result<(), RelayError> {
        let token = select.select_token;

        let (window_id, pane_id) = match resolve_focus(control, &select).await {
            Ok(focus) => focus,
            Err(e) => {
                self.abort(token).await;
                return Err(e);
            }
        };

        if !self.ack(token, &window_id, &pane_id).await {
            return Ok(());
        }

        if let Err(e) = control.select_pane(&window_id, &pane_id).await {
            warn!(target = %self.target_id, pane = %pane_id, error = %e, "select-pane failed");
        }
        if let (Some(cols), Some(rows)) = (select.cols, select.rows) {
            if let Err(e) = control.resize_pane(&pane_id, cols, rows).await {
                warn!(target = %self.target_id, pane = %pane_id, error = %e, "resize-pane failed");
            }
        }

        if select.want_history && self.is_current(token).await {
            match control.capture_pane_history(&pane_id).await {
                Ok(data) => {
                    if !self.history(token, &pane_id, data).await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(target = %self.target_id, pane = %pane_id, error = %e, "history capture failed");
                }
            }
        }

        self.resume(token, &pane_id).await;
        Ok(())
    }

    /// Pane the client is currently focused on, once a switch has been acked.
    #[cfg(test)]
    pub async fn focused_pane(&self) -> Option<String> {
        let state = self.state.lock().await;
        state
            .current
            .as_ref()
            .filter(|t| t.phase != SelectPhase::Selecting)
            .and_then(|t| t.pane_id.clone())
    }
}

/// Fill in whichever of window and pane the client left out.
async fn resolve_focus(
    control: &dyn SessionControl,
    select: &TmuxSelect,
) -> Result<(String, String), RelayError> {
    if let (Some(w), Some(p)) = (&select.window_id, &select.pane_id) {
        return Ok((w.clone(), p.clone()));
    }

    let snapshot = control.request_snapshot().await?;
    let found = match (&select.window_id, &select.pane_id) {
        (None, Some(pane_id)) => snapshot.pane(pane_id),
        (Some(window_id), None) => snapshot.active_pane_in(window_id),
        _ => snapshot
            .active_window()
            .and_then(|w| snapshot.active_pane_in(&w.id)),
    };
    found
        .map(|p| (p.window_id.clone(), p.id.clone()))
        .ok_or_else(|| RelayError::not_ready(control.target_id(), "no pane to focus"))
}
