use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, oneshot};

use tmux_link::{
    CloseReason, LinkError, LinkEvent, PaneInfo, SessionControl, SessionInfo, SessionSnapshot,
    WindowInfo,
};

use crate::connector::{Connector, LinkPair};
use crate::error::RelayError;

/// Session `$0 main` with windows `@1` (active: `%1` active, `%2`) and
/// `@2` (`%3`).
pub fn sample_snapshot() -> SessionSnapshot {
    let pane = |id: &str, window_id: &str, index: u32, active: bool| PaneInfo {
        id: id.into(),
        window_id: window_id.into(),
        index,
        title: None,
        active,
        width: 80,
        height: 24,
    };
    SessionSnapshot {
        session: SessionInfo {
            id: "$0".into(),
            name: "main".into(),
        },
        windows: vec![
            WindowInfo {
                id: "@1".into(),
                name: "shell".into(),
                index: 0,
                active: true,
            },
            WindowInfo {
                id: "@2".into(),
                name: "logs".into(),
                index: 1,
                active: false,
            },
        ],
        panes: vec![
            pane("%1", "@1", 0, true),
            pane("%2", "@1", 1, false),
            pane("%3", "@2", 0, true),
        ],
    }
}

/// In-memory stand-in for a session link.
pub struct FakeSession {
    target_id: String,
    calls: Mutex<Vec<String>>,
    snapshot: Mutex<SessionSnapshot>,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    disconnected: AtomicBool,
    /// When set, the next history capture waits for this to fire.
    history_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub history_requested: Notify,
}

impl FakeSession {
    pub fn new(target_id: &str) -> (Arc<Self>, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let session = Arc::new(Self {
            target_id: target_id.to_string(),
            calls: Mutex::new(Vec::new()),
            snapshot: Mutex::new(sample_snapshot()),
            events: Mutex::new(Some(tx)),
            disconnected: AtomicBool::new(false),
            history_gate: Mutex::new(None),
            history_requested: Notify::new(),
        });
        (session, rx)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn set_snapshot(&self, snapshot: SessionSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    /// Make the next history capture block until the returned sender fires.
    pub fn hold_history(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.history_gate.lock().unwrap() = Some(rx);
        tx
    }

    fn sender(&self) -> Option<mpsc::Sender<LinkEvent>> {
        self.events.lock().unwrap().clone()
    }

    pub async fn emit(&self, event: LinkEvent) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(event).await;
        }
    }

    /// Emit `Closed` and end the event stream.
    pub async fn close(&self, reason: CloseReason) {
        let tx = self.events.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(LinkEvent::Closed { reason }).await;
        }
    }
}

#[async_trait]
impl SessionControl for FakeSession {
    fn target_id(&self) -> &str {
        &self.target_id
    }

    fn session_name(&self) -> &str {
        "main"
    }

    async fn send_input(&self, pane_id: &str, data: &[u8]) -> Result<(), LinkError> {
        self.record(format!("input {} {}", pane_id, String::from_utf8_lossy(data)));
        Ok(())
    }

    async fn send_key(&self, pane_id: &str, key: &str) -> Result<(), LinkError> {
        self.record(format!("key {} {}", pane_id, key));
        Ok(())
    }

    async fn paste(&self, pane_id: &str, data: &[u8]) -> Result<(), LinkError> {
        self.record(format!("paste {} {}", pane_id, String::from_utf8_lossy(data)));
        Ok(())
    }

    async fn select_pane(&self, window_id: &str, pane_id: &str) -> Result<(), LinkError> {
        self.record(format!("select {} {}", window_id, pane_id));
        Ok(())
    }

    async fn resize_pane(&self, pane_id: &str, cols: u16, rows: u16) -> Result<(), LinkError> {
        self.record(format!("resize {} {}x{}", pane_id, cols, rows));
        Ok(())
    }

    async fn sync_client_size(&self, cols: u16, rows: u16) -> Result<(), LinkError> {
        self.record(format!("client-size {}x{}", cols, rows));
        Ok(())
    }

    async fn create_window(&self, name: Option<&str>) -> Result<String, LinkError> {
        self.record(format!("new-window {}", name.unwrap_or("-")));
        Ok("@9".into())
    }

    async fn close_window(&self, window_id: &str) -> Result<(), LinkError> {
        self.record(format!("kill-window {}", window_id));
        Ok(())
    }

    async fn close_pane(&self, pane_id: &str) -> Result<(), LinkError> {
        self.record(format!("kill-pane {}", pane_id));
        Ok(())
    }

    async fn rename_window(&self, window_id: &str, name: &str) -> Result<(), LinkError> {
        self.record(format!("rename {} {}", window_id, name));
        Ok(())
    }

    async fn request_snapshot(&self) -> Result<SessionSnapshot, LinkError> {
        self.record("snapshot".into());
        let snapshot = self.snapshot.lock().unwrap().clone();
        if let Some(tx) = self.sender() {
            let _ = tx.try_send(LinkEvent::Snapshot(snapshot.clone()));
        }
        Ok(snapshot)
    }

    async fn capture_pane_history(&self, pane_id: &str) -> Result<Vec<u8>, LinkError> {
        self.record(format!("history {}", pane_id));
        self.history_requested.notify_one();
        let gate = self.history_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(format!("history of {}", pane_id).into_bytes())
    }

    async fn disconnect(&self) {
        self.record("disconnect".into());
        self.disconnected.store(true, Ordering::SeqCst);
        self.close(CloseReason::Requested).await;
    }
}

/// Connector handing out [`FakeSession`]s.
#[derive(Default)]
pub struct FakeConnector {
    sessions: Mutex<HashMap<String, Vec<Arc<FakeSession>>>>,
    attempts: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    pub connected: Notify,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    /// Fail the next `times` connects to `target_id`.
    pub fn fail_next(&self, target_id: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(target_id.to_string(), times);
    }

    pub fn connect_count(&self, target_id: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(target_id)
            .copied()
            .unwrap_or(0)
    }

    /// The most recent session opened for `target_id`.
    pub fn session(&self, target_id: &str) -> Option<Arc<FakeSession>> {
        self.sessions
            .lock()
            .unwrap()
            .get(target_id)
            .and_then(|v| v.last().cloned())
    }

    pub fn sessions(&self, target_id: &str) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .unwrap()
            .get(target_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target_id: &str) -> Result<LinkPair, RelayError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(target_id.to_string())
            .or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(target_id) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(RelayError::Link(LinkError::connect(
                tmux_link::ConnectFailure::HostUnreachable,
                "no route to host",
            )));
        }

        let (session, events) = FakeSession::new(target_id);
        self.sessions
            .lock()
            .unwrap()
            .entry(target_id.to_string())
            .or_default()
            .push(session.clone());
        self.connected.notify_waiters();
        let control: Arc<dyn SessionControl> = session;
        Ok((control, events))
    }
}
