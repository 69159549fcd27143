use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use tmux_control::{Block, ControlEvent, ControlParser};

use crate::commands;
use crate::error::{ConnectFailure, LinkError};
use crate::history::{join_capture, parse_alternate, select_history};
use crate::snapshot::{PANES_QUERY, SESSION_QUERY, SessionSnapshot, WINDOWS_QUERY};
use crate::transport::{self, PreparedCommand, Transport, TransportGuard};

const READY_MARKER: &str = "tmux-relay-ready";
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const STATUS_THROTTLE: Duration = Duration::from_secs(30);
const STDERR_TAIL_BYTES: usize = 4096;

/// Everything needed to open one session link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub target_id: String,
    pub transport: Transport,
    pub session_name: String,
    pub tmux_bin: String,
    pub ssh_bin: String,
    pub connect_timeout: Duration,
    pub history_timeout: Duration,
}

impl LinkConfig {
    pub fn new(target_id: impl Into<String>, transport: Transport, session_name: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            transport,
            session_name: session_name.into(),
            tmux_bin: "tmux".to_string(),
            ssh_bin: "ssh".to_string(),
            connect_timeout: Duration::from_secs(15),
            history_timeout: Duration::from_secs(3),
        }
    }
}

/// Runtime availability reported to the target registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub last_seen_at: DateTime<Utc>,
    pub available: bool,
    pub last_error: Option<String>,
}

impl LinkStatus {
    pub fn up() -> Self {
        Self {
            last_seen_at: Utc::now(),
            available: true,
            last_error: None,
        }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self {
            last_seen_at: Utc::now(),
            available: false,
            last_error: Some(error.into()),
        }
    }
}

/// Receives status side effects. Implementations must not block.
pub trait StatusSink: Send + Sync {
    fn report(&self, target_id: &str, status: LinkStatus);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called or every handle was dropped.
    Requested,
    /// tmux sent `%exit` before the stream ended.
    Exited(Option<String>),
    /// The stream ended or failed without `%exit`.
    Lost(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("disconnected"),
            CloseReason::Exited(Some(reason)) => write!(f, "exited: {}", reason),
            CloseReason::Exited(None) => f.write_str("exited"),
            CloseReason::Lost(msg) => write!(f, "connection lost: {}", msg),
        }
    }
}

/// Events emitted by a session link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Output {
        pane_id: String,
        data: Vec<u8>,
    },
    /// A structural tmux notification (window/pane/session/layout).
    Notification(ControlEvent),
    Bell {
        pane_id: Option<String>,
        window_id: Option<String>,
    },
    Snapshot(SessionSnapshot),
    Exit {
        reason: Option<String>,
    },
    /// Last event of every link.
    Closed {
        reason: CloseReason,
    },
}

/// Operations on a connected tmux session.
#[async_trait]
pub trait SessionControl: Send + Sync {
    fn target_id(&self) -> &str;
    fn session_name(&self) -> &str;

    async fn send_input(&self, pane_id: &str, data: &[u8]) -> Result<(), LinkError>;
    async fn send_key(&self, pane_id: &str, key: &str) -> Result<(), LinkError>;
    async fn paste(&self, pane_id: &str, data: &[u8]) -> Result<(), LinkError>;
    async fn select_pane(&self, window_id: &str, pane_id: &str) -> Result<(), LinkError>;
    async fn resize_pane(&self, pane_id: &str, cols: u16, rows: u16) -> Result<(), LinkError>;
    async fn sync_client_size(&self, cols: u16, rows: u16) -> Result<(), LinkError>;
    /// Returns the new window's id.
    async fn create_window(&self, name: Option<&str>) -> Result<String, LinkError>;
    async fn close_window(&self, window_id: &str) -> Result<(), LinkError>;
    async fn close_pane(&self, pane_id: &str) -> Result<(), LinkError>;
    async fn rename_window(&self, window_id: &str, name: &str) -> Result<(), LinkError>;
    async fn request_snapshot(&self) -> Result<SessionSnapshot, LinkError>;
    async fn capture_pane_history(&self, pane_id: &str) -> Result<Vec<u8>, LinkError>;
    async fn disconnect(&self);
}

enum LinkMessage {
    Commands {
        lines: Vec<String>,
        /// Drop reply blocks until one contains this text.
        marker: Option<&'static str>,
        respond_to: oneshot::Sender<Result<Vec<Block>, LinkError>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

struct Pending {
    expected: usize,
    marker: Option<&'static str>,
    blocks: Vec<Block>,
    respond_to: oneshot::Sender<Result<Vec<Block>, LinkError>>,
}

/// Handle to a running session link. Cheap to clone.
#[derive(Clone)]
pub struct LinkHandle {
    target_id: String,
    session_name: String,
    sender: mpsc::Sender<LinkMessage>,
    /// Weak so that the event stream ends when the actor does.
    events: mpsc::WeakSender<LinkEvent>,
    history_timeout: Duration,
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("target_id", &self.target_id)
            .field("session_name", &self.session_name)
            .finish()
    }
}

impl LinkHandle {
    async fn request(
        &self,
        lines: Vec<String>,
        marker: Option<&'static str>,
    ) -> Result<Vec<Block>, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LinkMessage::Commands {
                lines,
                marker,
                respond_to: tx,
            })
            .await
            .map_err(|_| LinkError::Closed)?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Run commands in order and return their reply blocks.
    pub async fn run(&self, lines: Vec<String>) -> Result<Vec<Block>, LinkError> {
        let blocks = self.request(lines, None).await?;
        if let Some(failed) = blocks.iter().find(|b| !b.success) {
            return Err(LinkError::CommandFailed(failed.lines.join("; ")));
        }
        Ok(blocks)
    }

    async fn run_one(&self, line: String) -> Result<Vec<String>, LinkError> {
        let mut blocks = self.run(vec![line]).await?;
        Ok(blocks.pop().map(|b| b.lines).unwrap_or_default())
    }

    async fn health_check(&self) -> Result<(), LinkError> {
        let line = format!("display-message -p {}", commands::quote(READY_MARKER));
        let blocks = self.request(vec![line], Some(READY_MARKER)).await?;
        match blocks.first() {
            Some(b) if b.success => Ok(()),
            Some(b) => Err(LinkError::CommandFailed(b.lines.join("; "))),
            None => Err(LinkError::Closed),
        }
    }
}

#[async_trait]
impl SessionControl for LinkHandle {
    fn target_id(&self) -> &str {
        &self.target_id
    }

    fn session_name(&self) -> &str {
        &self.session_name
    }

    async fn send_input(&self, pane_id: &str, data: &[u8]) -> Result<(), LinkError> {
        if data.is_empty() {
            return Ok(());
        }
        self.run(commands::send_hex(pane_id, data)?).await.map(|_| ())
    }

    async fn send_key(&self, pane_id: &str, key: &str) -> Result<(), LinkError> {
        self.run_one(commands::send_key(pane_id, key)?).await.map(|_| ())
    }

    async fn paste(&self, pane_id: &str, data: &[u8]) -> Result<(), LinkError> {
        if data.is_empty() {
            return Ok(());
        }
        self.run(commands::paste(pane_id, data)?).await.map(|_| ())
    }

    async fn select_pane(&self, window_id: &str, pane_id: &str) -> Result<(), LinkError> {
        self.run(commands::select_pane(window_id, pane_id)?)
            .await
            .map(|_| ())
    }

    async fn resize_pane(&self, pane_id: &str, cols: u16, rows: u16) -> Result<(), LinkError> {
        self.run_one(commands::resize_pane(pane_id, cols, rows)?)
            .await
            .map(|_| ())
    }

    async fn sync_client_size(&self, cols: u16, rows: u16) -> Result<(), LinkError> {
        self.run_one(commands::refresh_client_size(cols, rows)?)
            .await
            .map(|_| ())
    }

    async fn create_window(&self, name: Option<&str>) -> Result<String, LinkError> {
        let lines = self.run_one(commands::new_window(name)).await?;
        let id = lines.into_iter().next().unwrap_or_default();
        commands::window(id.trim())?;
        Ok(id.trim().to_string())
    }

    async fn close_window(&self, window_id: &str) -> Result<(), LinkError> {
        self.run_one(commands::kill_window(window_id)?)
            .await
            .map(|_| ())
    }

    async fn close_pane(&self, pane_id: &str) -> Result<(), LinkError> {
        self.run_one(commands::kill_pane(pane_id)?).await.map(|_| ())
    }

    async fn rename_window(&self, window_id: &str, name: &str) -> Result<(), LinkError> {
        self.run_one(commands::rename_window(window_id, name)?)
            .await
            .map(|_| ())
    }

    async fn request_snapshot(&self) -> Result<SessionSnapshot, LinkError> {
        let blocks = self
            .run(vec![
                SESSION_QUERY.to_string(),
                WINDOWS_QUERY.to_string(),
                PANES_QUERY.to_string(),
            ])
            .await?;
        let [session, windows, panes] = blocks.as_slice() else {
            return Err(LinkError::Parse(format!(
                "expected 3 snapshot replies, got {}",
                blocks.len()
            )));
        };
        let snapshot = SessionSnapshot::from_lines(&session.lines, &windows.lines, &panes.lines)?;
        // The caller may be the one draining the event channel.
        if let Some(events) = self.events.upgrade() {
            if events.try_send(LinkEvent::Snapshot(snapshot.clone())).is_err() {
                warn!(target = %self.target_id, "event channel full, snapshot event dropped");
            }
        }
        Ok(snapshot)
    }

    async fn capture_pane_history(&self, pane_id: &str) -> Result<Vec<u8>, LinkError> {
        let probe = commands::alternate_probe(pane_id)?;
        let alternate = commands::capture_alternate(pane_id)?;
        let scrollback = commands::capture_scrollback(pane_id)?;

        let deadline = Instant::now() + self.history_timeout;
        let (probe, alternate, scrollback) = tokio::join!(
            timeout_at(deadline, self.run_one(probe)),
            timeout_at(deadline, self.run_one(alternate)),
            timeout_at(deadline, self.run_one(scrollback)),
        );

        let mut first_error = None;
        let mut take = |r: Result<Result<Vec<String>, LinkError>, _>| match r {
            Ok(Ok(lines)) => Some(lines),
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
                None
            }
            Err(_) => {
                first_error.get_or_insert(LinkError::Timeout("history capture".into()));
                None
            }
        };
        let probe = take(probe);
        let alternate = take(alternate);
        let scrollback = take(scrollback);

        if probe.is_none() && alternate.is_none() && scrollback.is_none() {
            return Err(first_error.unwrap_or(LinkError::Closed));
        }
        Ok(select_history(
            probe.as_deref().and_then(parse_alternate),
            alternate.as_deref().map(join_capture),
            scrollback.as_deref().map(join_capture),
        ))
    }

    async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LinkMessage::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// The actor that owns the control client's stdin.
struct LinkActor<W> {
    target_id: String,
    writer: W,
    parser: ControlParser,
    pending: VecDeque<Pending>,
    receiver: mpsc::Receiver<LinkMessage>,
    events: mpsc::Sender<LinkEvent>,
    status: Option<Arc<dyn StatusSink>>,
    last_status: Option<Instant>,
    exit_reason: Option<Option<String>>,
    child: Option<Child>,
    _guard: TransportGuard,
}

impl<W: AsyncWrite + Unpin + Send> LinkActor<W> {
    async fn run<R: AsyncRead + Unpin + Send>(mut self, mut reader: R) {
        info!(target = %self.target_id, "session link actor started");
        let mut buf = vec![0u8; 16 * 1024];

        let reason = loop {
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(LinkMessage::Commands { lines, marker, respond_to }) => {
                        self.handle_commands(lines, marker, respond_to).await;
                    }
                    Some(LinkMessage::Shutdown { respond_to }) => {
                        self.detach().await;
                        self.finish(CloseReason::Requested).await;
                        let _ = respond_to.send(());
                        return;
                    }
                    None => {
                        self.detach().await;
                        break CloseReason::Requested;
                    }
                },
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        break match self.exit_reason.take() {
                            Some(reason) => CloseReason::Exited(reason),
                            None => CloseReason::Lost("control stream ended".to_string()),
                        };
                    }
                    Ok(n) => self.handle_output(&buf[..n]).await,
                    Err(e) => break CloseReason::Lost(e.to_string()),
                },
            }
        };

        self.finish(reason).await;
    }

    async fn handle_commands(
        &mut self,
        lines: Vec<String>,
        marker: Option<&'static str>,
        respond_to: oneshot::Sender<Result<Vec<Block>, LinkError>>,
    ) {
        if lines.is_empty() {
            let _ = respond_to.send(Ok(Vec::new()));
            return;
        }

        let mut payload = String::new();
        for line in &lines {
            debug!(target = %self.target_id, command = %line, "tmux command");
            payload.push_str(line);
            payload.push('\n');
        }
        if let Err(e) = self.write(payload.as_bytes()).await {
            let _ = respond_to.send(Err(e));
            return;
        }
        self.pending.push_back(Pending {
            expected: lines.len(),
            marker,
            blocks: Vec::with_capacity(lines.len()),
            respond_to,
        });
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn handle_output(&mut self, bytes: &[u8]) {
        self.touch_status();
        for event in self.parser.feed(bytes) {
            match event {
                ControlEvent::Block(block) => self.handle_block(block),
                ControlEvent::Output { pane_id, data } => {
                    self.emit(LinkEvent::Output { pane_id, data }).await;
                }
                ControlEvent::Bell { pane_id, window_id } => {
                    self.emit(LinkEvent::Bell { pane_id, window_id }).await;
                }
                ControlEvent::Exit { reason } => {
                    info!(target = %self.target_id, reason = ?reason, "tmux client exiting");
                    self.exit_reason = Some(reason.clone());
                    self.emit(LinkEvent::Exit { reason }).await;
                }
                ControlEvent::Unknown { .. } => {}
                other => self.emit(LinkEvent::Notification(other)).await,
            }
        }
    }

    fn handle_block(&mut self, block: Block) {
        if block.flags == 0 {
            return;
        }
        let Some(front) = self.pending.front_mut() else {
            debug!(target = %self.target_id, number = block.number, "reply with no pending command");
            return;
        };
        if let Some(marker) = front.marker {
            if !block.lines.iter().any(|l| l.contains(marker)) {
                debug!(target = %self.target_id, number = block.number, "skipping reply before ready marker");
                return;
            }
            front.marker = None;
        }
        front.blocks.push(block);
        if front.blocks.len() >= front.expected {
            if let Some(done) = self.pending.pop_front() {
                let _ = done.respond_to.send(Ok(done.blocks));
            }
        }
    }

    async fn emit(&mut self, event: LinkEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.events.send(event).await;
    }

    fn touch_status(&mut self) {
        let Some(sink) = &self.status else { return };
        let now = Instant::now();
        if self
            .last_status
            .is_some_and(|at| now.duration_since(at) < STATUS_THROTTLE)
        {
            return;
        }
        self.last_status = Some(now);
        sink.report(&self.target_id, LinkStatus::up());
    }

    async fn detach(&mut self) {
        // An empty line detaches a control client.
        if let Err(e) = self.write(b"\n").await {
            debug!(target = %self.target_id, error = %e, "detach write failed");
        }
    }

    async fn finish(&mut self, reason: CloseReason) {
        for pending in self.pending.drain(..) {
            let _ = pending.respond_to.send(Err(LinkError::Closed));
        }
        self.receiver.close();

        if let Some(mut child) = self.child.take() {
            if timeout(Duration::from_secs(2), child.wait()).await.is_err() {
                if let Err(e) = child.kill().await {
                    warn!(target = %self.target_id, error = %e, "failed to kill control client");
                }
            }
        }

        match &reason {
            CloseReason::Requested => info!(target = %self.target_id, "session link closed"),
            other => {
                warn!(target = %self.target_id, reason = %other, "session link closed");
                if let Some(sink) = &self.status {
                    sink.report(&self.target_id, LinkStatus::down(other.to_string()));
                }
            }
        }
        self.emit(LinkEvent::Closed { reason }).await;
    }
}

/// Pieces shared by [`connect`] and [`attach_io`].
struct Spawn {
    target_id: String,
    session_name: String,
    history_timeout: Duration,
    status: Option<Arc<dyn StatusSink>>,
    child: Option<Child>,
    guard: TransportGuard,
}

fn spawn_actor<R, W>(spawn: Spawn, reader: R, writer: W) -> (LinkHandle, mpsc::Receiver<LinkEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (msg_tx, msg_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let actor = LinkActor {
        target_id: spawn.target_id.clone(),
        writer,
        parser: ControlParser::new(),
        pending: VecDeque::new(),
        receiver: msg_rx,
        events: event_tx.clone(),
        status: spawn.status,
        last_status: None,
        exit_reason: None,
        child: spawn.child,
        _guard: spawn.guard,
    };
    tokio::spawn(actor.run(reader));

    let handle = LinkHandle {
        target_id: spawn.target_id,
        session_name: spawn.session_name,
        sender: msg_tx,
        events: event_tx.downgrade(),
        history_timeout: spawn.history_timeout,
    };
    (handle, event_rx)
}

/// Drive a link over arbitrary byte streams speaking tmux control mode.
///
/// Waits for the control client to answer a health check before returning.
pub async fn attach_io<R, W>(
    target_id: impl Into<String>,
    session_name: impl Into<String>,
    reader: R,
    writer: W,
    history_timeout: Duration,
    connect_timeout: Duration,
) -> Result<(LinkHandle, mpsc::Receiver<LinkEvent>), LinkError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let spawn = Spawn {
        target_id: target_id.into(),
        session_name: session_name.into(),
        history_timeout,
        status: None,
        child: None,
        guard: TransportGuard::default(),
    };
    let (handle, events) = spawn_actor(spawn, reader, writer);
    match timeout(connect_timeout, handle.health_check()).await {
        Ok(Ok(())) => Ok((handle, events)),
        Ok(Err(e)) => Err(LinkError::connect(ConnectFailure::Unknown, e.to_string())),
        Err(_) => Err(LinkError::connect(ConnectFailure::Timeout, "no reply to health check")),
    }
}

/// Start a control client for `config` and wait until it answers.
pub async fn connect(
    config: &LinkConfig,
    status: Option<Arc<dyn StatusSink>>,
) -> Result<(LinkHandle, mpsc::Receiver<LinkEvent>), LinkError> {
    let result = connect_inner(config, status.clone()).await;
    if let Some(sink) = &status {
        match &result {
            Ok(_) => sink.report(&config.target_id, LinkStatus::up()),
            Err(e) => sink.report(&config.target_id, LinkStatus::down(e.to_string())),
        }
    }
    result
}

async fn connect_inner(
    config: &LinkConfig,
    status: Option<Arc<dyn StatusSink>>,
) -> Result<(LinkHandle, mpsc::Receiver<LinkEvent>), LinkError> {
    let PreparedCommand { mut command, guard } = transport::prepare(
        &config.transport,
        &config.session_name,
        &config.tmux_bin,
        &config.ssh_bin,
        config.connect_timeout.as_secs().max(1),
    )?;

    let mut child = command.spawn().map_err(|e| {
        error!(target = %config.target_id, error = %e, "failed to spawn control client");
        let kind = match (&config.transport, e.kind()) {
            (Transport::Local, std::io::ErrorKind::NotFound) => ConnectFailure::RemoteShellUnavailable,
            _ => ConnectFailure::Unknown,
        };
        LinkError::connect(kind, e.to_string())
    })?;

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(LinkError::connect(ConnectFailure::Unknown, "child stdio not piped"));
    };

    let stderr_tail = Arc::new(Mutex::new(String::new()));
    let stderr_task = collect_stderr(config.target_id.clone(), stderr, stderr_tail.clone());

    let spawn = Spawn {
        target_id: config.target_id.clone(),
        session_name: config.session_name.clone(),
        history_timeout: config.history_timeout,
        status,
        child: Some(child),
        guard,
    };
    let (handle, events) = spawn_actor(spawn, stdout, stdin);

    let outcome = timeout(config.connect_timeout, handle.health_check()).await;
    if let Ok(Ok(())) = outcome {
        info!(target = %config.target_id, session = %config.session_name, "session link connected");
        return Ok((handle, events));
    }

    handle.disconnect().await;
    let _ = timeout(Duration::from_millis(500), stderr_task).await;
    let tail = stderr_tail.lock().map(|s| s.clone()).unwrap_or_default();

    let kind = match (&outcome, ConnectFailure::classify(&tail)) {
        (Err(_), ConnectFailure::Unknown) => ConnectFailure::Timeout,
        (_, kind) => kind,
    };
    let message = if tail.trim().is_empty() {
        match outcome {
            Err(_) => "no reply to health check".to_string(),
            Ok(Err(e)) => e.to_string(),
            Ok(Ok(())) => String::new(),
        }
    } else {
        tail.trim().to_string()
    };
    warn!(target = %config.target_id, kind = %kind, message = %message, "session link connect failed");
    Err(LinkError::connect(kind, message))
}

fn collect_stderr<R>(target_id: String, stderr: R, tail: Arc<Mutex<String>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target = %target_id, line = %line, "control client stderr");
            if let Ok(mut tail) = tail.lock() {
                tail.push_str(&line);
                tail.push('\n');
                if tail.len() > STDERR_TAIL_BYTES {
                    let cut = tail.len() - STDERR_TAIL_BYTES;
                    let cut = (cut..tail.len()).find(|i| tail.is_char_boundary(*i)).unwrap_or(0);
                    tail.drain(..cut);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    /// Raw side of a link, for writing notifications by hand.
    struct FakeTmux {
        io: DuplexStream,
    }

    impl FakeTmux {
        async fn send(&mut self, raw: &str) {
            self.io.write_all(raw.as_bytes()).await.unwrap();
        }
    }

    /// Spawn a fake that answers commands via `answer`, returning the
    /// commands it saw through a channel.
    fn spawn_fake<F>(io: DuplexStream, answer: F) -> mpsc::UnboundedReceiver<String>
    where
        F: Fn(&str) -> (bool, Vec<String>) + Send + 'static,
    {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let (read, write) = tokio::io::split(io);
        tokio::spawn(async move {
            let mut write = write;
            // tmux opens with the reply to new-session.
            write
                .write_all(b"%begin 1700000000 0 1\n%end 1700000000 0 1\n")
                .await
                .unwrap();
            let mut number = 0u64;
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    let _ = write.write_all(b"%exit\n").await;
                    break;
                }
                let _ = seen_tx.send(line.clone());
                let (ok, body) = if line.contains(READY_MARKER) {
                    (true, vec![READY_MARKER.to_string()])
                } else {
                    answer(&line)
                };
                number += 1;
                let mut out = format!("%begin 1700000000 {} 1\n", number);
                for l in body {
                    out.push_str(&l);
                    out.push('\n');
                }
                let end = if ok { "%end" } else { "%error" };
                out.push_str(&format!("{} 1700000000 {} 1\n", end, number));
                if write.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        seen_rx
    }

    async fn attach<F>(answer: F) -> (LinkHandle, mpsc::Receiver<LinkEvent>, mpsc::UnboundedReceiver<String>)
    where
        F: Fn(&str) -> (bool, Vec<String>) + Send + 'static,
    {
        let (ours, theirs) = duplex(64 * 1024);
        let seen = spawn_fake(theirs, answer);
        let (read, write) = tokio::io::split(ours);
        let (handle, events) = attach_io(
            "t1",
            "main",
            read,
            write,
            Duration::from_millis(500),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        (handle, events, seen)
    }

    fn ok(lines: &[&str]) -> (bool, Vec<String>) {
        (true, lines.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn health_check_skips_startup_block() {
        let (handle, _events, mut seen) = attach(|_| ok(&[])).await;
        assert!(seen.recv().await.unwrap().contains(READY_MARKER));
        assert_eq!(handle.session_name(), "main");
    }

    #[tokio::test]
    async fn input_is_sent_as_hex() {
        let (handle, _events, mut seen) = attach(|_| ok(&[])).await;
        seen.recv().await.unwrap();
        handle.send_input("%1", b"ls\r").await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), "send-keys -H -t %1 6c 73 0d");
    }

    #[tokio::test]
    async fn invalid_ids_never_reach_tmux() {
        let (handle, _events, mut seen) = attach(|_| ok(&[])).await;
        seen.recv().await.unwrap();
        assert!(matches!(
            handle.send_input("%1; kill-server", b"x").await,
            Err(LinkError::InvalidId(_))
        ));
        handle.close_pane("%2").await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), "kill-pane -t %2");
    }

    #[tokio::test]
    async fn error_block_is_command_failure() {
        let (handle, _events, _seen) = attach(|_| (false, vec!["can't find pane: %9".into()])).await;
        let err = handle.close_pane("%9").await.unwrap_err();
        assert!(matches!(err, LinkError::CommandFailed(ref m) if m.contains("%9")));
    }

    #[tokio::test]
    async fn replies_are_correlated_in_order() {
        let (handle, _events, _seen) = attach(|line| {
            if line.starts_with("new-window") {
                ok(&["@7"])
            } else {
                ok(&[])
            }
        })
        .await;
        let (a, b) = tokio::join!(
            handle.create_window(Some("logs")),
            handle.rename_window("@7", "x")
        );
        assert_eq!(a.unwrap(), "@7");
        b.unwrap();
    }

    #[tokio::test]
    async fn snapshot_is_returned_and_emitted() {
        let (handle, mut events, _seen) = attach(|line| {
            if line == SESSION_QUERY {
                ok(&["$0\tmain"])
            } else if line == WINDOWS_QUERY {
                ok(&["@1\t0\t1\tzsh"])
            } else if line == PANES_QUERY {
                ok(&["%1\t@1\t0\t1\t80\t24\t"])
            } else {
                ok(&[])
            }
        })
        .await;
        let snap = handle.request_snapshot().await.unwrap();
        assert_eq!(snap.panes[0].id, "%1");
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Snapshot(snap));
    }

    #[tokio::test]
    async fn history_uses_alternate_screen_when_on() {
        let (handle, _events, _seen) = attach(|line| {
            if line.contains("alternate_on") {
                ok(&["1"])
            } else if line.contains(" -a ") {
                ok(&["vim", "screen"])
            } else if line.contains("-S -") {
                ok(&["old", "scrollback", "lines"])
            } else {
                ok(&[])
            }
        })
        .await;
        let history = handle.capture_pane_history("%1").await.unwrap();
        assert_eq!(history, b"vim\r\nscreen");
    }

    #[tokio::test]
    async fn notifications_and_output_become_events() {
        let (ours, theirs) = duplex(64 * 1024);
        let mut fake = FakeTmux { io: theirs };
        let (read, write) = tokio::io::split(ours);
        let spawn = Spawn {
            target_id: "t".into(),
            session_name: "s".into(),
            history_timeout: Duration::from_secs(1),
            status: None,
            child: None,
            guard: TransportGuard::default(),
        };
        let (_handle, mut events) = spawn_actor(spawn, read, write);

        fake.send("%output %1 hi\\012\n%window-add @2\n%output %1 \\007\n")
            .await;
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Output {
                pane_id: "%1".into(),
                data: b"hi\n".to_vec()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Notification(ControlEvent::WindowAdd {
                window_id: "@2".into()
            })
        );
        assert!(matches!(events.recv().await.unwrap(), LinkEvent::Output { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Bell {
                pane_id: Some("%1".into()),
                window_id: None
            }
        );

        fake.send("%exit server exited\n").await;
        drop(fake);
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Exit {
                reason: Some("server exited".into())
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::Closed {
                reason: CloseReason::Exited(Some("server exited".into()))
            }
        );
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn lost_stream_fails_pending_and_closes_once() {
        let (ours, theirs) = duplex(1024);
        let (read, write) = tokio::io::split(ours);
        let spawn = Spawn {
            target_id: "t".into(),
            session_name: "s".into(),
            history_timeout: Duration::from_secs(1),
            status: None,
            child: None,
            guard: TransportGuard::default(),
        };
        let (handle, mut events) = spawn_actor(spawn, read, write);
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.close_pane("%1").await }
        });
        tokio::task::yield_now().await;
        drop(theirs);

        // Either the write hit the closed pipe or the reply never came.
        assert!(matches!(
            pending.await.unwrap(),
            Err(LinkError::Closed | LinkError::Io(_))
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::Closed {
                reason: CloseReason::Lost(_)
            }
        ));
        assert!(events.recv().await.is_none());
        assert!(matches!(handle.close_pane("%1").await, Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn disconnect_reports_requested() {
        let (handle, mut events, _seen) = attach(|_| ok(&[])).await;
        handle.disconnect().await;
        let mut last = None;
        while let Some(ev) = events.recv().await {
            last = Some(ev);
        }
        assert_eq!(
            last,
            Some(LinkEvent::Closed {
                reason: CloseReason::Requested
            })
        );
    }

    struct Recorder(Mutex<Vec<LinkStatus>>);

    impl StatusSink for Recorder {
        fn report(&self, _target_id: &str, status: LinkStatus) {
            self.0.lock().unwrap().push(status);
        }
    }

    #[tokio::test]
    async fn connect_failure_is_reported_to_status_sink() {
        let sink = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut config = LinkConfig::new("t", Transport::Local, "main");
        config.tmux_bin = "/nonexistent/tmux-relay-test-binary".into();
        let err = connect(&config, Some(sink.clone())).await.unwrap_err();
        assert_eq!(
            err.connect_failure(),
            Some(ConnectFailure::RemoteShellUnavailable)
        );
        let reports = sink.0.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].available);
    }
}
