//! Per-socket view of the targets a client is attached to.
//!
//! Each entry owns a lease on the shared link, the switch barrier for that
//! target and a forwarding task that turns link events into wire frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tmux_link::{ControlEvent, LinkEvent, SessionControl};
use tmux_wire::{
    DeviceConnected, DeviceDisconnected, DeviceEvent, DeviceEventKind, Message, TermInput,
    TermPaste, TermResize, TermSyncSize, TmuxSelect,
};

use super::barrier::SwitchBarrier;
use super::protocol::{Outbound, state_snapshot, term_output, tmux_event};
use crate::error::RelayError;
use crate::registry::{ConnectionRegistry, Lease};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceConnectionState {
    Idle,
    Detached,
    Connecting,
    Attached,
    Error,
}

struct Linked {
    lease: Lease,
    barrier: Arc<SwitchBarrier>,
    cancel: CancellationToken,
}

struct Attachment {
    state: DeviceConnectionState,
    epoch: u64,
    link: Option<Linked>,
}

pub struct ClientSessionStore {
    registry: Arc<ConnectionRegistry>,
    out: Outbound,
    attachments: Mutex<HashMap<String, Attachment>>,
    next_epoch: AtomicU64,
}

impl ClientSessionStore {
    pub fn new(registry: Arc<ConnectionRegistry>, out: Outbound) -> Arc<Self> {
        Arc::new(Self {
            registry,
            out,
            attachments: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
        })
    }

    pub fn state(&self, target_id: &str) -> DeviceConnectionState {
        self.lock()
            .get(target_id)
            .map_or(DeviceConnectionState::Idle, |a| a.state)
    }

    /// Handle DEVICE_CONNECT.
    pub async fn connect(self: &Arc<Self>, target_id: &str) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        match self.state(target_id) {
            DeviceConnectionState::Connecting => {
                debug!(target = %target_id, "connect already in progress");
                return;
            }
            DeviceConnectionState::Attached => {
                self.reannounce(target_id).await;
                return;
            }
            _ => {}
        }
        self.lock().insert(
            target_id.to_string(),
            Attachment {
                state: DeviceConnectionState::Connecting,
                epoch,
                link: None,
            },
        );

        match self.registry.acquire(target_id).await {
            Ok((lease, events)) => self.attach(target_id, epoch, lease, events).await,
            Err(e) => {
                warn!(target = %target_id, error = %e, "device connect failed");
                {
                    let mut attachments = self.lock();
                    if let Some(a) = attachments.get_mut(target_id).filter(|a| a.epoch == epoch) {
                        a.state = DeviceConnectionState::Error;
                    }
                }
                self.send(Message::DeviceEvent(DeviceEvent {
                    target_id: target_id.to_string(),
                    event: DeviceEventKind::Error,
                    code: e.device_code().map(str::to_string),
                    message: e.to_string(),
                }))
                .await;
                self.send_error(target_id, &e).await;
            }
        }
    }

    async fn attach(
        self: &Arc<Self>,
        target_id: &str,
        epoch: u64,
        lease: Lease,
        events: broadcast::Receiver<LinkEvent>,
    ) {
        let control = lease.control();
        let barrier = Arc::new(SwitchBarrier::new(target_id, self.out.clone()));
        let cancel = CancellationToken::new();

        let stale = {
            let mut attachments = self.lock();
            match attachments.get_mut(target_id).filter(|a| a.epoch == epoch) {
                Some(a) => {
                    a.state = DeviceConnectionState::Attached;
                    a.link = Some(Linked {
                        lease,
                        barrier: barrier.clone(),
                        cancel: cancel.clone(),
                    });
                    None
                }
                None => Some(lease),
            }
        };
        if let Some(lease) = stale {
            // Disconnected while we were connecting.
            debug!(target = %target_id, "dropping lease for abandoned connect");
            self.registry.release(lease).await;
            return;
        }

        info!(target = %target_id, session = %control.session_name(), "device attached");
        self.send(Message::DeviceConnected(DeviceConnected {
            target_id: target_id.to_string(),
            session_name: control.session_name().to_string(),
        }))
        .await;

        tokio::spawn(forward_events(
            Arc::downgrade(self),
            target_id.to_string(),
            epoch,
            events,
            barrier,
            self.out.clone(),
            cancel,
        ));

        // The snapshot arrives as a link event and goes out through the forwarder.
        if let Err(e) = control.request_snapshot().await {
            warn!(target = %target_id, error = %e, "initial snapshot failed");
        }
    }

    async fn reannounce(&self, target_id: &str) {
        let Ok((control, _)) = self.attached(target_id) else {
            return;
        };
        self.send(Message::DeviceConnected(DeviceConnected {
            target_id: target_id.to_string(),
            session_name: control.session_name().to_string(),
        }))
        .await;
        if let Err(e) = control.request_snapshot().await {
            warn!(target = %target_id, error = %e, "snapshot failed");
        }
    }

    /// Handle DEVICE_DISCONNECT.
    pub async fn disconnect(&self, target_id: &str) {
        let removed = self.lock().remove(target_id);
        if let Some(Linked { lease, cancel, .. }) = removed.and_then(|a| a.link) {
            cancel.cancel();
            self.registry.release(lease).await;
        }
        self.send(Message::DeviceDisconnected(DeviceDisconnected {
            target_id: target_id.to_string(),
            reason: Some("requested".into()),
        }))
        .await;
    }

    /// Release every attachment; the socket is going away.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (target_id, attachment) in drained {
            if let Some(linked) = attachment.link {
                debug!(target = %target_id, "releasing on socket close");
                linked.cancel.cancel();
                self.registry.release(linked.lease).await;
            }
        }
    }

    /// Handle TMUX_SELECT.
    ///
    /// The transaction is opened before returning so selects keep their
    /// arrival order; the rest runs on its own task.
    pub async fn select(&self, select: TmuxSelect) {
        let target_id = select.target_id.clone();
        let (control, barrier) = match self.attached(&target_id) {
            Ok(pair) => pair,
            Err(e) => return self.send_error(&target_id, &e).await,
        };
        barrier.begin(&select).await;

        let out = self.out.clone();
        tokio::spawn(async move {
            if let Err(e) = barrier.complete(control.as_ref(), select).await {
                warn!(target = %target_id, error = %e, "select failed");
                let _ = out.send(Message::Error(e.to_payload(&target_id))).await;
            }
        });
    }

    /// Handle TERM_INPUT. Composition updates are not forwarded.
    pub async fn input(&self, input: TermInput) {
        if input.is_composing {
            return;
        }
        let result = match self.attached(&input.target_id) {
            Ok((control, _)) => control
                .send_input(&input.pane_id, &input.data)
                .await
                .map_err(RelayError::from),
            Err(e) => Err(e),
        };
        self.report(&input.target_id, result).await;
    }

    pub async fn paste(&self, paste: TermPaste) {
        let result = match self.attached(&paste.target_id) {
            Ok((control, _)) => control
                .paste(&paste.pane_id, &paste.data)
                .await
                .map_err(RelayError::from),
            Err(e) => Err(e),
        };
        self.report(&paste.target_id, result).await;
    }

    pub async fn resize(&self, resize: TermResize) {
        let result = match self.attached(&resize.target_id) {
            Ok((control, _)) => control
                .resize_pane(&resize.pane_id, resize.cols, resize.rows)
                .await
                .map_err(RelayError::from),
            Err(e) => Err(e),
        };
        self.report(&resize.target_id, result).await;
    }

    pub async fn sync_size(&self, sync: TermSyncSize) {
        let result = match self.attached(&sync.target_id) {
            Ok((control, _)) => control
                .sync_client_size(sync.cols, sync.rows)
                .await
                .map_err(RelayError::from),
            Err(e) => Err(e),
        };
        self.report(&sync.target_id, result).await;
    }

    fn attached(
        &self,
        target_id: &str,
    ) -> Result<(Arc<dyn SessionControl>, Arc<SwitchBarrier>), RelayError> {
        let attachments = self.lock();
        attachments
            .get(target_id)
            .filter(|a| a.state == DeviceConnectionState::Attached)
            .and_then(|a| a.link.as_ref())
            .map(|l| (l.lease.control(), l.barrier.clone()))
            .ok_or_else(|| RelayError::not_ready(target_id, "device is not attached"))
    }

    /// The link went away underneath us.
    async fn link_closed(&self, target_id: &str, epoch: u64) {
        let lease = {
            let mut attachments = self.lock();
            match attachments.get_mut(target_id).filter(|a| a.epoch == epoch) {
                Some(a) => {
                    a.state = DeviceConnectionState::Detached;
                    a.link.take().map(|l| l.lease)
                }
                None => None,
            }
        };
        if let Some(lease) = lease {
            self.registry.release(lease).await;
        }
    }

    async fn report(&self, target_id: &str, result: Result<(), RelayError>) {
        if let Err(e) = result {
            debug!(target = %target_id, error = %e, "terminal command failed");
            self.send_error(target_id, &e).await;
        }
    }

    async fn send_error(&self, target_id: &str, err: &RelayError) {
        self.send(Message::Error(err.to_payload(target_id))).await;
    }

    async fn send(&self, msg: Message) {
        let _ = self.out.send(msg).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Attachment>> {
        self.attachments.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn forward_events(
    store: Weak<ClientSessionStore>,
    target_id: String,
    epoch: u64,
    mut events: broadcast::Receiver<LinkEvent>,
    barrier: Arc<SwitchBarrier>,
    out: Outbound,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(LinkEvent::Output { pane_id, data }) => {
                barrier.forward(term_output(&target_id, pane_id, data)).await;
            }
            Ok(LinkEvent::Notification(event)) => {
                if let Some(msg) = tmux_event(&target_id, event) {
                    barrier.forward(msg).await;
                }
            }
            Ok(LinkEvent::Bell { pane_id, window_id }) => {
                if let Some(msg) = tmux_event(&target_id, ControlEvent::Bell { pane_id, window_id })
                {
                    barrier.forward(msg).await;
                }
            }
            Ok(LinkEvent::Snapshot(snapshot)) => {
                barrier.forward(state_snapshot(&target_id, &snapshot)).await;
            }
            Ok(LinkEvent::Exit { reason }) => {
                let _ = out
                    .send(Message::DeviceEvent(DeviceEvent {
                        target_id: target_id.clone(),
                        event: DeviceEventKind::Exit,
                        code: None,
                        message: reason.unwrap_or_else(|| "tmux exited".into()),
                    }))
                    .await;
            }
            Ok(LinkEvent::Closed { reason }) => {
                info!(target = %target_id, reason = %reason, "device link closed");
                let _ = out
                    .send(Message::DeviceEvent(DeviceEvent {
                        target_id: target_id.clone(),
                        event: DeviceEventKind::Closed,
                        code: None,
                        message: reason.to_string(),
                    }))
                    .await;
                let _ = out
                    .send(Message::DeviceDisconnected(DeviceDisconnected {
                        target_id: target_id.clone(),
                        reason: Some(reason.to_string()),
                    }))
                    .await;
                if let Some(store) = store.upgrade() {
                    store.link_closed(&target_id, epoch).await;
                }
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(target = %target_id, skipped = n, "viewer fell behind link events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeConnector;
    use std::time::Duration;
    use tmux_link::CloseReason;
    use tmux_wire::{DataEncoding, ErrorCode, MessageKind, SelectToken};
    use tokio::sync::mpsc;

    fn store(connector: Arc<FakeConnector>) -> (Arc<ClientSessionStore>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        (
            ClientSessionStore::new(ConnectionRegistry::new(connector), tx),
            rx,
        )
    }

    async fn next(rx: &mut mpsc::Receiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound channel closed")
    }

    fn input(data: &str, is_composing: bool) -> TermInput {
        TermInput {
            target_id: "t1".into(),
            pane_id: "%1".into(),
            encoding: DataEncoding::Utf8,
            data: data.as_bytes().to_vec(),
            is_composing,
        }
    }

    #[tokio::test]
    async fn connect_announces_then_snapshots() {
        let connector = FakeConnector::new();
        let (store, mut rx) = store(connector.clone());

        store.connect("t1").await;
        assert_eq!(store.state("t1"), DeviceConnectionState::Attached);

        let Message::DeviceConnected(connected) = next(&mut rx).await else {
            panic!("expected DEVICE_CONNECTED");
        };
        assert_eq!(connected.session_name, "main");
        assert_eq!(next(&mut rx).await.kind(), MessageKind::StateSnapshot);
    }

    #[tokio::test]
    async fn failed_connect_reports_device_error() {
        let connector = FakeConnector::new();
        connector.fail_next("t1", 1);
        let (store, mut rx) = store(connector);

        store.connect("t1").await;
        assert_eq!(store.state("t1"), DeviceConnectionState::Error);

        let Message::DeviceEvent(event) = next(&mut rx).await else {
            panic!("expected DEVICE_EVENT");
        };
        assert_eq!(event.event, DeviceEventKind::Error);
        assert_eq!(event.code.as_deref(), Some("host_unreachable"));
        let Message::Error(err) = next(&mut rx).await else {
            panic!("expected ERROR");
        };
        assert_eq!(err.code, ErrorCode::DeviceConnectFailed.as_u16());
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn commands_require_attachment() {
        let (store, mut rx) = store(FakeConnector::new());
        store.input(input("ls", false)).await;
        let Message::Error(err) = next(&mut rx).await else {
            panic!("expected ERROR");
        };
        assert_eq!(err.code, ErrorCode::TargetNotReady.as_u16());
        assert_eq!(err.target_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn composing_input_is_dropped() {
        let connector = FakeConnector::new();
        let (store, _rx) = store(connector.clone());
        store.connect("t1").await;

        store.input(input("k", true)).await;
        store.input(input("ka", false)).await;
        store
            .sync_size(TermSyncSize {
                target_id: "t1".into(),
                cols: 120,
                rows: 30,
            })
            .await;

        let calls = connector.session("t1").unwrap().calls();
        assert_eq!(calls, ["snapshot", "input %1 ka", "client-size 120x30"]);
    }

    #[tokio::test]
    async fn output_is_forwarded() {
        let connector = FakeConnector::new();
        let (store, mut rx) = store(connector.clone());
        store.connect("t1").await;
        next(&mut rx).await;
        next(&mut rx).await;

        connector
            .session("t1")
            .unwrap()
            .emit(LinkEvent::Output {
                pane_id: "%2".into(),
                data: b"hello".to_vec(),
            })
            .await;
        let Message::TermOutput(out) = next(&mut rx).await else {
            panic!("expected TERM_OUTPUT");
        };
        assert_eq!(out.pane_id, "%2");
        assert_eq!(out.data, b"hello");
    }

    #[tokio::test]
    async fn select_runs_through_the_barrier() {
        let connector = FakeConnector::new();
        let (store, mut rx) = store(connector.clone());
        store.connect("t1").await;
        next(&mut rx).await;
        next(&mut rx).await;

        store
            .select(TmuxSelect {
                target_id: "t1".into(),
                window_id: Some("@2".into()),
                pane_id: Some("%3".into()),
                select_token: SelectToken([7; 16]),
                want_history: true,
                cols: None,
                rows: None,
            })
            .await;

        assert_eq!(next(&mut rx).await.kind(), MessageKind::SwitchAck);
        let Message::TermHistory(history) = next(&mut rx).await else {
            panic!("expected TERM_HISTORY");
        };
        assert_eq!(history.data, b"history of %3");
        assert_eq!(next(&mut rx).await.kind(), MessageKind::LiveResume);
    }

    #[tokio::test]
    async fn link_loss_detaches() {
        let connector = FakeConnector::new();
        let (store, mut rx) = store(connector.clone());
        store.connect("t1").await;
        next(&mut rx).await;
        next(&mut rx).await;

        connector
            .session("t1")
            .unwrap()
            .close(CloseReason::Lost("eof".into()))
            .await;

        let Message::DeviceEvent(event) = next(&mut rx).await else {
            panic!("expected DEVICE_EVENT");
        };
        assert_eq!(event.event, DeviceEventKind::Closed);
        let Message::DeviceDisconnected(gone) = next(&mut rx).await else {
            panic!("expected DEVICE_DISCONNECTED");
        };
        assert_eq!(gone.reason.as_deref(), Some("connection lost: eof"));

        // link_closed runs right after the frames are queued.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.state("t1"), DeviceConnectionState::Detached);
        // Not retried until the client asks again.
        assert_eq!(connector.connect_count("t1"), 1);
    }

    #[tokio::test]
    async fn disconnect_and_close_release_leases() {
        let connector = FakeConnector::new();
        let (tx, mut rx) = mpsc::channel(64);
        let registry = ConnectionRegistry::new(connector.clone());
        let a = ClientSessionStore::new(registry.clone(), tx.clone());
        let b = ClientSessionStore::new(registry.clone(), tx);

        a.connect("t1").await;
        b.connect("t1").await;
        assert_eq!(connector.connect_count("t1"), 1);
        assert_eq!(registry.ref_count("t1"), 2);

        a.disconnect("t1").await;
        assert_eq!(a.state("t1"), DeviceConnectionState::Idle);
        assert_eq!(registry.ref_count("t1"), 1);
        assert!(!connector.session("t1").unwrap().is_disconnected());

        b.close_all().await;
        assert_eq!(registry.ref_count("t1"), 0);
        assert!(connector.session("t1").unwrap().is_disconnected());

        let mut kinds = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            kinds.push(msg.kind());
        }
        assert!(kinds.contains(&MessageKind::DeviceDisconnected));
    }
}
