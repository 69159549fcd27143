//! Session links shared between viewer sockets.
//!
//! Every socket attached to a target holds a [`Lease`] on one shared link.
//! The link is opened by the first lease, fanned out to every holder through
//! a broadcast channel and disconnected when the last lease is released. A
//! link that closes on its own is not reopened until someone asks again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use tmux_link::{LinkEvent, SessionControl};

use crate::connector::Connector;
use crate::error::RelayError;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone)]
struct Shared {
    id: u64,
    control: Arc<dyn SessionControl>,
    events: broadcast::Sender<LinkEvent>,
}

#[derive(Default)]
struct Slot {
    /// Held across the connect so concurrent acquirers wait for one attempt.
    link: tokio::sync::Mutex<Option<Shared>>,
}

struct Entry {
    slot: Arc<Slot>,
    refs: usize,
}

/// A reference on a shared link.
pub struct Lease {
    target_id: String,
    control: Arc<dyn SessionControl>,
    slot: Arc<Slot>,
}

impl Lease {
    pub fn control(&self) -> Arc<dyn SessionControl> {
        self.control.clone()
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("target_id", &self.target_id)
            .finish()
    }
}

pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Take a lease on `target_id`, connecting if nobody holds the link.
    ///
    /// The receiver sees every event the link emits from now on.
    pub async fn acquire(
        self: &Arc<Self>,
        target_id: &str,
    ) -> Result<(Lease, broadcast::Receiver<LinkEvent>), RelayError> {
        let slot = {
            let mut entries = self.lock_entries();
            let entry = entries.entry(target_id.to_string()).or_insert_with(|| Entry {
                slot: Arc::new(Slot::default()),
                refs: 0,
            });
            entry.refs += 1;
            entry.slot.clone()
        };

        let mut link = slot.link.lock().await;
        let (shared, receiver) = match link.as_ref() {
            Some(shared) => (shared.clone(), shared.events.subscribe()),
            None => match self.connector.connect(target_id).await {
                Ok((control, events)) => {
                    let (tx, rx) = broadcast::channel(BROADCAST_CAPACITY);
                    let shared = Shared {
                        id: self.next_id.fetch_add(1, Ordering::Relaxed),
                        control,
                        events: tx,
                    };
                    tokio::spawn(pump(
                        target_id.to_string(),
                        shared.id,
                        events,
                        shared.events.clone(),
                        Arc::downgrade(&slot),
                    ));
                    info!(target = %target_id, "viewer link opened");
                    *link = Some(shared.clone());
                    (shared, rx)
                }
                Err(e) => {
                    drop(link);
                    self.drop_ref(target_id, &slot);
                    return Err(e);
                }
            },
        };
        drop(link);

        Ok((
            Lease {
                target_id: target_id.to_string(),
                control: shared.control,
                slot,
            },
            receiver,
        ))
    }

    /// Give a lease back; the last one disconnects the link.
    pub async fn release(&self, lease: Lease) {
        if !self.drop_ref(&lease.target_id, &lease.slot) {
            return;
        }
        let shared = lease.slot.link.lock().await.take();
        if let Some(shared) = shared {
            info!(target = %lease.target_id, "last viewer left, disconnecting");
            shared.control.disconnect().await;
        }
    }

    /// Returns true when this was the last reference.
    fn drop_ref(&self, target_id: &str, slot: &Arc<Slot>) -> bool {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(target_id) else {
            return false;
        };
        if !Arc::ptr_eq(&entry.slot, slot) {
            return false;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            entries.remove(target_id);
            true
        } else {
            false
        }
    }

    /// Targets with at least one lease.
    pub fn active_targets(&self) -> usize {
        self.lock_entries().len()
    }

    #[cfg(test)]
    pub fn ref_count(&self, target_id: &str) -> usize {
        self.lock_entries().get(target_id).map_or(0, |e| e.refs)
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map is still structurally valid.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Copy link events into the broadcast channel until the link closes.
async fn pump(
    target_id: String,
    id: u64,
    mut events: mpsc::Receiver<LinkEvent>,
    tx: broadcast::Sender<LinkEvent>,
    slot: Weak<Slot>,
) {
    while let Some(event) = events.recv().await {
        let closed = matches!(event, LinkEvent::Closed { .. });
        if tx.send(event).is_err() {
            debug!(target = %target_id, "link event with no viewers");
        }
        if closed {
            break;
        }
    }

    // Forget the dead link so the next acquire reconnects.
    if let Some(slot) = slot.upgrade() {
        let mut link = slot.link.lock().await;
        if link.as_ref().is_some_and(|s| s.id == id) {
            warn!(target = %target_id, "viewer link closed");
            *link = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeConnector;
    use tmux_link::CloseReason;

    #[tokio::test]
    async fn concurrent_acquires_connect_once() {
        let connector = FakeConnector::with_delay(std::time::Duration::from_millis(20));
        let registry = ConnectionRegistry::new(connector.clone());

        let (a, b, c) = tokio::join!(
            registry.acquire("t1"),
            registry.acquire("t1"),
            registry.acquire("t1")
        );
        let (a, b, c) = (a.unwrap().0, b.unwrap().0, c.unwrap().0);
        assert_eq!(connector.connect_count("t1"), 1);
        assert_eq!(registry.ref_count("t1"), 3);

        registry.release(a).await;
        registry.release(b).await;
        let session = connector.session("t1").unwrap();
        assert!(!session.is_disconnected());

        registry.release(c).await;
        assert!(session.is_disconnected());
        assert_eq!(registry.ref_count("t1"), 0);
    }

    #[tokio::test]
    async fn events_fan_out_to_every_lease() {
        let connector = FakeConnector::new();
        let registry = ConnectionRegistry::new(connector.clone());
        let (_a, mut rx_a) = registry.acquire("t1").await.unwrap();
        let (_b, mut rx_b) = registry.acquire("t1").await.unwrap();

        let session = connector.session("t1").unwrap();
        session
            .emit(LinkEvent::Output {
                pane_id: "%1".into(),
                data: b"x".to_vec(),
            })
            .await;
        assert!(matches!(rx_a.recv().await.unwrap(), LinkEvent::Output { .. }));
        assert!(matches!(rx_b.recv().await.unwrap(), LinkEvent::Output { .. }));
    }

    #[tokio::test]
    async fn failed_connect_leaves_no_entry() {
        let connector = FakeConnector::new();
        connector.fail_next("t1", 1);
        let registry = ConnectionRegistry::new(connector.clone());

        assert!(registry.acquire("t1").await.is_err());
        assert_eq!(registry.ref_count("t1"), 0);

        // No automatic retry; the next explicit acquire connects again.
        assert_eq!(connector.connect_count("t1"), 1);
        registry.acquire("t1").await.unwrap();
        assert_eq!(connector.connect_count("t1"), 2);
    }

    #[tokio::test]
    async fn closed_link_is_reopened_on_next_acquire() {
        let connector = FakeConnector::new();
        let registry = ConnectionRegistry::new(connector.clone());
        let (lease, mut rx) = registry.acquire("t1").await.unwrap();

        connector
            .session("t1")
            .unwrap()
            .close(CloseReason::Lost("boom".into()))
            .await;
        assert!(matches!(rx.recv().await.unwrap(), LinkEvent::Closed { .. }));
        // The pump clears the slot after forwarding Closed.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let (_again, _rx) = registry.acquire("t1").await.unwrap();
        assert_eq!(connector.connect_count("t1"), 2);
        registry.release(lease).await;
        assert_eq!(registry.ref_count("t1"), 1);
    }
}
