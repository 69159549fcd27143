//! Always-on connections for bell notifications.
//!
//! The supervisor keeps one link per registered target, separate from any
//! viewer link, and reconnects it forever with a two-phase backoff. Every
//! connect attempt is tagged with a generation drawn from one supervisor-wide
//! counter; results from any other generation are thrown away, including
//! attempts that outlived a removed entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tmux_link::{LinkEvent, SessionControl, SessionSnapshot};

use super::bell::{BellContext, deep_link, resolve_bell};
use crate::collaborators::{Notifier, SettingsProvider, TargetRecord, TargetRegistry};
use crate::config::ReconnectPolicy;
use crate::connector::Connector;

pub const BELL_EVENT: &str = "terminal.bell";

#[derive(Default)]
struct PushEntry {
    record: Option<TargetRecord>,
    generation: u64,
    attempts: u32,
    control: Option<Arc<dyn SessionControl>>,
    snapshot: Option<SessionSnapshot>,
    timer: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl PushEntry {
    /// Stop timers and tasks; the caller disconnects the returned link.
    fn teardown(&mut self) -> Option<Arc<dyn SessionControl>> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.snapshot = None;
        self.control.take()
    }
}

#[derive(Serialize)]
struct BellNotification<'a> {
    target_id: &'a str,
    session_name: &'a str,
    #[serde(flatten)]
    context: &'a BellContext,
    at: DateTime<Utc>,
}

/// Delay before the next attempt, counting it against the fast budget.
pub fn next_delay(policy: &ReconnectPolicy, attempts: &mut u32) -> std::time::Duration {
    if *attempts < policy.max_fast_retries {
        *attempts += 1;
        policy.fast_delay
    } else {
        policy.slow_interval
    }
}

pub struct PushSupervisor {
    connector: Arc<dyn Connector>,
    targets: Arc<dyn TargetRegistry>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<dyn SettingsProvider>,
    entries: Mutex<HashMap<String, PushEntry>>,
    generations: AtomicU64,
}

impl PushSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        targets: Arc<dyn TargetRegistry>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            targets,
            notifier,
            settings,
            entries: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        })
    }

    /// Add an entry for every registered target. Returns how many were added.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<usize> {
        if !self.settings.operational_settings().await.push_enabled {
            info!("push supervisor disabled");
            return Ok(0);
        }
        let targets = self.targets.list_targets().await?;
        let mut added = 0;
        for target in &targets {
            if self.add(target) {
                added += 1;
            }
        }
        info!(targets = added, "push supervisor started");
        Ok(added)
    }

    /// Start watching `target`. False if it is already watched.
    pub fn add(self: &Arc<Self>, target: &TargetRecord) -> bool {
        let generation = {
            let mut entries = self.lock();
            if entries.contains_key(&target.id) {
                return false;
            }
            let generation = self.next_generation();
            entries.insert(
                target.id.clone(),
                PushEntry {
                    record: Some(target.clone()),
                    generation,
                    ..Default::default()
                },
            );
            generation
        };
        tokio::spawn(self.clone().attempt(target.id.clone(), generation));
        true
    }

    /// Re-read the registry: watch new targets, drop deleted ones and
    /// reconnect the ones whose record changed.
    pub async fn sync_targets(self: &Arc<Self>) -> anyhow::Result<()> {
        let targets = self.targets.list_targets().await?;

        let (removed, changed) = {
            let mut entries = self.lock();
            let removed: Vec<String> = entries
                .keys()
                .filter(|id| !targets.iter().any(|t| &t.id == *id))
                .cloned()
                .collect();
            let mut changed = Vec::new();
            for target in &targets {
                if let Some(entry) = entries.get_mut(&target.id) {
                    if entry.record.as_ref() != Some(target) {
                        entry.record = Some(target.clone());
                        changed.push(target.id.clone());
                    }
                }
            }
            (removed, changed)
        };

        for id in &removed {
            self.remove(id).await;
        }
        for id in &changed {
            self.reconnect(id).await;
        }
        let mut added = 0;
        for target in &targets {
            if self.add(target) {
                added += 1;
            }
        }
        if added + removed.len() + changed.len() > 0 {
            info!(
                added,
                removed = removed.len(),
                changed = changed.len(),
                "push targets synced"
            );
        }
        Ok(())
    }

    /// Drop the current link and connect again right away.
    pub async fn reconnect(self: &Arc<Self>, target_id: &str) {
        let (old, generation) = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(target_id) else {
                return;
            };
            entry.generation = self.next_generation();
            (entry.teardown(), entry.generation)
        };
        if let Some(control) = old {
            control.disconnect().await;
        }
        info!(target = %target_id, generation, "push link reconnecting");
        tokio::spawn(self.clone().attempt(target_id.to_string(), generation));
    }

    pub async fn remove(&self, target_id: &str) {
        let removed = self.lock().remove(target_id);
        if let Some(mut entry) = removed {
            if let Some(control) = entry.teardown() {
                control.disconnect().await;
            }
            info!(target = %target_id, "push target removed");
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (target_id, mut entry) in drained {
            if let Some(control) = entry.teardown() {
                debug!(target = %target_id, "stopping push link");
                control.disconnect().await;
            }
        }
        info!("push supervisor stopped");
    }

    pub fn target_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_connected(&self, target_id: &str) -> bool {
        self.lock()
            .get(target_id)
            .is_some_and(|e| e.control.is_some())
    }

    pub fn reconnect_attempts(&self, target_id: &str) -> Option<u32> {
        self.lock().get(target_id).map(|e| e.attempts)
    }

    async fn attempt(self: Arc<Self>, target_id: String, generation: u64) {
        let result = self.connector.connect(&target_id).await;

        let (control, events) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(target = %target_id, generation, error = %e, "push connect failed");
                self.schedule_reconnect(&target_id, generation).await;
                return;
            }
        };

        let accepted = {
            let mut entries = self.lock();
            match entries.get_mut(&target_id).filter(|e| e.generation == generation) {
                Some(entry) => {
                    if let Some(stale) = entry.teardown() {
                        let target_id = target_id.clone();
                        tokio::spawn(async move {
                            warn!(target = %target_id, "replacing a live push link");
                            stale.disconnect().await;
                        });
                    }
                    entry.attempts = 0;
                    entry.control = Some(control.clone());
                    entry.watcher = Some(tokio::spawn(watch(
                        Arc::downgrade(&self),
                        target_id.clone(),
                        generation,
                        control.session_name().to_string(),
                        events,
                    )));
                    true
                }
                None => false,
            }
        };
        if !accepted {
            debug!(target = %target_id, generation, "discarding superseded push link");
            control.disconnect().await;
            return;
        }
        info!(target = %target_id, generation, "push link connected");

        match control.request_snapshot().await {
            Ok(snapshot) => self.store_snapshot(&target_id, generation, snapshot),
            Err(e) => warn!(target = %target_id, error = %e, "push snapshot failed"),
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>, target_id: &str, generation: u64) {
        let policy = self.settings.operational_settings().await.reconnect;
        let mut entries = self.lock();
        let Some(entry) = entries
            .get_mut(target_id)
            .filter(|e| e.generation == generation)
        else {
            return;
        };
        let delay = next_delay(&policy, &mut entry.attempts);
        debug!(
            target = %target_id,
            attempts = entry.attempts,
            delay_ms = delay.as_millis() as u64,
            "push reconnect scheduled"
        );

        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        let this = Arc::downgrade(self);
        let target_id = target_id.to_string();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = this.upgrade() {
                this.fire(target_id, generation).await;
            }
        }));
    }

    /// Reconnect timer expiry. Boxed because it closes the
    /// attempt/schedule/fire cycle.
    fn fire(self: Arc<Self>, target_id: String, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let next = {
                let mut entries = self.lock();
                match entries
                    .get_mut(&target_id)
                    .filter(|e| e.generation == generation)
                {
                    Some(entry) => {
                        entry.generation = self.next_generation();
                        // This task is the timer; it must not abort itself later.
                        entry.timer = None;
                        entry.generation
                    }
                    None => return,
                }
            };
            self.attempt(target_id, next).await;
        })
    }

    fn store_snapshot(&self, target_id: &str, generation: u64, snapshot: SessionSnapshot) {
        if let Some(entry) = self
            .lock()
            .get_mut(target_id)
            .filter(|e| e.generation == generation)
        {
            entry.snapshot = Some(snapshot);
        }
    }

    async fn link_closed(self: &Arc<Self>, target_id: &str, generation: u64) {
        {
            let mut entries = self.lock();
            let Some(entry) = entries
                .get_mut(target_id)
                .filter(|e| e.generation == generation)
            else {
                return;
            };
            entry.control = None;
            entry.watcher = None;
        }
        self.schedule_reconnect(target_id, generation).await;
    }

    fn refresh_snapshot(&self, target_id: &str, generation: u64) {
        let control = self
            .lock()
            .get(target_id)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.control.clone());
        if let Some(control) = control {
            // The reply comes back as a Snapshot event.
            let target_id = target_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = control.request_snapshot().await {
                    debug!(target = %target_id, error = %e, "snapshot refresh failed");
                }
            });
        }
    }

    async fn bell(
        &self,
        target_id: &str,
        session_name: &str,
        pane_id: Option<String>,
        window_id: Option<String>,
    ) {
        let snapshot = self.lock().get(target_id).and_then(|e| e.snapshot.clone());
        let Some(mut context) =
            resolve_bell(snapshot.as_ref(), pane_id.as_deref(), window_id.as_deref())
        else {
            debug!(target = %target_id, ?pane_id, ?window_id, "bell with no resolvable pane");
            return;
        };
        if let Some(site_url) = self.settings.operational_settings().await.site_url {
            context.deep_link_url = Some(deep_link(
                &site_url,
                target_id,
                &context.window_id,
                &context.pane_id,
            ));
        }

        let event = match serde_json::to_value(BellNotification {
            target_id,
            session_name,
            context: &context,
            at: Utc::now(),
        }) {
            Ok(event) => event,
            Err(e) => {
                warn!(target = %target_id, error = %e, "failed to encode bell event");
                return;
            }
        };
        if let Err(e) = self.notifier.notify(BELL_EVENT, event).await {
            warn!(target = %target_id, error = %e, "bell notification failed");
        }
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PushEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn watch(
    supervisor: Weak<PushSupervisor>,
    target_id: String,
    generation: u64,
    session_name: String,
    mut events: mpsc::Receiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(this) = supervisor.upgrade() else {
            return;
        };
        match event {
            LinkEvent::Notification(event) if event.is_structural() => {
                this.refresh_snapshot(&target_id, generation);
            }
            LinkEvent::Snapshot(snapshot) => this.store_snapshot(&target_id, generation, snapshot),
            LinkEvent::Bell { pane_id, window_id } => {
                let target_id = target_id.clone();
                let session_name = session_name.clone();
                tokio::spawn(async move {
                    this.bell(&target_id, &session_name, pane_id, window_id).await;
                });
            }
            LinkEvent::Exit { reason } => {
                info!(target = %target_id, ?reason, "push link tmux exited");
            }
            LinkEvent::Closed { reason } => {
                warn!(target = %target_id, generation, %reason, "push link closed");
                this.link_closed(&target_id, generation).await;
                return;
            }
            LinkEvent::Output { .. } | LinkEvent::Notification(_) => {}
        }
    }
    // Stream ended without Closed.
    if let Some(this) = supervisor.upgrade() {
        this.link_closed(&target_id, generation).await;
    }
}
