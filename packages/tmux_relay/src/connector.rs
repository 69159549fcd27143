//! Turning a target id into a live session link.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tmux_link::{
    LinkConfig, LinkError, LinkEvent, LinkStatus, SessionControl, SshAuth, SshTarget, StatusSink,
    Transport,
};

use crate::collaborators::{
    SecretDecryptor, TargetKind, TargetRecord, TargetRegistry, decrypt_target_secret,
};
use crate::config::ServerConfig;
use crate::error::RelayError;

/// A connected session and its event stream.
pub type LinkPair = (Arc<dyn SessionControl>, mpsc::Receiver<LinkEvent>);

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target_id: &str) -> Result<LinkPair, RelayError>;
}

/// Forwards link status to the target registry without blocking the link.
pub struct RegistryStatusSink {
    registry: Arc<dyn TargetRegistry>,
}

impl RegistryStatusSink {
    pub fn new(registry: Arc<dyn TargetRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }
}

impl StatusSink for RegistryStatusSink {
    fn report(&self, target_id: &str, status: LinkStatus) {
        let registry = self.registry.clone();
        let target_id = target_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = registry.update_runtime_status(&target_id, status).await {
                warn!(target = %target_id, error = %e, "failed to record runtime status");
            }
        });
    }
}

/// Settings shared by every link the relay opens.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub tmux_bin: String,
    pub ssh_bin: String,
    pub connect_timeout: Duration,
    pub history_timeout: Duration,
}

impl LinkSettings {
    pub fn from_server(config: &ServerConfig) -> Self {
        Self {
            tmux_bin: config.tmux_bin.clone(),
            ssh_bin: config.ssh_bin.clone(),
            connect_timeout: config.connect_timeout,
            history_timeout: config.history_timeout,
        }
    }
}

/// Build the link configuration for a registered target.
pub fn link_config(
    target: &TargetRecord,
    secret: Option<String>,
    settings: &LinkSettings,
) -> Result<LinkConfig, RelayError> {
    let transport = match target.kind {
        TargetKind::Local => Transport::Local,
        TargetKind::Ssh => {
            let host = target
                .host
                .clone()
                .ok_or_else(|| RelayError::not_ready(&target.id, "ssh target has no host"))?;
            let user = target
                .user
                .clone()
                .ok_or_else(|| RelayError::not_ready(&target.id, "ssh target has no user"))?;
            Transport::Ssh(SshTarget {
                host,
                port: target.port,
                user,
                auth: SshAuth::from_reference(&target.auth_mode, secret)?,
            })
        }
    };
    let mut config = LinkConfig::new(&target.id, transport, &target.session_name);
    config.tmux_bin = settings.tmux_bin.clone();
    config.ssh_bin = settings.ssh_bin.clone();
    config.connect_timeout = settings.connect_timeout;
    config.history_timeout = settings.history_timeout;
    Ok(config)
}

/// Connects registered targets with `tmux_link`.
pub struct LinkConnector {
    registry: Arc<dyn TargetRegistry>,
    decryptor: Arc<dyn SecretDecryptor>,
    settings: LinkSettings,
    status: Arc<RegistryStatusSink>,
}

impl LinkConnector {
    pub fn new(
        registry: Arc<dyn TargetRegistry>,
        decryptor: Arc<dyn SecretDecryptor>,
        settings: LinkSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            status: RegistryStatusSink::new(registry.clone()),
            registry,
            decryptor,
            settings,
        })
    }
}

#[async_trait]
impl Connector for LinkConnector {
    async fn connect(&self, target_id: &str) -> Result<LinkPair, RelayError> {
        let target = self
            .registry
            .lookup_target(target_id)
            .await?
            .ok_or_else(|| RelayError::TargetNotFound(target_id.to_string()))?;

        let needs_secret = target.kind == TargetKind::Ssh && target.auth_mode != "agent";
        let secret = if needs_secret {
            decrypt_target_secret(self.decryptor.as_ref(), &target).await?
        } else {
            None
        };

        let config = match link_config(&target, secret, &self.settings) {
            Ok(config) => config,
            Err(e) => {
                if let RelayError::Link(LinkError::ConnectFailed { .. }) = &e {
                    self.status.report(target_id, LinkStatus::down(e.to_string()));
                }
                return Err(e);
            }
        };
        debug!(target = %target_id, session = %target.session_name, "connecting");

        let status: Arc<dyn StatusSink> = self.status.clone();
        let (handle, events) = tmux_link::connect(&config, Some(status)).await?;
        Ok((Arc::new(handle), events))
    }
}
