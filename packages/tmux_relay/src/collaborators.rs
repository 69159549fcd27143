//! Services the relay depends on but does not own.
//!
//! Each collaborator is a trait so deployments can plug in their own store,
//! key service or notification channel. The adapters here let the binary run
//! on its own: a `targets.toml` registry, secret references resolved from the
//! environment or files, and a log or webhook notifier.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tmux_link::LinkStatus;

use crate::config::ReconnectPolicy;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("target registry: {0}")]
    Registry(String),

    #[error("notifier: {0}")]
    Notify(String),
}

/// A stored secret could not be decrypted.
///
/// This means the key material does not match the stored data, so it is
/// fatal at startup and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decrypt {scope} {entity:?} field {field}: {message}")]
pub struct CredentialDecryptError {
    pub scope: String,
    pub entity: String,
    pub field: String,
    pub message: String,
}

// =============================================================================
// Target registry
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Local,
    Ssh,
}

/// A registered tmux target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: TargetKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    /// `agent`, `key` or `password`.
    #[serde(default = "default_auth_mode")]
    pub auth_mode: String,
    /// Encrypted credential for `key` / `password` auth.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_session_name")]
    pub session_name: String,
}

fn default_auth_mode() -> String {
    "agent".to_string()
}

fn default_session_name() -> String {
    "main".to_string()
}

impl TargetRecord {
    pub fn local(id: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: TargetKind::Local,
            host: None,
            port: None,
            user: None,
            auth_mode: default_auth_mode(),
            secret: None,
            session_name: session_name.into(),
        }
    }
}

#[async_trait]
pub trait TargetRegistry: Send + Sync {
    async fn lookup_target(&self, id: &str) -> Result<Option<TargetRecord>, CollaboratorError>;

    async fn list_targets(&self) -> Result<Vec<TargetRecord>, CollaboratorError>;

    async fn update_runtime_status(
        &self,
        id: &str,
        status: LinkStatus,
    ) -> Result<(), CollaboratorError>;
}

#[cfg(test)]
#[derive(Default)]
pub struct InMemoryTargetRegistry {
    targets: Mutex<Vec<TargetRecord>>,
    statuses: Mutex<HashMap<String, LinkStatus>>,
}

#[cfg(test)]
impl InMemoryTargetRegistry {
    pub fn new(targets: Vec<TargetRecord>) -> Arc<Self> {
        Arc::new(Self {
            targets: Mutex::new(targets),
            statuses: Mutex::new(HashMap::new()),
        })
    }

    pub async fn insert(&self, target: TargetRecord) {
        let mut guard = self.targets.lock().await;
        if let Some(existing) = guard.iter_mut().find(|t| t.id == target.id) {
            *existing = target;
        } else {
            guard.push(target);
        }
    }

    pub async fn remove(&self, id: &str) {
        self.targets.lock().await.retain(|t| t.id != id);
    }

    pub async fn status(&self, id: &str) -> Option<LinkStatus> {
        self.statuses.lock().await.get(id).cloned()
    }
}

#[cfg(test)]
#[async_trait]
impl TargetRegistry for InMemoryTargetRegistry {
    async fn lookup_target(&self, id: &str) -> Result<Option<TargetRecord>, CollaboratorError> {
        Ok(self.targets.lock().await.iter().find(|t| t.id == id).cloned())
    }

    async fn list_targets(&self) -> Result<Vec<TargetRecord>, CollaboratorError> {
        Ok(self.targets.lock().await.clone())
    }

    async fn update_runtime_status(
        &self,
        id: &str,
        status: LinkStatus,
    ) -> Result<(), CollaboratorError> {
        self.statuses.lock().await.insert(id.to_string(), status);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: Vec<TargetRecord>,
}

/// Registry backed by `targets.toml`, re-read on every call so edits apply
/// without a restart. Runtime status is kept in memory.
pub struct FileTargetRegistry {
    path: PathBuf,
    statuses: Mutex<HashMap<String, LinkStatus>>,
}

impl FileTargetRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            statuses: Mutex::new(HashMap::new()),
        })
    }

    async fn load(&self) -> Result<TargetsFile, CollaboratorError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no targets file");
                return Ok(TargetsFile::default());
            }
            Err(e) => {
                return Err(CollaboratorError::Registry(format!(
                    "reading {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };
        toml::from_str(&text).map_err(|e| {
            CollaboratorError::Registry(format!("parsing {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl TargetRegistry for FileTargetRegistry {
    async fn lookup_target(&self, id: &str) -> Result<Option<TargetRecord>, CollaboratorError> {
        Ok(self.load().await?.targets.into_iter().find(|t| t.id == id))
    }

    async fn list_targets(&self) -> Result<Vec<TargetRecord>, CollaboratorError> {
        Ok(self.load().await?.targets)
    }

    async fn update_runtime_status(
        &self,
        id: &str,
        status: LinkStatus,
    ) -> Result<(), CollaboratorError> {
        debug!(target = %id, available = status.available, "runtime status");
        self.statuses.lock().await.insert(id.to_string(), status);
        Ok(())
    }
}

// =============================================================================
// Secrets
// =============================================================================

#[async_trait]
pub trait SecretDecryptor: Send + Sync {
    /// Turn a stored ciphertext into plaintext. The error is a bare message;
    /// callers attach scope and field.
    async fn decrypt(&self, ciphertext: &str) -> Result<String, String>;
}

/// Resolves secret references instead of ciphertexts:
/// `env:NAME`, `file:/path/to/secret` or `plain:value`.
#[derive(Debug, Default, Clone)]
pub struct ReferenceDecryptor;

#[async_trait]
impl SecretDecryptor for ReferenceDecryptor {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, String> {
        match ciphertext.split_once(':') {
            Some(("env", name)) => {
                std::env::var(name).map_err(|_| format!("environment variable {} is not set", name))
            }
            Some(("file", path)) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| format!("reading {}: {}", path, e)),
            Some(("plain", value)) => Ok(value.to_string()),
            _ => Err("unrecognised secret reference".to_string()),
        }
    }
}

/// Decrypt the credential of a target, if it has one.
pub async fn decrypt_target_secret(
    decryptor: &dyn SecretDecryptor,
    target: &TargetRecord,
) -> Result<Option<String>, CredentialDecryptError> {
    let Some(ciphertext) = &target.secret else {
        return Ok(None);
    };
    decryptor
        .decrypt(ciphertext)
        .await
        .map(Some)
        .map_err(|message| CredentialDecryptError {
            scope: "target".to_string(),
            entity: target.id.clone(),
            field: "secret".to_string(),
            message,
        })
}

/// Decrypt every stored secret once, failing on the first mismatch.
pub async fn verify_credentials(
    registry: &dyn TargetRegistry,
    decryptor: &dyn SecretDecryptor,
) -> anyhow::Result<usize> {
    let targets = registry.list_targets().await?;
    let mut checked = 0;
    for target in &targets {
        if decrypt_target_secret(decryptor, target).await?.is_some() {
            checked += 1;
        }
    }
    info!(targets = targets.len(), secrets = checked, "credentials verified");
    Ok(checked)
}

// =============================================================================
// Notifications
// =============================================================================

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event_type: &str, event: serde_json::Value)
    -> Result<(), CollaboratorError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        event_type: &str,
        event: serde_json::Value,
    ) -> Result<(), CollaboratorError> {
        info!(event_type, %event, "notification");
        Ok(())
    }
}

/// POSTs `{"type": ..., "event": ...}` to a URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        event_type: &str,
        event: serde_json::Value,
    ) -> Result<(), CollaboratorError> {
        let body = serde_json::json!({ "type": event_type, "event": event });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CollaboratorError::Notify(e.to_string()))?;
        if !response.status().is_success() {
            warn!(status = %response.status(), url = %self.url, "webhook rejected notification");
            return Err(CollaboratorError::Notify(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Operational settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationalSettings {
    pub push_enabled: bool,
    pub site_url: Option<String>,
    pub reconnect: ReconnectPolicy,
}

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn operational_settings(&self) -> OperationalSettings;
}

/// Settings fixed at startup from the config file.
pub struct StaticSettings(pub OperationalSettings);

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn operational_settings(&self) -> OperationalSettings {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_registry_lookup_and_status() {
        let registry = InMemoryTargetRegistry::new(vec![TargetRecord::local("t1", "main")]);
        assert!(registry.lookup_target("t1").await.unwrap().is_some());
        assert!(registry.lookup_target("nope").await.unwrap().is_none());

        registry
            .update_runtime_status("t1", LinkStatus::down("gone"))
            .await
            .unwrap();
        let status = registry.status("t1").await.unwrap();
        assert!(!status.available);
        assert_eq!(status.last_error.as_deref(), Some("gone"));

        registry.insert(TargetRecord::local("t2", "work")).await;
        registry.remove("t1").await;
        let ids: Vec<_> = registry
            .list_targets()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, ["t2"]);
    }

    #[tokio::test]
    async fn file_registry_reads_targets_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.toml");
        let registry = FileTargetRegistry::new(&path);
        assert!(registry.list_targets().await.unwrap().is_empty());

        std::fs::write(
            &path,
            r#"
[[targets]]
id = "laptop"
kind = "local"

[[targets]]
id = "build"
kind = "ssh"
host = "build.internal"
port = 2222
user = "ci"
auth_mode = "key"
secret = "env:BUILD_KEY"
session_name = "jobs"
"#,
        )
        .unwrap();

        let targets = registry.list_targets().await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].session_name, "main");
        assert_eq!(targets[0].auth_mode, "agent");
        let build = registry.lookup_target("build").await.unwrap().unwrap();
        assert_eq!(build.kind, TargetKind::Ssh);
        assert_eq!(build.port, Some(2222));
        assert_eq!(build.secret.as_deref(), Some("env:BUILD_KEY"));
    }

    #[tokio::test]
    async fn file_registry_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.toml");
        std::fs::write(&path, "[[targets]]\nid = 3\n").unwrap();
        let registry = FileTargetRegistry::new(&path);
        assert!(matches!(
            registry.list_targets().await,
            Err(CollaboratorError::Registry(_))
        ));
    }

    #[tokio::test]
    async fn reference_decryptor_resolves_files_and_plain_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        std::fs::write(&path, "s3cret").unwrap();

        let d = ReferenceDecryptor;
        assert_eq!(d.decrypt("plain:abc").await.unwrap(), "abc");
        assert_eq!(
            d.decrypt(&format!("file:{}", path.display())).await.unwrap(),
            "s3cret"
        );
        assert!(d.decrypt("aes:deadbeef").await.is_err());
        assert!(d.decrypt("no scheme").await.is_err());
    }

    #[tokio::test]
    async fn decrypt_failure_carries_context() {
        let mut target = TargetRecord::local("t1", "main");
        assert_eq!(
            decrypt_target_secret(&ReferenceDecryptor, &target).await.unwrap(),
            None
        );

        target.secret = Some("bogus".into());
        let err = decrypt_target_secret(&ReferenceDecryptor, &target)
            .await
            .unwrap_err();
        assert_eq!(err.scope, "target");
        assert_eq!(err.entity, "t1");
        assert_eq!(err.field, "secret");
    }

    #[tokio::test]
    async fn verify_credentials_fails_on_first_bad_secret() {
        let mut good = TargetRecord::local("good", "main");
        good.secret = Some("plain:ok".into());
        let mut bad = TargetRecord::local("bad", "main");
        bad.secret = Some("rot13:xyz".into());

        let registry = InMemoryTargetRegistry::new(vec![good.clone()]);
        assert_eq!(
            verify_credentials(registry.as_ref(), &ReferenceDecryptor)
                .await
                .unwrap(),
            1
        );

        registry.insert(bad).await;
        let err = verify_credentials(registry.as_ref(), &ReferenceDecryptor)
            .await
            .unwrap_err();
        let decrypt = err.downcast_ref::<CredentialDecryptError>().unwrap();
        assert_eq!(decrypt.entity, "bad");
    }
}
