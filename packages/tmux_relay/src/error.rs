//! Relay errors and how they are reported on the wire.

use tmux_link::LinkError;
use tmux_wire::{ErrorCode, ErrorPayload};

use crate::collaborators::{CollaboratorError, CredentialDecryptError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("target {0} not found")]
    TargetNotFound(String),

    #[error("target {target_id} is not ready: {message}")]
    TargetNotReady { target_id: String, message: String },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Credential(#[from] CredentialDecryptError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl RelayError {
    pub fn not_ready(target_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::TargetNotReady {
            target_id: target_id.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::TargetNotFound(_) => ErrorCode::TargetNotFound,
            RelayError::TargetNotReady { .. } | RelayError::Collaborator(_) => {
                ErrorCode::TargetNotReady
            }
            RelayError::Credential(_) => ErrorCode::DeviceConnectFailed,
            RelayError::Link(LinkError::ConnectFailed { .. }) => ErrorCode::DeviceConnectFailed,
            RelayError::Link(LinkError::Closed) => ErrorCode::TargetNotReady,
            RelayError::Link(_) => ErrorCode::CommandFailed,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            RelayError::TargetNotFound(_) | RelayError::Credential(_) => false,
            RelayError::Link(LinkError::ConnectFailed { kind, .. }) => kind.retryable(),
            _ => true,
        }
    }

    /// Sub-code for DEVICE_EVENT frames, e.g. `auth_failed`.
    pub fn device_code(&self) -> Option<&'static str> {
        match self {
            RelayError::Link(e) => e.connect_failure().map(|k| k.as_str()),
            RelayError::Credential(_) => Some("credential_decrypt_failed"),
            _ => None,
        }
    }

    pub fn to_payload(&self, target_id: &str) -> ErrorPayload {
        ErrorPayload::new(self.code(), self.retryable(), self.to_string()).for_target(target_id)
    }
}
