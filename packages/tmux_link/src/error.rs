use std::fmt;

/// Why a connection attempt failed, derived from the transport's stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectFailure {
    AuthFailed,
    AgentUnavailable,
    AgentNoIdentity,
    HostUnreachable,
    ConnectionRefused,
    Timeout,
    HandshakeFailed,
    /// ssh worked but `tmux` could not be started on the other side.
    RemoteShellUnavailable,
    UnsupportedAuthMode,
    Unknown,
}

impl ConnectFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectFailure::AuthFailed => "auth_failed",
            ConnectFailure::AgentUnavailable => "agent_unavailable",
            ConnectFailure::AgentNoIdentity => "agent_no_identity",
            ConnectFailure::HostUnreachable => "host_unreachable",
            ConnectFailure::ConnectionRefused => "connection_refused",
            ConnectFailure::Timeout => "timeout",
            ConnectFailure::HandshakeFailed => "handshake_failed",
            ConnectFailure::RemoteShellUnavailable => "remote_shell_unavailable",
            ConnectFailure::UnsupportedAuthMode => "unsupported_auth_mode",
            ConnectFailure::Unknown => "unknown",
        }
    }

    /// Credentials and configuration problems do not fix themselves.
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            ConnectFailure::AuthFailed | ConnectFailure::UnsupportedAuthMode
        )
    }

    /// Classify an ssh/tmux stderr transcript.
    pub fn classify(stderr: &str) -> ConnectFailure {
        let text = stderr.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

        // Agent messages usually precede a generic "Permission denied".
        if has(&["agent has no identities"]) {
            ConnectFailure::AgentNoIdentity
        } else if has(&[
            "could not open a connection to your authentication agent",
            "error connecting to agent",
            "ssh_auth_sock",
        ]) {
            ConnectFailure::AgentUnavailable
        } else if has(&[
            "host key verification failed",
            "remote host identification has changed",
            "kex_exchange_identification",
            "unable to negotiate",
            "no matching host key",
        ]) {
            ConnectFailure::HandshakeFailed
        } else if has(&[
            "permission denied",
            "authentication failed",
            "too many authentication failures",
        ]) {
            ConnectFailure::AuthFailed
        } else if has(&["connection refused"]) {
            ConnectFailure::ConnectionRefused
        } else if has(&[
            "could not resolve hostname",
            "name or service not known",
            "no route to host",
            "network is unreachable",
            "host is down",
        ]) {
            ConnectFailure::HostUnreachable
        } else if has(&["timed out", "timeout"]) {
            ConnectFailure::Timeout
        } else if has(&[
            "command not found",
            "tmux: not found",
            "no such file or directory",
            "open terminal failed",
        ]) {
            ConnectFailure::RemoteShellUnavailable
        } else {
            ConnectFailure::Unknown
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a session link.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkError {
    #[error("connect failed ({kind}): {message}")]
    ConnectFailed {
        kind: ConnectFailure,
        message: String,
    },

    #[error("invalid tmux id: {0:?}")]
    InvalidId(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("unexpected tmux reply: {0}")]
    Parse(String),

    #[error("session link closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

impl LinkError {
    pub fn connect(kind: ConnectFailure, message: impl Into<String>) -> Self {
        LinkError::ConnectFailed {
            kind,
            message: message.into(),
        }
    }

    pub fn connect_failure(&self) -> Option<ConnectFailure> {
        match self {
            LinkError::ConnectFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_ssh_failures() {
        let cases = [
            (
                "user@host: Permission denied (publickey,password).",
                ConnectFailure::AuthFailed,
            ),
            (
                "The agent has no identities.\nuser@host: Permission denied (publickey).",
                ConnectFailure::AgentNoIdentity,
            ),
            (
                "Could not open a connection to your authentication agent.",
                ConnectFailure::AgentUnavailable,
            ),
            (
                "ssh: Could not resolve hostname nope: Name or service not known",
                ConnectFailure::HostUnreachable,
            ),
            (
                "ssh: connect to host 10.0.0.1 port 22: Connection refused",
                ConnectFailure::ConnectionRefused,
            ),
            (
                "ssh: connect to host 10.0.0.1 port 22: Connection timed out",
                ConnectFailure::Timeout,
            ),
            ("Host key verification failed.", ConnectFailure::HandshakeFailed),
            ("bash: tmux: command not found", ConnectFailure::RemoteShellUnavailable),
            ("something odd", ConnectFailure::Unknown),
        ];
        for (stderr, expected) in cases {
            assert_eq!(ConnectFailure::classify(stderr), expected, "{stderr}");
        }
    }

    #[test]
    fn auth_and_mode_failures_are_not_retryable() {
        assert!(!ConnectFailure::AuthFailed.retryable());
        assert!(!ConnectFailure::UnsupportedAuthMode.retryable());
        assert!(ConnectFailure::Timeout.retryable());
        assert!(ConnectFailure::HostUnreachable.retryable());
    }

    #[test]
    fn error_exposes_failure_kind() {
        let err = LinkError::connect(ConnectFailure::ConnectionRefused, "refused");
        assert_eq!(err.connect_failure(), Some(ConnectFailure::ConnectionRefused));
        assert_eq!(err.to_string(), "connect failed (connection_refused): refused");
        assert_eq!(LinkError::Closed.connect_failure(), None);
    }
}
