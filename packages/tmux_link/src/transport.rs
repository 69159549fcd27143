//! How a control-mode client is started: locally or through ssh.

use std::io::Write;
use std::process::Stdio;

use tempfile::{NamedTempFile, TempPath};
use tokio::process::Command;
use tracing::{debug, info};

use crate::commands::quote;
use crate::error::{ConnectFailure, LinkError};

/// Environment variable the askpass helper reads the password from.
const ASKPASS_SECRET_VAR: &str = "TMUX_RELAY_SSH_SECRET";

#[derive(Clone)]
pub enum SshAuth {
    /// Use the running ssh-agent (`SSH_AUTH_SOCK`).
    Agent,
    /// Decrypted private key material.
    Key { private_key: String },
    Password { password: String },
}

impl SshAuth {
    /// Resolve a registry auth reference into a method.
    ///
    /// `secret` is the decrypted credential for `key` and `password` modes.
    pub fn from_reference(mode: &str, secret: Option<String>) -> Result<Self, LinkError> {
        match (mode, secret) {
            ("agent", _) => Ok(SshAuth::Agent),
            ("key", Some(private_key)) => Ok(SshAuth::Key { private_key }),
            ("password", Some(password)) => Ok(SshAuth::Password { password }),
            ("key" | "password", None) => Err(LinkError::connect(
                ConnectFailure::AuthFailed,
                format!("auth mode {} has no credential", mode),
            )),
            (other, _) => Err(LinkError::connect(
                ConnectFailure::UnsupportedAuthMode,
                format!("unsupported auth reference mode {:?}", other),
            )),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            SshAuth::Agent => "agent",
            SshAuth::Key { .. } => "key",
            SshAuth::Password { .. } => "password",
        }
    }
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SshAuth::{}", self.mode())
    }
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub auth: SshAuth,
}

#[derive(Debug, Clone)]
pub enum Transport {
    Local,
    Ssh(SshTarget),
}

/// Temp files that must outlive the child process.
#[derive(Default)]
pub struct TransportGuard {
    _files: Vec<TempPath>,
}

/// A ready-to-spawn command plus whatever it depends on.
pub struct PreparedCommand {
    pub command: Command,
    pub guard: TransportGuard,
}

impl std::fmt::Debug for PreparedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCommand")
            .field("command", self.command.as_std())
            .finish()
    }
}

/// Arguments that start tmux in control mode attached to `session`.
fn tmux_args(session: &str) -> Vec<String> {
    vec![
        "-C".to_string(),
        "new-session".to_string(),
        "-A".to_string(),
        "-s".to_string(),
        session.to_string(),
    ]
}

pub fn prepare(
    transport: &Transport,
    session: &str,
    tmux_bin: &str,
    ssh_bin: &str,
    connect_timeout_secs: u64,
) -> Result<PreparedCommand, LinkError> {
    let mut prepared = match transport {
        Transport::Local => {
            let mut command = Command::new(tmux_bin);
            command.args(tmux_args(session));
            info!(session, "starting local tmux control client");
            PreparedCommand {
                command,
                guard: TransportGuard::default(),
            }
        }
        Transport::Ssh(target) => prepare_ssh(target, session, tmux_bin, ssh_bin, connect_timeout_secs)?,
    };
    prepared
        .command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(prepared)
}

fn prepare_ssh(
    target: &SshTarget,
    session: &str,
    tmux_bin: &str,
    ssh_bin: &str,
    connect_timeout_secs: u64,
) -> Result<PreparedCommand, LinkError> {
    let mut command = Command::new(ssh_bin);
    let mut guard = TransportGuard::default();

    command.arg("-T");
    command.args(["-o", &format!("ConnectTimeout={}", connect_timeout_secs)]);
    command.args(["-o", "ServerAliveInterval=15"]);
    command.args(["-o", "StrictHostKeyChecking=accept-new"]);
    if let Some(port) = target.port {
        command.args(["-p", &port.to_string()]);
    }

    match &target.auth {
        SshAuth::Agent => {
            if std::env::var_os("SSH_AUTH_SOCK").is_none() {
                return Err(LinkError::connect(
                    ConnectFailure::AgentUnavailable,
                    "SSH_AUTH_SOCK is not set",
                ));
            }
            command.args(["-o", "BatchMode=yes"]);
            command.args(["-o", "PreferredAuthentications=publickey"]);
        }
        SshAuth::Key { private_key } => {
            let path = write_key_file(private_key)?;
            command.args(["-o", "BatchMode=yes"]);
            command.args(["-o", "IdentitiesOnly=yes"]);
            command.args(["-o", "PreferredAuthentications=publickey"]);
            command.arg("-i").arg(&path);
            guard._files.push(path);
        }
        SshAuth::Password { password } => {
            let script = write_askpass_script()?;
            command.args(["-o", "PreferredAuthentications=password,keyboard-interactive"]);
            command.args(["-o", "NumberOfPasswordPrompts=1"]);
            command.env("SSH_ASKPASS", &script);
            command.env("SSH_ASKPASS_REQUIRE", "force");
            command.env("DISPLAY", std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into()));
            command.env(ASKPASS_SECRET_VAR, password);
            guard._files.push(script);
        }
    }

    // The host goes after `--` so a registry value cannot become an option.
    command.arg("-l").arg(&target.user);
    command.arg("--");
    command.arg(&target.host);
    command.arg(remote_command(tmux_bin, session));

    debug!(
        host = %target.host,
        user = %target.user,
        auth = target.auth.mode(),
        "starting ssh tmux control client"
    );
    Ok(PreparedCommand { command, guard })
}

/// The remote shell parses this line, so every part is quoted.
fn remote_command(tmux_bin: &str, session: &str) -> String {
    let args: Vec<String> = tmux_args(session).iter().map(|a| quote(a)).collect();
    format!("{} {}", quote(tmux_bin), args.join(" "))
}

fn write_key_file(private_key: &str) -> Result<TempPath, LinkError> {
    // NamedTempFile is created 0600 on unix.
    let mut file = NamedTempFile::with_prefix("tmux-relay-key-")?;
    file.write_all(private_key.as_bytes())?;
    if !private_key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(file.into_temp_path())
}

fn write_askpass_script() -> Result<TempPath, LinkError> {
    let mut file = NamedTempFile::with_prefix("tmux-relay-askpass-")?;
    writeln!(file, "#!/bin/sh")?;
    writeln!(file, "printf '%s\\n' \"${}\"", ASKPASS_SECRET_VAR)?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(prepared: &PreparedCommand) -> Vec<String> {
        prepared
            .command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn local_command_line() {
        let prepared = prepare(&Transport::Local, "main", "tmux", "ssh", 10).unwrap();
        assert_eq!(prepared.command.as_std().get_program(), "tmux");
        assert_eq!(args_of(&prepared), ["-C", "new-session", "-A", "-s", "main"]);
    }

    #[test]
    fn ssh_key_command_line() {
        let target = SshTarget {
            host: "box".into(),
            port: Some(2222),
            user: "me".into(),
            auth: SshAuth::Key {
                private_key: "-----BEGIN KEY-----".into(),
            },
        };
        let prepared = prepare(&Transport::Ssh(target), "my s'ess", "tmux", "ssh", 7).unwrap();
        let args = args_of(&prepared);
        assert_eq!(args[0], "-T");
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        let key_at = args.iter().position(|a| a == "-i").unwrap();
        let key_path = std::path::Path::new(&args[key_at + 1]);
        let contents = std::fs::read_to_string(key_path).unwrap();
        assert_eq!(contents, "-----BEGIN KEY-----\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        assert_eq!(
            args.last().unwrap(),
            "'tmux' '-C' 'new-session' '-A' '-s' 'my s'\\''ess'"
        );
        assert!(args.windows(2).any(|w| w == ["-l", "me"]));
        assert!(args.windows(2).any(|w| w == ["--", "box"]));
    }

    #[test]
    fn ssh_destination_cannot_inject_options() {
        let target = SshTarget {
            host: "-oProxyCommand=touch /tmp/x".into(),
            port: None,
            user: "-oLocalCommand=id".into(),
            auth: SshAuth::Key {
                private_key: "k\n".into(),
            },
        };
        let prepared = prepare(&Transport::Ssh(target), "s", "tmux", "ssh", 5).unwrap();
        let args = args_of(&prepared);
        let end_of_options = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[end_of_options + 1], "-oProxyCommand=touch /tmp/x");
        let user_at = args.iter().position(|a| a == "-oLocalCommand=id").unwrap();
        assert_eq!(args[user_at - 1], "-l");
        assert!(
            args[..end_of_options]
                .iter()
                .all(|a| !a.starts_with("-oProxyCommand"))
        );
    }

    #[test]
    fn key_file_removed_with_guard() {
        let target = SshTarget {
            host: "h".into(),
            port: None,
            user: "u".into(),
            auth: SshAuth::Key {
                private_key: "k\n".into(),
            },
        };
        let prepared = prepare(&Transport::Ssh(target), "s", "tmux", "ssh", 5).unwrap();
        let args = args_of(&prepared);
        let key_at = args.iter().position(|a| a == "-i").unwrap();
        let key_path = std::path::PathBuf::from(&args[key_at + 1]);
        assert!(key_path.exists());
        drop(prepared);
        assert!(!key_path.exists());
    }

    #[test]
    fn password_uses_askpass() {
        let target = SshTarget {
            host: "h".into(),
            port: None,
            user: "u".into(),
            auth: SshAuth::Password {
                password: "hunter2".into(),
            },
        };
        let prepared = prepare(&Transport::Ssh(target), "s", "tmux", "ssh", 5).unwrap();
        let envs: Vec<_> = prepared
            .command
            .as_std()
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned())))
            .collect();
        assert!(envs.contains(&("SSH_ASKPASS_REQUIRE".into(), "force".into())));
        assert!(envs.contains(&(ASKPASS_SECRET_VAR.into(), "hunter2".into())));
        // The password never lands on the command line.
        assert!(!args_of(&prepared).iter().any(|a| a.contains("hunter2")));
    }

    #[test]
    fn auth_reference_modes() {
        assert!(matches!(
            SshAuth::from_reference("agent", None),
            Ok(SshAuth::Agent)
        ));
        assert!(matches!(
            SshAuth::from_reference("key", Some("k".into())),
            Ok(SshAuth::Key { .. })
        ));
        let err = SshAuth::from_reference("kerberos", None).unwrap_err();
        assert_eq!(err.connect_failure(), Some(ConnectFailure::UnsupportedAuthMode));
        let err = SshAuth::from_reference("password", None).unwrap_err();
        assert_eq!(err.connect_failure(), Some(ConnectFailure::AuthFailed));
    }

    #[test]
    fn debug_hides_secrets() {
        let auth = SshAuth::Password {
            password: "hunter2".into(),
        };
        assert_eq!(format!("{:?}", auth), "SshAuth::password");
    }
}
