//! Building tmux command lines.
//!
//! Every id is validated before it is put on a command line and every free
//! text argument is single-quoted, so nothing a client sends can smuggle a
//! second command into the control stream.

use crate::error::LinkError;

/// Bytes per `send-keys -H` command.
const HEX_KEYS_PER_COMMAND: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Session,
    Window,
    Pane,
}

impl IdKind {
    fn sigil(self) -> char {
        match self {
            IdKind::Session => '$',
            IdKind::Window => '@',
            IdKind::Pane => '%',
        }
    }
}

/// Check that `id` is a sigil followed by digits (`%3`, `@12`, `$0`).
pub fn validate_id(id: &str, kind: IdKind) -> Result<&str, LinkError> {
    let mut chars = id.chars();
    let ok = chars.next() == Some(kind.sigil())
        && !chars.as_str().is_empty()
        && chars.all(|c| c.is_ascii_digit());
    if ok {
        Ok(id)
    } else {
        Err(LinkError::InvalidId(id.to_string()))
    }
}

pub fn pane(id: &str) -> Result<&str, LinkError> {
    validate_id(id, IdKind::Pane)
}

pub fn window(id: &str) -> Result<&str, LinkError> {
    validate_id(id, IdKind::Window)
}

/// Single-quote an argument. Line breaks would end the command, so they are
/// flattened to spaces.
pub fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        match c {
            '\'' => out.push_str("'\\''"),
            '\n' | '\r' => out.push(' '),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// `send-keys -H` commands carrying `data` byte for byte.
pub fn send_hex(pane_id: &str, data: &[u8]) -> Result<Vec<String>, LinkError> {
    let pane_id = pane(pane_id)?;
    Ok(data
        .chunks(HEX_KEYS_PER_COMMAND)
        .map(|chunk| {
            let mut line = format!("send-keys -H -t {}", pane_id);
            for b in chunk {
                line.push_str(&format!(" {:02x}", b));
            }
            line
        })
        .collect())
}

/// A named key such as `Enter` or `C-c`.
pub fn send_key(pane_id: &str, key: &str) -> Result<String, LinkError> {
    let pane_id = pane(pane_id)?;
    if key.is_empty() || key.chars().any(|c| c.is_control()) {
        return Err(LinkError::InvalidArgument(format!("bad key name {:?}", key)));
    }
    Ok(format!("send-keys -t {} {}", pane_id, quote(key)))
}

const PASTE_BUFFER: &str = "tmux-relay-paste";

/// Load `data` into a scratch buffer and paste it into the pane.
///
/// The buffer text is double-quoted with every byte outside a safe set
/// written as an octal escape, so newlines and non-UTF-8 survive the command
/// line. `paste-buffer -p` adds bracketed-paste guards when the application
/// asked for them.
pub fn paste(pane_id: &str, data: &[u8]) -> Result<Vec<String>, LinkError> {
    let pane_id = pane(pane_id)?;
    let mut text = String::with_capacity(data.len() + 2);
    text.push('"');
    for &b in data {
        if b.is_ascii_alphanumeric() || b" .,:;-_=+/!?*()[]<>@%^&|'".contains(&b) {
            text.push(b as char);
        } else {
            text.push_str(&format!("\\{:03o}", b));
        }
    }
    text.push('"');
    Ok(vec![
        format!("set-buffer -b {} -- {}", PASTE_BUFFER, text),
        format!("paste-buffer -p -d -b {} -t {}", PASTE_BUFFER, pane_id),
    ])
}

pub fn select_pane(window_id: &str, pane_id: &str) -> Result<Vec<String>, LinkError> {
    Ok(vec![
        format!("select-window -t {}", window(window_id)?),
        format!("select-pane -t {}", pane(pane_id)?),
    ])
}

pub fn resize_pane(pane_id: &str, cols: u16, rows: u16) -> Result<String, LinkError> {
    if cols == 0 || rows == 0 {
        return Err(LinkError::InvalidArgument(format!(
            "pane size {}x{}",
            cols, rows
        )));
    }
    Ok(format!("resize-pane -t {} -x {} -y {}", pane(pane_id)?, cols, rows))
}

pub fn refresh_client_size(cols: u16, rows: u16) -> Result<String, LinkError> {
    if cols == 0 || rows == 0 {
        return Err(LinkError::InvalidArgument(format!(
            "client size {}x{}",
            cols, rows
        )));
    }
    Ok(format!("refresh-client -C {}x{}", cols, rows))
}

pub fn new_window(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("new-window -P -F '#{{window_id}}' -n {}", quote(name)),
        None => "new-window -P -F '#{window_id}'".to_string(),
    }
}

pub fn kill_window(window_id: &str) -> Result<String, LinkError> {
    Ok(format!("kill-window -t {}", window(window_id)?))
}

pub fn kill_pane(pane_id: &str) -> Result<String, LinkError> {
    Ok(format!("kill-pane -t {}", pane(pane_id)?))
}

pub fn rename_window(window_id: &str, name: &str) -> Result<String, LinkError> {
    Ok(format!(
        "rename-window -t {} {}",
        window(window_id)?,
        quote(name)
    ))
}

pub fn alternate_probe(pane_id: &str) -> Result<String, LinkError> {
    Ok(format!(
        "display-message -p -t {} '#{{alternate_on}}'",
        pane(pane_id)?
    ))
}

/// Contents of the alternate screen. `-q` keeps tmux quiet when there is none.
pub fn capture_alternate(pane_id: &str) -> Result<String, LinkError> {
    Ok(format!("capture-pane -p -e -a -q -t {}", pane(pane_id)?))
}

/// Normal screen including the whole scrollback.
pub fn capture_scrollback(pane_id: &str) -> Result<String, LinkError> {
    Ok(format!("capture-pane -p -e -S - -t {}", pane(pane_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_validated() {
        assert!(pane("%0").is_ok());
        assert!(window("@15").is_ok());
        assert!(validate_id("$2", IdKind::Session).is_ok());
        for bad in ["", "%", "@1", "%1;kill-server", "%1 ", "% 1", "%x"] {
            assert!(pane(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("a;b"), "'a;b'");
        assert_eq!(quote("two\nlines"), "'two lines'");
    }

    #[test]
    fn hex_input_is_chunked() {
        let data = vec![0x1b; 300];
        let lines = send_hex("%2", &data).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("send-keys -H -t %2 1b 1b"));
        assert_eq!(lines[1].matches(" 1b").count(), 44);
    }

    #[test]
    fn hex_input_rejects_bad_pane() {
        assert!(send_hex("@1", b"x").is_err());
    }

    #[test]
    fn paste_escapes_everything_unsafe() {
        let lines = paste("%1", b"a \"b\"\n$HOME\\").unwrap();
        assert_eq!(
            lines[0],
            "set-buffer -b tmux-relay-paste -- \"a \\042b\\042\\012\\044HOME\\134\""
        );
        assert_eq!(lines[1], "paste-buffer -p -d -b tmux-relay-paste -t %1");
    }

    #[test]
    fn rename_and_new_window() {
        assert_eq!(
            rename_window("@3", "logs").unwrap(),
            "rename-window -t @3 'logs'"
        );
        assert_eq!(new_window(None), "new-window -P -F '#{window_id}'");
        assert_eq!(
            new_window(Some("x")),
            "new-window -P -F '#{window_id}' -n 'x'"
        );
    }

    #[test]
    fn sizes_must_be_positive() {
        assert!(resize_pane("%1", 0, 10).is_err());
        assert_eq!(
            resize_pane("%1", 80, 24).unwrap(),
            "resize-pane -t %1 -x 80 -y 24"
        );
        assert_eq!(refresh_client_size(100, 30).unwrap(), "refresh-client -C 100x30");
    }

    #[test]
    fn control_chars_rejected_in_key_names() {
        assert!(send_key("%1", "Enter").is_ok());
        assert!(send_key("%1", "").is_err());
        assert!(send_key("%1", "a\nkill-server").is_err());
    }
}
