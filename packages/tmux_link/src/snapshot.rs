//! Session / window / pane tree rebuilt from three list commands.

use tracing::warn;

use crate::error::LinkError;

pub const SESSION_QUERY: &str = "display-message -p '#{session_id}\t#{session_name}'";
pub const WINDOWS_QUERY: &str =
    "list-windows -F '#{window_id}\t#{window_index}\t#{window_active}\t#{window_name}'";
pub const PANES_QUERY: &str = "list-panes -s -F '#{pane_id}\t#{window_id}\t#{pane_index}\t#{pane_active}\t#{pane_width}\t#{pane_height}\t#{pane_title}'";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub id: String,
    pub name: String,
    pub index: u32,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub id: String,
    pub window_id: String,
    pub index: u32,
    pub title: Option<String>,
    pub active: bool,
    pub width: u16,
    pub height: u16,
}

/// Point-in-time view of one tmux session.
///
/// Every pane's `window_id` names a window in `windows`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: SessionInfo,
    pub windows: Vec<WindowInfo>,
    pub panes: Vec<PaneInfo>,
}

impl SessionSnapshot {
    /// Assemble a snapshot from the output lines of the three queries.
    pub fn from_lines(
        session_lines: &[String],
        window_lines: &[String],
        pane_lines: &[String],
    ) -> Result<Self, LinkError> {
        let session = session_lines
            .first()
            .and_then(|line| line.split_once('\t'))
            .map(|(id, name)| SessionInfo {
                id: id.to_string(),
                name: name.to_string(),
            })
            .ok_or_else(|| LinkError::Parse(format!("session line {:?}", session_lines)))?;

        let mut windows = window_lines
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| parse_window(l))
            .collect::<Result<Vec<_>, _>>()?;
        windows.sort_by_key(|w| w.index);

        let mut panes = Vec::with_capacity(pane_lines.len());
        for line in pane_lines.iter().filter(|l| !l.is_empty()) {
            let pane = parse_pane(line)?;
            if windows.iter().any(|w| w.id == pane.window_id) {
                panes.push(pane);
            } else {
                warn!(pane = %pane.id, window = %pane.window_id, "dropping pane with unknown window");
            }
        }

        Ok(Self {
            session,
            windows,
            panes,
        })
    }

    pub fn window(&self, id: &str) -> Option<&WindowInfo> {
        self.windows.iter().find(|w| w.id == id)
    }

    pub fn pane(&self, id: &str) -> Option<&PaneInfo> {
        self.panes.iter().find(|p| p.id == id)
    }

    pub fn active_window(&self) -> Option<&WindowInfo> {
        self.windows.iter().find(|w| w.active)
    }

    /// Active pane of a window, falling back to its first pane.
    pub fn active_pane_in(&self, window_id: &str) -> Option<&PaneInfo> {
        let mut in_window = self.panes.iter().filter(|p| p.window_id == window_id);
        let first = in_window.clone().next();
        in_window.find(|p| p.active).or(first)
    }
}

fn field<'a>(parts: &[&'a str], i: usize, line: &str) -> Result<&'a str, LinkError> {
    parts
        .get(i)
        .copied()
        .ok_or_else(|| LinkError::Parse(format!("missing field {} in {:?}", i, line)))
}

fn number<T: std::str::FromStr>(s: &str, line: &str) -> Result<T, LinkError> {
    s.parse()
        .map_err(|_| LinkError::Parse(format!("bad number {:?} in {:?}", s, line)))
}

fn parse_window(line: &str) -> Result<WindowInfo, LinkError> {
    let parts: Vec<&str> = line.splitn(4, '\t').collect();
    Ok(WindowInfo {
        id: field(&parts, 0, line)?.to_string(),
        index: number(field(&parts, 1, line)?, line)?,
        active: field(&parts, 2, line)? == "1",
        name: field(&parts, 3, line)?.to_string(),
    })
}

fn parse_pane(line: &str) -> Result<PaneInfo, LinkError> {
    let parts: Vec<&str> = line.splitn(7, '\t').collect();
    let title = parts.get(6).filter(|t| !t.is_empty()).map(|t| t.to_string());
    Ok(PaneInfo {
        id: field(&parts, 0, line)?.to_string(),
        window_id: field(&parts, 1, line)?.to_string(),
        index: number(field(&parts, 2, line)?, line)?,
        active: field(&parts, 3, line)? == "1",
        width: number(field(&parts, 4, line)?, line)?,
        height: number(field(&parts, 5, line)?, line)?,
        title,
    })
}
