//! Resolving a raw bell against the last known session tree.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;

use tmux_link::SessionSnapshot;

/// Characters escaped in a deep-link path segment. tmux ids keep their `@`
/// and `$` sigils; `%` is always escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'@')
    .remove(b'$');

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BellContext {
    pub window_id: String,
    pub pane_id: String,
    pub window_index: Option<u32>,
    pub pane_index: Option<u32>,
    pub deep_link_url: Option<String>,
}

/// Work out which pane rang.
///
/// Tries the exact pane, then the named window's active pane, then the
/// session's active window and pane. Without a snapshot only fully
/// specified bells resolve.
pub fn resolve_bell(
    snapshot: Option<&SessionSnapshot>,
    pane_id: Option<&str>,
    window_id: Option<&str>,
) -> Option<BellContext> {
    let Some(snapshot) = snapshot else {
        return match (window_id, pane_id) {
            (Some(w), Some(p)) => Some(BellContext {
                window_id: w.to_string(),
                pane_id: p.to_string(),
                window_index: None,
                pane_index: None,
                deep_link_url: None,
            }),
            _ => None,
        };
    };

    let pane = pane_id
        .and_then(|id| snapshot.pane(id))
        .or_else(|| window_id.and_then(|id| snapshot.active_pane_in(id)))
        .or_else(|| {
            snapshot
                .active_window()
                .and_then(|w| snapshot.active_pane_in(&w.id))
        })?;
    Some(BellContext {
        window_id: pane.window_id.clone(),
        pane_id: pane.id.clone(),
        window_index: snapshot.window(&pane.window_id).map(|w| w.index),
        pane_index: Some(pane.index),
        deep_link_url: None,
    })
}

/// `<site_url>/targets/<target>/windows/<window>/panes/<pane>`.
pub fn deep_link(site_url: &str, target_id: &str, window_id: &str, pane_id: &str) -> String {
    let seg = |s: &str| utf8_percent_encode(s, SEGMENT).to_string();
    format!(
        "{}/targets/{}/windows/{}/panes/{}",
        site_url.trim_end_matches('/'),
        seg(target_id),
        seg(window_id),
        seg(pane_id)
    )
}
