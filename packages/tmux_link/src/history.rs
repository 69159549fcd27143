//! Picking which capture becomes a pane's history.

/// Choose between the alternate-screen and scrollback captures.
///
/// A known alternate state decides outright; when the probe did not answer
/// in time, the longer capture wins.
pub fn select_history(
    alternate_on: Option<bool>,
    alternate: Option<Vec<u8>>,
    normal: Option<Vec<u8>>,
) -> Vec<u8> {
    match alternate_on {
        Some(true) => alternate.or(normal).unwrap_or_default(),
        Some(false) => normal.or(alternate).unwrap_or_default(),
        None => {
            let a = alternate.unwrap_or_default();
            let n = normal.unwrap_or_default();
            if a.len() > n.len() { a } else { n }
        }
    }
}

/// Join captured lines the way a terminal expects them.
pub fn join_capture(lines: &[String]) -> Vec<u8> {
    lines.join("\r\n").into_bytes()
}

/// Parse the `#{alternate_on}` probe.
pub fn parse_alternate(lines: &[String]) -> Option<bool> {
    match lines.first().map(|s| s.trim()) {
        Some("1") => Some(true),
        Some("0") => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternate_on_picks_alternate() {
        assert_eq!(
            select_history(Some(true), Some(b"alt".to_vec()), Some(b"normal".to_vec())),
            b"alt"
        );
    }

    #[test]
    fn alternate_off_picks_normal() {
        assert_eq!(
            select_history(Some(false), Some(b"alternate!".to_vec()), Some(b"n".to_vec())),
            b"n"
        );
    }

    #[test]
    fn unknown_picks_longer() {
        assert_eq!(
            select_history(None, Some(b"short".to_vec()), Some(b"much longer".to_vec())),
            b"much longer"
        );
        assert_eq!(
            select_history(None, Some(b"longer alt".to_vec()), None),
            b"longer alt"
        );
    }

    #[test]
    fn missing_capture_falls_back() {
        assert_eq!(select_history(Some(true), None, Some(b"n".to_vec())), b"n");
        assert!(select_history(None, None, None).is_empty());
    }

    #[test]
    fn probe_parsing() {
        assert_eq!(parse_alternate(&["1".to_string()]), Some(true));
        assert_eq!(parse_alternate(&["0".to_string()]), Some(false));
        assert_eq!(parse_alternate(&[]), None);
    }

    #[test]
    fn capture_lines_join_with_crlf() {
        assert_eq!(join_capture(&["a".into(), "b".into()]), b"a\r\nb");
    }
}
