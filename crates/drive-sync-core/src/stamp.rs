//! Sync stamp embedded in a note's frontmatter.
//!
//! Text documents carry the instant they were last synchronized as a
//! `lastSync:` line inside the leading `---` block:
//!
//! ```markdown
//! ---
//! lastSync: Tue, 14 Oct 2026 17:21:00 +0000
//! tags: [a, b]
//! ---
//!
//! # Content here
//! ```
//!
//! Only that one line is ever touched; the rest of the frontmatter is kept
//! byte for byte, so user formatting survives a stamp.

use chrono::{DateTime, Utc};

/// Frontmatter key holding the sync stamp.
pub const STAMP_KEY: &str = "lastSync";

const DELIMITER: &str = "---";

/// Format a timestamp the way it is written into documents (RFC 2822).
pub fn format_stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc2822()
}

/// Parse a stamp value.
///
/// Accepts RFC 2822 (what we write), RFC 3339, and the JavaScript
/// `Date.toString()` form (`Tue Oct 14 2026 17:21:00 GMT+0000 (UTC)`).
pub fn parse_stamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc2822(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }

    // Drop the trailing "(Zone Name)" JavaScript appends
    let value = value.split(" (").next().unwrap_or(value);
    DateTime::parse_from_str(value, "%a %b %d %Y %H:%M:%S GMT%z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Byte range of the frontmatter body (between the delimiter lines).
fn header_body(content: &str) -> Option<(usize, usize)> {
    let body_start = if content.starts_with("---\n") {
        4
    } else if content.starts_with("---\r\n") {
        5
    } else {
        return None;
    };

    // Closing --- must be a line of its own
    let mut pos = body_start;
    for line in content[body_start..].split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == DELIMITER {
            return Some((body_start, pos));
        }
        pos += line.len();
    }
    None
}

/// Byte range of the `lastSync:` line (without its line ending).
fn stamp_line(content: &str) -> Option<(usize, usize)> {
    let (start, end) = header_body(content)?;
    let mut pos = start;
    for line in content[start..end].split_inclusive('\n') {
        let bare = line.trim_end_matches(['\r', '\n']);
        if bare
            .strip_prefix(STAMP_KEY)
            .is_some_and(|rest| rest.starts_with(':'))
        {
            return Some((pos, pos + bare.len()));
        }
        pos += line.len();
    }
    None
}

/// Whether the frontmatter carries a sync stamp line.
pub fn has_stamp(content: &str) -> bool {
    stamp_line(content).is_some()
}

/// Extract the sync stamp. `None` when absent or unparseable.
pub fn extract_stamp(content: &str) -> Option<DateTime<Utc>> {
    let (start, end) = stamp_line(content)?;
    let line = &content[start..end];
    parse_stamp(&line[STAMP_KEY.len() + 1..])
}

/// Stamp a document with `ts`.
///
/// - no frontmatter: a new block holding only the stamp is prepended
/// - frontmatter without stamp: the stamp becomes its first line
/// - existing stamp: its value is replaced
pub fn apply_stamp(content: &str, ts: DateTime<Utc>) -> String {
    let line = format!("{}: {}", STAMP_KEY, format_stamp(ts));

    if let Some((start, end)) = stamp_line(content) {
        return format!("{}{}{}", &content[..start], line, &content[end..]);
    }

    match header_body(content) {
        Some((body_start, _)) => {
            format!("{}{}\n{}", &content[..body_start], line, &content[body_start..])
        }
        None => format!("{DELIMITER}\n{line}\n{DELIMITER}\n{content}"),
    }
}

/// Stamp a document only if it carries no stamp yet.
///
/// Returns the new content, or `None` when the document is already stamped.
pub fn ensure_stamp(content: &str, ts: DateTime<Utc>) -> Option<String> {
    if has_stamp(content) {
        None
    } else {
        Some(apply_stamp(content, ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_stamp_roundtrip() {
        let ts = t(17, 21, 5);
        let stamped = apply_stamp("# Hello\n", ts);
        assert_eq!(extract_stamp(&stamped), Some(ts));
    }

    #[test]
    fn test_apply_without_frontmatter_prepends_block() {
        let stamped = apply_stamp("# Hello\n\nBody.", t(8, 0, 0));
        assert_eq!(
            stamped,
            "---\nlastSync: Wed, 14 Oct 2026 08:00:00 +0000\n---\n# Hello\n\nBody."
        );
    }

    #[test]
    fn test_apply_inserts_into_existing_frontmatter() {
        let content = "---\ntitle: Note\ntags: [a]\n---\n\nBody";
        let stamped = apply_stamp(content, t(8, 0, 0));
        assert_eq!(
            stamped,
            "---\nlastSync: Wed, 14 Oct 2026 08:00:00 +0000\ntitle: Note\ntags: [a]\n---\n\nBody"
        );
    }

    #[test]
    fn test_apply_replaces_existing_stamp_only() {
        let content = "---\ntitle: Note\nlastSync: Wed, 14 Oct 2026 08:00:00 +0000\n---\nBody";
        let stamped = apply_stamp(content, t(9, 30, 0));
        assert_eq!(
            stamped,
            "---\ntitle: Note\nlastSync: Wed, 14 Oct 2026 09:30:00 +0000\n---\nBody"
        );
        assert_eq!(extract_stamp(&stamped), Some(t(9, 30, 0)));
    }

    #[test]
    fn test_stamp_in_body_is_ignored() {
        let content = "# Title\n\nlastSync: Wed, 14 Oct 2026 08:00:00 +0000\n";
        assert!(!has_stamp(content));
        assert_eq!(extract_stamp(content), None);
    }

    #[test]
    fn test_unclosed_frontmatter_is_not_a_header() {
        let content = "---\nlastSync: Wed, 14 Oct 2026 08:00:00 +0000\nno closing line";
        assert_eq!(extract_stamp(content), None);
        assert!(!has_stamp(content));
    }

    #[test]
    fn test_ensure_stamp_leaves_stamped_document_alone() {
        let stamped = apply_stamp("body", t(8, 0, 0));
        assert!(ensure_stamp(&stamped, t(10, 0, 0)).is_none());
        assert!(ensure_stamp("body", t(10, 0, 0)).is_some());
    }

    #[test]
    fn test_parse_accepts_javascript_date_string() {
        let parsed =
            parse_stamp("Wed Oct 14 2026 19:21:05 GMT+0200 (Central European Summer Time)");
        assert_eq!(parsed, Some(t(17, 21, 5)));
    }

    #[test]
    fn test_parse_accepts_rfc3339() {
        assert_eq!(parse_stamp("2026-10-14T17:21:05Z"), Some(t(17, 21, 5)));
        assert_eq!(parse_stamp("not a date"), None);
    }

    #[test]
    fn test_crlf_frontmatter() {
        let content = "---\r\ntitle: Note\r\nlastSync: 2026-10-14T17:21:05Z\r\n---\r\nBody";
        assert_eq!(extract_stamp(content), Some(t(17, 21, 5)));
        let restamped = apply_stamp(content, t(18, 0, 0));
        assert!(restamped.contains("lastSync: Wed, 14 Oct 2026 18:00:00 +0000\r\n"));
    }
}
