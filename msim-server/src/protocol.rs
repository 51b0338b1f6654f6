//! Framed text protocol: escaping, unescaped splitting, packet shapes.
//!
//! A packet is one LF-terminated line (an optional preceding CR is stripped).
//! Fields are separated by unescaped `|`; five characters are significant in
//! field content and must be escaped: `\` `|` `,` LF CR. Composite responses
//! (`hist`, `stat`, `list`, `offmsg`, `help`) carry sub-items whose inner `|`
//! and `,` delimiters are part of the grammar and stay unescaped *between*
//! items, while content inside each item is escaped normally — which is why
//! the splitters here work on the raw escaped text and a bounded variant is
//! provided for receivers of composite payloads.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Wire timestamp format: RFC3339 with second precision, UTC.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid packet format")]
    InvalidPacket,
}

/// A decoded control-channel packet: a type plus positional arguments.
///
/// `TYPE|DEST|CONTENT` and `TYPE|field1|field2|…` are the same wire shape;
/// the decoder splits the raw line on unescaped `|` and unescapes each
/// segment, so handlers read one unambiguous positional view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ptype: String,
    pub args: Vec<String>,
}

impl Packet {
    /// Parse one line (with or without its trailing newline).
    pub fn parse(line: &str) -> Result<Packet, ProtocolError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let segments = split_unescaped(line, '|');
        let ptype = unescape(&segments[0]);
        if ptype.is_empty() {
            return Err(ProtocolError::InvalidPacket);
        }

        Ok(Packet {
            ptype,
            args: segments[1..].iter().map(|s| unescape(s)).collect(),
        })
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Escape the five significant characters in field content.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`]. An unknown escape is reproduced literally as `\`
/// followed by the character; a trailing lone backslash is kept.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('|') => out.push('|'),
            Some(',') => out.push(','),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Split on an unescaped delimiter. Escaped characters (and the backslashes
/// introducing them) are carried into the current segment verbatim, so the
/// segments remain escaped text.
pub fn split_unescaped(s: &str, delimiter: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for c in s.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            current.push(c);
            continue;
        }
        if c == delimiter {
            parts.push(std::mem::take(&mut current));
            continue;
        }
        current.push(c);
    }

    parts.push(current);
    parts
}

/// Bounded variant of [`split_unescaped`]: at most `max` segments, with the
/// remainder (delimiters included) left verbatim in the last one. Receivers
/// of composite responses use this to peel the leading fields off a payload
/// whose tail contains unescaped inner delimiters.
pub fn split_unescaped_n(s: &str, delimiter: char, max: usize) -> Vec<String> {
    if max <= 1 {
        return vec![s.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            current.push(c);
            continue;
        }
        if c == delimiter {
            parts.push(std::mem::take(&mut current));
            if parts.len() == max - 1 {
                parts.push(s[i + c.len_utf8()..].to_string());
                return parts;
            }
            continue;
        }
        current.push(c);
    }

    parts.push(current);
    parts
}

/// Format a packet from a type and fields, escaping every field.
pub fn format_packet(ptype: &str, fields: &[&str]) -> String {
    let mut parts = Vec::with_capacity(fields.len() + 1);
    parts.push(escape(ptype));
    for field in fields {
        parts.push(escape(field));
    }
    parts.join("|") + "\n"
}

/// Format a packet whose content is already-assembled composite text with
/// intentionally unescaped inner delimiters.
pub fn format_raw(ptype: &str, raw_content: &str) -> String {
    format!("{}|{}\n", escape(ptype), raw_content)
}

/// Encode one composite sub-item: fields escaped, joined by a literal `|`.
pub fn encode_item(fields: &[&str]) -> String {
    fields.iter().map(|f| escape(f)).collect::<Vec<_>>().join("|")
}

/// Join composite sub-items with a literal `,`.
pub fn join_items(items: &[String]) -> String {
    items.join(",")
}

pub fn format_ts(t: DateTime<Utc>) -> String {
    t.format(TS_FORMAT).to_string()
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_roundtrip() {
        let cases = [
            "plain",
            "pipe|comma,backslash\\",
            "line\nbreaks\rhere",
            "юникод|текст",
            "emoji 🦀, and | more",
            "",
        ];
        for case in cases {
            assert_eq!(unescape(&escape(case)), case, "roundtrip failed for {case:?}");
            assert!(!escape(case).contains('\n'));
        }
    }

    #[test]
    fn unknown_escape_is_lenient() {
        assert_eq!(unescape("\\x"), "\\x");
        assert_eq!(unescape("a\\zb"), "a\\zb");
    }

    #[test]
    fn trailing_backslash_kept() {
        assert_eq!(unescape("abc\\"), "abc\\");
    }

    #[test]
    fn split_respects_escapes() {
        let parts = split_unescaped("msg|bob|a\\|b", '|');
        assert_eq!(parts, vec!["msg", "bob", "a\\|b"]);
    }

    #[test]
    fn split_keeps_empty_segments() {
        assert_eq!(split_unescaped("a||b", '|'), vec!["a", "", "b"]);
        assert_eq!(split_unescaped("", '|'), vec![""]);
    }

    #[test]
    fn bounded_split_leaves_remainder_verbatim() {
        let parts = split_unescaped_n("hist|bob|msg|alice|hi|t|sent,msg|x", '|', 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "hist");
        assert_eq!(parts[1], "bob");
        assert_eq!(parts[2], "msg|alice|hi|t|sent,msg|x");
    }

    #[test]
    fn bounded_split_with_fewer_fields() {
        let parts = split_unescaped_n("stat|", '|', 2);
        assert_eq!(parts, vec!["stat", ""]);
        let parts = split_unescaped_n("pong", '|', 2);
        assert_eq!(parts, vec!["pong"]);
    }

    #[test]
    fn parse_bare_type() {
        let pkt = Packet::parse("ping\n").unwrap();
        assert_eq!(pkt.ptype, "ping");
        assert!(pkt.args.is_empty());
    }

    #[test]
    fn parse_type_with_fields() {
        let pkt = Packet::parse("msg|bob|hello world\n").unwrap();
        assert_eq!(pkt.ptype, "msg");
        assert_eq!(pkt.arg(0), Some("bob"));
        assert_eq!(pkt.arg(1), Some("hello world"));
    }

    #[test]
    fn parse_unescapes_fields() {
        let pkt = Packet::parse("msg|bob|a\\|b\\,c\n").unwrap();
        assert_eq!(pkt.arg(1), Some("a|b,c"));
    }

    #[test]
    fn parse_strips_crlf() {
        let pkt = Packet::parse("ping\r\n").unwrap();
        assert_eq!(pkt.ptype, "ping");
    }

    #[test]
    fn parse_rejects_empty_type() {
        assert_eq!(Packet::parse("|x\n"), Err(ProtocolError::InvalidPacket));
        assert_eq!(Packet::parse("\n"), Err(ProtocolError::InvalidPacket));
    }

    #[test]
    fn format_escapes_fields() {
        let line = format_packet("msg", &["bob", "a|b,c"]);
        assert_eq!(line, "msg|bob|a\\|b\\,c\n");
        let pkt = Packet::parse(&line).unwrap();
        assert_eq!(pkt.arg(1), Some("a|b,c"));
    }

    #[test]
    fn format_raw_keeps_content() {
        let items = join_items(&[
            encode_item(&["alice", "3"]),
            encode_item(&["bo|b", "1"]),
        ]);
        let line = format_raw("offmsg", &items);
        assert_eq!(line, "offmsg|alice|3,bo\\|b|1\n");
    }

    #[test]
    fn timestamp_roundtrip() {
        let t = parse_ts("2026-08-02T10:20:30Z").unwrap();
        assert_eq!(format_ts(t), "2026-08-02T10:20:30Z");
        assert!(parse_ts("not a time").is_none());
    }
}
