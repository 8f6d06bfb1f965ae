//! The cache text/meta protocol response grammar.
//!
//! This module only classifies and measures one response header at a time; it
//! never touches the request queue or the backend's lifecycle. Given a prefix
//! of bytes it either says "not enough bytes yet", "here's what this response
//! looks like", or "this isn't a response we understand".

/// The literal bytes every GET value (hit or miss) is terminated by.
pub const END_LITERAL: &[u8] = b"END\r\n";
/// The fixed width of the END literal.
pub const ENDLEN: usize = END_LITERAL.len();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// `VALUE <key> <flags> <bytes>\r\n<data>\r\n`, always followed by a
    /// trailing `END\r\n` literal that the state machine reads separately.
    Get,
    /// The bare `END\r\n` miss/multiget-terminator line.
    End,
    /// A meta-protocol line: either self-contained (`HD`, `EN`, `NF`, ...) or
    /// value-bearing (`VA <bytes> ...\r\n<data>\r\n`), but never followed by
    /// a separate END literal the way GET is.
    Meta,
    /// A single-line ascii reply with no payload (`STORED`, `NOT_FOUND`,
    /// `VERSION ...`, `ERROR`, ...).
    Generic,
    /// A bare number line, e.g. the reply to `incr`/`decr`.
    Numeric,
}

/// A fully recognized response header: how many bytes make up the header line
/// itself, and how many value bytes (if any) follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub kind: ResponseKind,
    /// Bytes consumed by the header line, including its own trailing `\r\n`.
    pub header_len: usize,
    /// Value bytes following the header, including their own trailing `\r\n`
    /// when present. Zero for Generic/Numeric/End and for meta replies with
    /// no `VA` payload.
    pub value_len: usize,
}

impl ParsedHeader {
    /// True only for GET: the only kind followed by a separate `END\r\n` literal.
    pub fn needs_end_literal(&self) -> bool {
        self.kind == ResponseKind::Get
    }
}

pub enum ParseOutcome {
    /// The buffer doesn't contain a full header line yet; arm another read.
    NeedMore,
    Parsed(ParsedHeader),
    /// The line doesn't match any recognized response grammar (`unhandledres`
    /// if the line is well-formed text we simply don't recognize, or a
    /// structural error for `parsing`). Callers decide which.
    Error,
}

/// Finds the first "\r\n" in buf, returning the index of the '\r'.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    let mut start = 0;
    loop {
        let rel = memchr::memchr(b'\r', &buf[start..])?;
        let pos = start + rel;
        if buf.get(pos + 1) == Some(&b'\n') {
            return Some(pos);
        }
        start = pos + 1;
    }
}

/// Parses one response header from the front of `buf`. Never consumes value
/// bytes itself; the caller owns copying those.
pub fn parse_response_header(buf: &[u8]) -> ParseOutcome {
    let nl = match find_crlf(buf) {
        Some(pos) => pos,
        None => {
            // Cap unreasonably long header lines so garbage input can't grow
            // the read buffer forever looking for a \r\n that will never come.
            if buf.len() > 8192 {
                return ParseOutcome::Error;
            }
            return ParseOutcome::NeedMore;
        }
    };
    let header_len = nl + 2;
    let line = &buf[..nl];

    if line == b"END" {
        return ParseOutcome::Parsed(ParsedHeader { kind: ResponseKind::End, header_len, value_len: 0 });
    }

    let mut words = line.split(|&b| b == b' ').filter(|w| !w.is_empty());
    let first = match words.next() {
        Some(w) => w,
        None => return ParseOutcome::Error,
    };

    if first == b"VALUE" {
        let bytes_field = match words.last() {
            Some(w) => w,
            None => return ParseOutcome::Error,
        };
        return match parse_usize(bytes_field) {
            Some(n) => ParseOutcome::Parsed(ParsedHeader { kind: ResponseKind::Get, header_len, value_len: n + 2 }),
            None => ParseOutcome::Error,
        };
    }

    if first == b"VA" {
        let len_field = match words.next() {
            Some(w) => w,
            None => return ParseOutcome::Error,
        };
        return match parse_usize(len_field) {
            Some(n) => ParseOutcome::Parsed(ParsedHeader { kind: ResponseKind::Meta, header_len, value_len: n + 2 }),
            None => ParseOutcome::Error,
        };
    }

    if is_meta_tag(first) {
        return ParseOutcome::Parsed(ParsedHeader { kind: ResponseKind::Meta, header_len, value_len: 0 });
    }

    if parse_usize(first).is_some() && words.next().is_none() {
        return ParseOutcome::Parsed(ParsedHeader { kind: ResponseKind::Numeric, header_len, value_len: 0 });
    }

    if is_generic_tag(first) {
        return ParseOutcome::Parsed(ParsedHeader { kind: ResponseKind::Generic, header_len, value_len: 0 });
    }

    ParseOutcome::Error
}

fn parse_usize(field: &[u8]) -> Option<usize> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(field).ok()?.parse().ok()
}

fn is_meta_tag(word: &[u8]) -> bool {
    matches!(word, b"HD" | b"EN" | b"NF" | b"NS" | b"EX" | b"MN")
}

fn is_generic_tag(word: &[u8]) -> bool {
    matches!(
        word,
        b"STORED" | b"NOT_STORED" | b"EXISTS" | b"NOT_FOUND" | b"DELETED" | b"TOUCHED"
            | b"OK" | b"ERROR" | b"CLIENT_ERROR" | b"SERVER_ERROR" | b"VERSION"
    )
}

/// True if a fully-assembled response buffer is a VERSION reply, i.e. the
/// validation handshake succeeded.
pub fn is_version_reply(buf: &[u8]) -> bool {
    buf.starts_with(b"VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_hit_header() {
        let buf = b"VALUE k 0 5\r\nhello\r\nEND\r\n";
        match parse_response_header(buf) {
            ParseOutcome::Parsed(h) => {
                assert_eq!(h.kind, ResponseKind::Get);
                assert_eq!(h.header_len, 13);
                assert_eq!(h.value_len, 7); // 5 bytes of data + trailing \r\n
                assert!(h.needs_end_literal());
            }
            _ => panic!("expected Parsed"),
        }
    }

    #[test]
    fn parses_bare_end_as_miss() {
        match parse_response_header(b"END\r\n") {
            ParseOutcome::Parsed(h) => {
                assert_eq!(h.kind, ResponseKind::End);
                assert_eq!(h.header_len, 5);
                assert_eq!(h.value_len, 0);
            }
            _ => panic!("expected Parsed"),
        }
    }

    #[test]
    fn parses_generic_stored() {
        match parse_response_header(b"STORED\r\n") {
            ParseOutcome::Parsed(h) => assert_eq!(h.kind, ResponseKind::Generic),
            _ => panic!("expected Parsed"),
        }
    }

    #[test]
    fn parses_version_reply() {
        let buf = b"VERSION 1.6.9\r\n";
        match parse_response_header(buf) {
            ParseOutcome::Parsed(h) => {
                assert_eq!(h.kind, ResponseKind::Generic);
                assert!(is_version_reply(buf));
            }
            _ => panic!("expected Parsed"),
        }
    }

    #[test]
    fn parses_numeric_reply() {
        match parse_response_header(b"42\r\n") {
            ParseOutcome::Parsed(h) => assert_eq!(h.kind, ResponseKind::Numeric),
            _ => panic!("expected Parsed"),
        }
    }

    #[test]
    fn needs_more_without_crlf() {
        assert!(matches!(parse_response_header(b"VALUE k 0 5"), ParseOutcome::NeedMore));
    }

    #[test]
    fn rejects_unrecognized_line() {
        assert!(matches!(parse_response_header(b"GARBAGE\r\n"), ParseOutcome::Error));
    }
}
