// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Streaming parser and serialiser for the pub/sub wire protocol (RESP).
//!
//! # Framing
//!
//! Client commands arrive as arrays of bulk strings:
//!
//! ```text
//! *3\r\n$7\r\nPUBLISH\r\n$9\r\ntasks/new\r\n$2\r\n{}\r\n
//! ```
//!
//! Old-style inline commands (`PING\r\n`) are a single line. Server pushes
//! reuse the array form but may mix in integers (`:1\r\n`) and simple
//! strings (`+OK\r\n`) as elements.
//!
//! # Transparency contract
//!
//! The proxy must never break a client it does not understand, so the
//! reader distinguishes three outcomes per frame:
//!
//! - a complete, well-formed frame → [`Frame::Command`]
//! - not enough buffered bytes yet → `None` (call [`FrameReader::feed`] again)
//! - bytes that are not valid RESP → [`Frame::Opaque`], forwarded verbatim
//!
//! Malformed input therefore degrades to a transparent TCP relay instead of
//! an error.

use std::fmt;

// ── Parsed frames ─────────────────────────────────────────────────────────────

/// One frame read from a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A parsed command or push: uppercased first word, remaining elements,
    /// and the exact bytes the frame was parsed from.
    Command {
        name: String,
        args: Vec<Vec<u8>>,
        raw: Vec<u8>,
    },
    /// Bytes the parser does not understand. Forward unchanged.
    Opaque(Vec<u8>),
}

impl Frame {
    /// The raw bytes of the frame, whichever variant it is.
    pub fn raw(&self) -> &[u8] {
        match self {
            Frame::Command { raw, .. } => raw,
            Frame::Opaque(raw) => raw,
        }
    }

    /// True for the five channel-addressed pub/sub commands.
    pub fn is_pubsub(&self) -> bool {
        matches!(
            self,
            Frame::Command { name, .. } if matches!(
                name.as_str(),
                "PUBLISH" | "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE"
            )
        )
    }

    /// Argument at `index` as UTF-8, if present and valid.
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        match self {
            Frame::Command { args, .. } => {
                args.get(index).and_then(|a| std::str::from_utf8(a).ok())
            }
            Frame::Opaque(_) => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Command { name, args, .. } => write!(f, "{name}/{}", args.len()),
            Frame::Opaque(raw) => write!(f, "opaque/{}B", raw.len()),
        }
    }
}

// ── Streaming reader ──────────────────────────────────────────────────────────

/// Incremental frame reader. Feed it socket reads, drain complete frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

/// Internal outcome of a single parse attempt against the buffer head.
enum Parsed {
    /// A complete frame consuming `usize` bytes.
    Complete(Frame, usize),
    /// The buffer holds a prefix of a valid frame; wait for more bytes.
    Incomplete,
    /// The buffer head is not RESP at all.
    Invalid,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to take the next complete frame off the front of the buffer.
    ///
    /// Returns `None` when the buffered bytes are a prefix of a frame that
    /// has not fully arrived yet.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.is_empty() {
            return None;
        }
        match parse_one(&self.buf) {
            Parsed::Complete(frame, consumed) => {
                self.buf.drain(..consumed);
                Some(frame)
            }
            Parsed::Incomplete => None,
            Parsed::Invalid => {
                // Not RESP: hand everything buffered so far back verbatim.
                let raw = std::mem::take(&mut self.buf);
                Some(Frame::Opaque(raw))
            }
        }
    }
}

fn parse_one(buf: &[u8]) -> Parsed {
    match buf[0] {
        b'*' => parse_array(buf),
        // Simple replies a client should never send, but an upstream will:
        // +OK, -ERR …, :1, $n bulk. Parse them so the reply relay can frame.
        b'+' | b'-' | b':' => match find_crlf(buf, 0) {
            Some(end) => {
                let raw = buf[..end + 2].to_vec();
                let name = String::from_utf8_lossy(&buf[1..end]).to_string();
                Parsed::Complete(
                    Frame::Command {
                        name,
                        args: Vec::new(),
                        raw,
                    },
                    end + 2,
                )
            }
            None => Parsed::Incomplete,
        },
        b'$' => match parse_bulk(buf, 0) {
            BulkParse::Complete(bytes, consumed) => {
                let raw = buf[..consumed].to_vec();
                Parsed::Complete(
                    Frame::Command {
                        name: String::from_utf8_lossy(&bytes).to_string(),
                        args: Vec::new(),
                        raw,
                    },
                    consumed,
                )
            }
            BulkParse::Incomplete => Parsed::Incomplete,
            BulkParse::Invalid => Parsed::Invalid,
        },
        // Inline command: a bare line such as `PING\r\n`.
        c if c.is_ascii_alphabetic() => match find_crlf(buf, 0) {
            Some(end) => {
                let raw = buf[..end + 2].to_vec();
                let line = String::from_utf8_lossy(&buf[..end]).to_string();
                let mut words = line.split_whitespace();
                let name = match words.next() {
                    Some(w) => w.to_ascii_uppercase(),
                    None => return Parsed::Invalid,
                };
                let args = words.map(|w| w.as_bytes().to_vec()).collect();
                Parsed::Complete(Frame::Command { name, args, raw }, end + 2)
            }
            None => Parsed::Incomplete,
        },
        _ => Parsed::Invalid,
    }
}

fn parse_array(buf: &[u8]) -> Parsed {
    let header_end = match find_crlf(buf, 0) {
        Some(e) => e,
        None => return Parsed::Incomplete,
    };
    let count: usize = match std::str::from_utf8(&buf[1..header_end])
        .ok()
        .and_then(|s| s.parse().ok())
    {
        Some(n) => n,
        None => return Parsed::Invalid,
    };

    let mut pos = header_end + 2;
    let mut elements: Vec<Vec<u8>> = Vec::with_capacity(count);
    for _ in 0..count {
        if pos >= buf.len() {
            return Parsed::Incomplete;
        }
        match buf[pos] {
            b'$' => match parse_bulk(buf, pos) {
                BulkParse::Complete(bytes, consumed) => {
                    elements.push(bytes);
                    pos = consumed;
                }
                BulkParse::Incomplete => return Parsed::Incomplete,
                BulkParse::Invalid => return Parsed::Invalid,
            },
            b':' | b'+' => match find_crlf(buf, pos) {
                Some(end) => {
                    elements.push(buf[pos + 1..end].to_vec());
                    pos = end + 2;
                }
                None => return Parsed::Incomplete,
            },
            _ => return Parsed::Invalid,
        }
    }

    if elements.is_empty() {
        return Parsed::Invalid;
    }
    let name = String::from_utf8_lossy(&elements[0]).to_ascii_uppercase();
    let args = elements.split_off(1);
    Parsed::Complete(
        Frame::Command {
            name,
            args,
            raw: buf[..pos].to_vec(),
        },
        pos,
    )
}

enum BulkParse {
    /// Payload bytes and the absolute offset just past the trailing CRLF.
    Complete(Vec<u8>, usize),
    Incomplete,
    Invalid,
}

/// Parse a `$<len>\r\n<len bytes>\r\n` bulk string starting at `start`.
fn parse_bulk(buf: &[u8], start: usize) -> BulkParse {
    let header_end = match find_crlf(buf, start) {
        Some(e) => e,
        None => return BulkParse::Incomplete,
    };
    let len: i64 = match std::str::from_utf8(&buf[start + 1..header_end])
        .ok()
        .and_then(|s| s.parse().ok())
    {
        Some(n) => n,
        None => return BulkParse::Invalid,
    };
    // $-1 is a null bulk string; it carries no payload bytes.
    if len < 0 {
        return BulkParse::Complete(Vec::new(), header_end + 2);
    }
    let len = len as usize;
    let payload_start = header_end + 2;
    let payload_end = payload_start + len;
    if buf.len() < payload_end + 2 {
        return BulkParse::Incomplete;
    }
    if &buf[payload_end..payload_end + 2] != b"\r\n" {
        return BulkParse::Invalid;
    }
    BulkParse::Complete(buf[payload_start..payload_end].to_vec(), payload_end + 2)
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

// ── Serialisers ───────────────────────────────────────────────────────────────

/// Encode an array of bulk strings (the client-command form).
pub fn encode_array(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + parts.iter().map(|p| p.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        out.extend_from_slice(part);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Encode a `PUBLISH <channel> <payload>` command frame.
pub fn encode_publish(channel: &str, payload: &[u8]) -> Vec<u8> {
    encode_array(&[b"PUBLISH", channel.as_bytes(), payload])
}

/// Encode a `SUBSCRIBE`/`PSUBSCRIBE` command frame.
pub fn encode_subscribe(command: &str, channels: &[&str]) -> Vec<u8> {
    let mut parts: Vec<&[u8]> = Vec::with_capacity(channels.len() + 1);
    parts.push(command.as_bytes());
    parts.extend(channels.iter().map(|c| c.as_bytes()));
    encode_array(&parts)
}

/// Encode the server-originated push a subscriber receives for one
/// publication. Byte-identical to what a native store would emit.
pub fn encode_message(channel: &str, payload: &[u8]) -> Vec<u8> {
    encode_array(&[b"message", channel.as_bytes(), payload])
}

/// Encode a wire-level error reply (`-ERR …\r\n`).
pub fn encode_error(message: &str) -> Vec<u8> {
    format!("-{message}\r\n").into_bytes()
}

/// Encode a simple-string reply (`+PONG\r\n`).
pub fn encode_simple(message: &str) -> Vec<u8> {
    format!("+{message}\r\n").into_bytes()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(bytes: &[u8]) -> Vec<Frame> {
        let mut reader = FrameReader::new();
        reader.feed(bytes);
        let mut frames = Vec::new();
        while let Some(f) = reader.next_frame() {
            frames.push(f);
        }
        frames
    }

    #[test]
    fn parses_publish_array() {
        let frames = read_all(b"*3\r\n$7\r\nPUBLISH\r\n$9\r\ntasks/new\r\n$7\r\n{\"x\":1}\r\n");
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Command { name, args, .. } => {
                assert_eq!(name, "PUBLISH");
                assert_eq!(args[0], b"tasks/new");
                assert_eq!(args[1], b"{\"x\":1}");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn lowercase_command_is_uppercased() {
        let frames = read_all(b"*1\r\n$4\r\nping\r\n");
        assert!(matches!(&frames[0], Frame::Command { name, .. } if name == "PING"));
    }

    #[test]
    fn parses_inline_ping() {
        let frames = read_all(b"PING\r\n");
        assert!(matches!(&frames[0], Frame::Command { name, .. } if name == "PING"));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let full = b"*2\r\n$9\r\nSUBSCRIBE\r\n$10\r\nauth/login\r\n";
        let mut reader = FrameReader::new();
        reader.feed(&full[..15]);
        assert!(reader.next_frame().is_none(), "prefix must not yield a frame");
        reader.feed(&full[15..]);
        let frame = reader.next_frame().expect("complete frame");
        assert!(matches!(frame, Frame::Command { ref name, .. } if name == "SUBSCRIBE"));
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut bytes = encode_publish("a", b"1");
        bytes.extend_from_slice(&encode_publish("b", b"2"));
        let frames = read_all(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].arg_str(0), Some("a"));
        assert_eq!(frames[1].arg_str(0), Some("b"));
    }

    #[test]
    fn garbage_degrades_to_opaque() {
        let frames = read_all(b"\x00\x01not-resp");
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Opaque(raw) if raw.starts_with(b"\x00")));
    }

    #[test]
    fn raw_bytes_survive_round_trip() {
        let bytes = encode_publish("workflow/submit", b"{\"data\":{}}");
        let frames = read_all(&bytes);
        assert_eq!(frames[0].raw(), &bytes[..], "raw frame must be byte-exact");
    }

    #[test]
    fn subscribe_push_with_integer_element() {
        // Upstream confirmation: [subscribe, channel, :1]
        let frames = read_all(b"*3\r\n$9\r\nsubscribe\r\n$9\r\ntasks/new\r\n:1\r\n");
        match &frames[0] {
            Frame::Command { name, args, .. } => {
                assert_eq!(name, "SUBSCRIBE");
                assert_eq!(args[1], b"1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn pubsub_classification() {
        for cmd in ["PUBLISH", "SUBSCRIBE", "PSUBSCRIBE", "UNSUBSCRIBE", "PUNSUBSCRIBE"] {
            let frame = Frame::Command {
                name: cmd.into(),
                args: vec![],
                raw: vec![],
            };
            assert!(frame.is_pubsub(), "{cmd} must classify as pub/sub");
        }
        let other = Frame::Command {
            name: "CLIENT".into(),
            args: vec![],
            raw: vec![],
        };
        assert!(!other.is_pubsub());
    }

    #[test]
    fn message_frame_is_byte_identical_to_native_form() {
        let encoded = encode_message("coord/emergency", b"{\"a\":1}");
        assert_eq!(
            encoded,
            b"*3\r\n$7\r\nmessage\r\n$15\r\ncoord/emergency\r\n$7\r\n{\"a\":1}\r\n"
        );
    }

    #[test]
    fn error_reply_encoding() {
        assert_eq!(
            encode_error("ERR NOAUTH Permission denied"),
            b"-ERR NOAUTH Permission denied\r\n"
        );
    }

    #[test]
    fn null_bulk_parses_as_empty() {
        let frames = read_all(b"$-1\r\n");
        assert!(matches!(&frames[0], Frame::Command { name, .. } if name.is_empty()));
    }
}
