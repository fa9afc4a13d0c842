//! Connection matchers.
//!
//! A matcher inspects the bytes buffered so far for a connection and says
//! whether the connection belongs to its protocol. Matchers never perform
//! I/O themselves: when they need more bytes they answer
//! [`Match::Incomplete`] and the multiplexer reads further before asking
//! again. Every decode failure is an ordinary [`Match::No`].

use bytes::Bytes;
use std::ops::Range;
use tracing::trace;

/// The HTTP/2 client connection preface.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
/// SETTINGS_MAX_FRAME_SIZE initial value. A client cannot exceed it before
/// the server has advertised something larger.
const MAX_FRAME_SIZE: usize = 16_384;

const FRAME_HEADERS: u8 = 0x1;
const FRAME_PRIORITY: u8 = 0x2;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_PING: u8 = 0x6;
const FRAME_WINDOW_UPDATE: u8 = 0x8;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// SETTINGS_HEADER_TABLE_SIZE initial value. Size updates above it are
/// decode errors until the server advertises more, which it never does here.
const HEADER_TABLE_SIZE: usize = 4096;

const FLAG_ACK: u8 = 0x1;

/// An empty SETTINGS frame on stream 0: the server half of the preface.
pub const HTTP2_SERVER_SETTINGS: &[u8] = &[0, 0, 0, FRAME_SETTINGS, 0, 0, 0, 0, 0];

/// Longest HTTP/1 request line the [`Http1`] matcher will wait for.
const MAX_REQUEST_LINE: usize = 8 * 1024;

/// Outcome of inspecting a connection's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    Yes,
    No,
    /// More bytes are needed to decide.
    Incomplete,
}

/// A protocol predicate over a connection's leading bytes.
pub trait Matcher: Send + Sync + 'static {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Classify the bytes buffered so far. Must not panic on any input.
    fn matches(&self, buf: &[u8]) -> Match;

    /// Whether this matcher accepts every connection.
    fn is_catch_all(&self) -> bool {
        false
    }

    /// Bytes to write when the client will not go on without hearing from
    /// the server. Asked after [`Match::Incomplete`]; the classifier writes
    /// at most one reply per connection.
    fn reply(&self, _buf: &[u8]) -> Option<&'static [u8]> {
        None
    }

    /// Buffered bytes the client sent in answer to [`Matcher::reply`]. They
    /// are dropped before delivery, since the protocol server never sent
    /// what they answer. `None` means the answer has not arrived yet.
    fn reply_answer(&self, _buf: &[u8]) -> Option<Range<usize>> {
        None
    }
}

/// Matches every connection. Register it last as the default protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct Any;

impl Matcher for Any {
    fn name(&self) -> &str {
        "any"
    }

    fn matches(&self, _buf: &[u8]) -> Match {
        Match::Yes
    }

    fn is_catch_all(&self) -> bool {
        true
    }
}

/// Matches connections starting with any of a set of byte prefixes.
#[derive(Debug, Clone)]
pub struct Prefix {
    name: String,
    prefixes: Vec<Bytes>,
}

impl Prefix {
    pub fn new<I, P>(name: impl Into<String>, prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        Self {
            name: name.into(),
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &Bytes| !p.is_empty())
                .collect(),
        }
    }
}

impl Matcher for Prefix {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, buf: &[u8]) -> Match {
        let mut waiting = false;
        for prefix in &self.prefixes {
            if buf.starts_with(prefix) {
                return Match::Yes;
            }
            if prefix.starts_with(buf) {
                waiting = true;
            }
        }

        if waiting { Match::Incomplete } else { Match::No }
    }
}

/// Matches an HTTP/1.x request line (`METHOD target HTTP/1.x`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Http1;

impl Matcher for Http1 {
    fn name(&self) -> &str {
        "http1"
    }

    fn matches(&self, buf: &[u8]) -> Match {
        let Some(end) = buf.iter().position(|&b| b == b'\n') else {
            // Keep waiting only while what we have could still be a method.
            let plausible = buf.iter().take_while(|&&b| b != b' ').all(is_token_byte);
            return if plausible && buf.len() < MAX_REQUEST_LINE {
                Match::Incomplete
            } else {
                Match::No
            };
        };

        let line = &buf[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let mut parts = line.split(|&b| b == b' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Match::No;
        };

        if !method.is_empty()
            && method.iter().all(is_token_byte)
            && !target.is_empty()
            && version.starts_with(b"HTTP/1.")
        {
            Match::Yes
        } else {
            Match::No
        }
    }
}

fn is_token_byte(b: &u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(b)
}

/// Matches any connection opening with the HTTP/2 client preface.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http2;

impl Matcher for Http2 {
    fn name(&self) -> &str {
        "http2"
    }

    fn matches(&self, buf: &[u8]) -> Match {
        match_preface(buf)
    }
}

fn match_preface(buf: &[u8]) -> Match {
    if buf.len() < HTTP2_PREFACE.len() {
        if HTTP2_PREFACE.starts_with(buf) {
            Match::Incomplete
        } else {
            Match::No
        }
    } else if buf.starts_with(HTTP2_PREFACE) {
        Match::Yes
    } else {
        Match::No
    }
}

/// How [`Http2HeaderField`] compares header values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMatch {
    Exact,
    Prefix,
}

/// Matches an HTTP/2 connection whose first request carries a given header.
///
/// Walks the frames following the preface, skipping connection-level frames
/// until the first HEADERS block (plus any CONTINUATION frames) is complete,
/// then HPACK-decodes it and looks for the field.
///
/// With [`send_settings`](Self::send_settings) it also answers the client's
/// SETTINGS with an empty server SETTINGS frame, for clients that wait for
/// one before sending HEADERS.
#[derive(Debug, Clone)]
pub struct Http2HeaderField {
    name: String,
    field: String,
    value: String,
    mode: ValueMatch,
    send_settings: bool,
}

impl Http2HeaderField {
    pub fn exact(field: &str, value: &str) -> Self {
        Self::new(field, value, ValueMatch::Exact)
    }

    pub fn prefix(field: &str, value: &str) -> Self {
        Self::new(field, value, ValueMatch::Prefix)
    }

    fn new(field: &str, value: &str, mode: ValueMatch) -> Self {
        Self {
            name: format!("http2[{}]", field.to_ascii_lowercase()),
            field: field.to_ascii_lowercase(),
            value: value.to_string(),
            mode,
            send_settings: false,
        }
    }

    /// Reply to the client's SETTINGS while waiting for HEADERS.
    pub fn send_settings(mut self) -> Self {
        self.send_settings = true;
        self
    }

    /// Matches gRPC: `content-type` starting with `application/grpc`, which
    /// also covers `application/grpc+proto` and friends.
    pub fn grpc() -> Self {
        Self {
            name: "grpc".to_string(),
            ..Self::prefix("content-type", "application/grpc")
        }
    }

    fn check_block(&self, block: &[u8]) -> Match {
        // The decoder unwraps truncated size updates instead of failing.
        if !hpack_well_formed(block) {
            trace!(matcher = %self.name, "malformed HPACK block");
            return Match::No;
        }

        let mut decoder = fluke_hpack::Decoder::new();
        decoder.set_max_allowed_table_size(HEADER_TABLE_SIZE);
        let headers = match decoder.decode(block) {
            Ok(headers) => headers,
            Err(e) => {
                trace!(matcher = %self.name, error = ?e, "HPACK decode failed");
                return Match::No;
            }
        };

        let found = headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case(self.field.as_bytes())
                && match self.mode {
                    ValueMatch::Exact => value == self.value.as_bytes(),
                    ValueMatch::Prefix => value.starts_with(self.value.as_bytes()),
                }
        });

        if found { Match::Yes } else { Match::No }
    }
}

impl Matcher for Http2HeaderField {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, buf: &[u8]) -> Match {
        match match_preface(buf) {
            Match::Yes => {}
            other => return other,
        }

        let mut rest = &buf[HTTP2_PREFACE.len()..];
        let mut block: Option<Vec<u8>> = None;

        loop {
            let Some(frame) = FrameHeader::parse(rest) else {
                return Match::Incomplete;
            };
            if frame.length > MAX_FRAME_SIZE {
                return Match::No;
            }
            let total = FRAME_HEADER_LEN + frame.length;
            if rest.len() < total {
                return Match::Incomplete;
            }
            let payload = &rest[FRAME_HEADER_LEN..total];
            rest = &rest[total..];

            match (frame.kind, block.as_mut()) {
                (FRAME_CONTINUATION, Some(pending)) => {
                    pending.extend_from_slice(payload);
                    if frame.flags & FLAG_END_HEADERS != 0 {
                        return self.check_block(pending);
                    }
                }
                // Only CONTINUATION may follow an unfinished header block.
                (_, Some(_)) => return Match::No,
                (FRAME_HEADERS, None) => {
                    let Some(fragment) = header_fragment(frame.flags, payload) else {
                        return Match::No;
                    };
                    if frame.flags & FLAG_END_HEADERS != 0 {
                        return self.check_block(fragment);
                    }
                    block = Some(fragment.to_vec());
                }
                (FRAME_SETTINGS | FRAME_WINDOW_UPDATE | FRAME_PING | FRAME_PRIORITY, None) => {}
                _ => return Match::No,
            }
        }
    }

    fn reply(&self, buf: &[u8]) -> Option<&'static [u8]> {
        let client_settings = frames(buf)
            .any(|(_, frame)| frame.kind == FRAME_SETTINGS && frame.flags & FLAG_ACK == 0);
        (self.send_settings && client_settings).then_some(HTTP2_SERVER_SETTINGS)
    }

    fn reply_answer(&self, buf: &[u8]) -> Option<Range<usize>> {
        frames(buf)
            .find(|(_, frame)| frame.kind == FRAME_SETTINGS && frame.flags & FLAG_ACK != 0)
            .map(|(start, frame)| start..start + FRAME_HEADER_LEN + frame.length)
    }
}

/// Fixed 9-byte HTTP/2 frame header.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    length: usize,
    kind: u8,
    flags: u8,
}

impl FrameHeader {
    fn parse(buf: &[u8]) -> Option<Self> {
        let header = buf.get(..FRAME_HEADER_LEN)?;
        let length =
            (usize::from(header[0]) << 16) | (usize::from(header[1]) << 8) | usize::from(header[2]);
        Some(Self {
            length,
            kind: header[3],
            flags: header[4],
        })
    }
}

/// Complete frames after the preface, with their offsets in `buf`.
fn frames(buf: &[u8]) -> impl Iterator<Item = (usize, FrameHeader)> + '_ {
    let mut offset = HTTP2_PREFACE.len();
    std::iter::from_fn(move || {
        if !buf.starts_with(HTTP2_PREFACE) {
            return None;
        }
        let frame = FrameHeader::parse(buf.get(offset..)?)?;
        let start = offset;
        let end = start + FRAME_HEADER_LEN + frame.length;
        if end > buf.len() {
            return None;
        }
        offset = end;
        Some((start, frame))
    })
}

/// Walk the representations of an HPACK block without decoding them.
///
/// Returns `false` if any integer or string literal is truncated.
fn hpack_well_formed(mut block: &[u8]) -> bool {
    while let Some(&first) = block.first() {
        let used = if first & 0x80 != 0 {
            // Indexed field.
            hpack_integer(block, 7).map(|(_, used)| used)
        } else if first & 0x40 != 0 {
            hpack_literal(block, 6)
        } else if first & 0x20 != 0 {
            // Dynamic table size update.
            hpack_integer(block, 5).map(|(_, used)| used)
        } else {
            hpack_literal(block, 4)
        };

        match used {
            Some(used) => block = &block[used..],
            None => return false,
        }
    }
    true
}

/// Length of a literal field: name index, optional literal name, value.
fn hpack_literal(buf: &[u8], prefix: u8) -> Option<usize> {
    let (index, mut used) = hpack_integer(buf, prefix)?;
    if index == 0 {
        used += hpack_string(buf.get(used..)?)?;
    }
    used += hpack_string(buf.get(used..)?)?;
    Some(used)
}

fn hpack_string(buf: &[u8]) -> Option<usize> {
    let (len, used) = hpack_integer(buf, 7)?;
    let total = used.checked_add(len)?;
    (total <= buf.len()).then_some(total)
}

/// Decode a prefixed integer (RFC 7541 §5.1), at most five octets long.
fn hpack_integer(buf: &[u8], prefix: u8) -> Option<(usize, usize)> {
    let mask = (1u8 << prefix) - 1;
    let mut value = usize::from(buf.first()? & mask);
    if value < usize::from(mask) {
        return Some((value, 1));
    }

    for (i, &b) in buf.iter().enumerate().skip(1).take(4) {
        value += usize::from(b & 0x7f) << (7 * (i - 1));
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Strip padding and priority fields from a HEADERS payload.
fn header_fragment(flags: u8, payload: &[u8]) -> Option<&[u8]> {
    let mut body = payload;
    let mut padding = 0;

    if flags & FLAG_PADDED != 0 {
        let (&pad, tail) = body.split_first()?;
        padding = usize::from(pad);
        body = tail;
    }
    if flags & FLAG_PRIORITY != 0 {
        body = body.get(5..)?;
    }

    body.get(..body.len().checked_sub(padding)?)
}
