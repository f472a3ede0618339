//! Restartable request parser for the two RESP request forms.
//!
//! Multi-bulk requests (`*N\r\n$len\r\n...`) and inline requests (a single
//! line with shell-like quoting). Partial input returns `NeedMore` and the
//! parser picks up where it left off on the next read; the cursor only
//! advances past fully consumed elements, and the query buffer is
//! left-trimmed once per processing batch.

use bytes::{Buf, Bytes, BytesMut};
use std::io::Read;

use super::{PROTO_INLINE_MAX_SIZE, PROTO_MAX_MULTIBULK_LEN, PROTO_MBULK_BIG_ARG};

/// Accumulated bytes from the socket plus the parse cursor.
pub struct QueryBuffer {
    buf: BytesMut,
    pos: usize,
    peak: usize,
}

impl QueryBuffer {
    pub fn new() -> QueryBuffer {
        QueryBuffer {
            buf: BytesMut::new(),
            pos: 0,
            peak: 0,
        }
    }

    /// Total buffered bytes, including already-consumed ones.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// High-water mark of the buffer length.
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Unconsumed bytes.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn advance_pos(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.buf.len());
        self.pos += n;
    }

    /// Read up to `limit` bytes from `src`, appending to the buffer.
    pub fn read_from(&mut self, src: &mut impl Read, limit: usize) -> std::io::Result<usize> {
        let start = self.buf.len();
        self.buf.resize(start + limit, 0);
        match src.read(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n);
                self.peak = self.peak.max(self.buf.len());
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    /// Append bytes directly (tests and fake clients).
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.peak = self.peak.max(self.buf.len());
    }

    /// Drop everything before the cursor. Called once per batch after the
    /// outer processing loop, and eagerly before a big bulk body so the
    /// bulk starts at offset zero.
    pub fn trim(&mut self) {
        if self.pos > 0 {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
    }

    fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    /// Take the whole buffer as the backing storage of a bulk argument of
    /// `len` bytes, leaving a fresh buffer sized for the next big bulk.
    /// Only valid when the buffer holds exactly `len + 2` bytes at
    /// offset zero.
    fn adopt(&mut self, len: usize) -> Bytes {
        debug_assert_eq!(self.pos, 0);
        debug_assert_eq!(self.buf.len(), len + 2);
        let whole = std::mem::replace(&mut self.buf, BytesMut::with_capacity(len + 2));
        whole.freeze().slice(..len)
    }

    #[cfg(test)]
    pub fn data_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }
}

impl Default for QueryBuffer {
    fn default() -> Self {
        QueryBuffer::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Inline,
    MultiBulk,
}

/// A protocol violation: `reply` is sent to the client (behind `-ERR `),
/// `log` is the short form for the server log.
#[derive(Debug)]
pub struct ProtocolError {
    pub reply: String,
    pub log: &'static str,
}

impl ProtocolError {
    fn new(reply: impl Into<String>, log: &'static str) -> ProtocolError {
        ProtocolError {
            reply: reply.into(),
            log,
        }
    }
}

#[derive(Debug)]
pub enum Parse {
    /// A complete request is in `argv` (possibly empty for `*0` or a bare
    /// newline).
    Ready,
    /// More bytes are required.
    NeedMore,
    /// Malformed input; reply and close after the reply drains.
    Error(ProtocolError),
}

pub struct RequestParser {
    pub kind: Option<RequestKind>,
    /// Arguments of the parsed request.
    pub argv: Vec<Bytes>,
    /// The last inline request was an empty line (replica keepalive).
    pub inline_empty: bool,
    multibulk_remaining: i64,
    bulk_len: Option<usize>,
    max_bulk_len: usize,
}

impl RequestParser {
    pub fn new(max_bulk_len: usize) -> RequestParser {
        RequestParser {
            kind: None,
            argv: Vec::new(),
            inline_empty: false,
            multibulk_remaining: 0,
            bulk_len: None,
            max_bulk_len,
        }
    }

    /// Forget the current request. Called between commands.
    pub fn reset(&mut self) {
        self.kind = None;
        self.argv.clear();
        self.inline_empty = false;
        self.multibulk_remaining = 0;
        self.bulk_len = None;
    }

    /// If the parser is mid-way through a big bulk body, the number of
    /// bytes still missing. Used to clamp the read size so the body lands
    /// alone in the buffer.
    pub fn big_bulk_remaining(&self, q: &QueryBuffer) -> Option<usize> {
        match (self.kind, self.bulk_len) {
            (Some(RequestKind::MultiBulk), Some(len)) if len >= PROTO_MBULK_BIG_ARG => {
                (len + 2).checked_sub(q.len())
            }
            _ => None,
        }
    }

    pub fn parse(&mut self, q: &mut QueryBuffer) -> Parse {
        if self.kind.is_none() {
            let pending = q.pending();
            if pending.is_empty() {
                return Parse::NeedMore;
            }
            self.kind = Some(if pending[0] == b'*' {
                RequestKind::MultiBulk
            } else {
                RequestKind::Inline
            });
        }
        match self.kind {
            Some(RequestKind::MultiBulk) => self.parse_multibulk(q),
            Some(RequestKind::Inline) => self.parse_inline(q),
            None => unreachable!(),
        }
    }

    fn parse_multibulk(&mut self, q: &mut QueryBuffer) -> Parse {
        if self.multibulk_remaining == 0 {
            debug_assert!(self.argv.is_empty());
            let pending = q.pending();
            let Some(cr) = find_byte(pending, b'\r') else {
                if pending.len() > PROTO_INLINE_MAX_SIZE {
                    return Parse::Error(ProtocolError::new(
                        "Protocol error: too big mbulk count string",
                        "too big mbulk count string",
                    ));
                }
                return Parse::NeedMore;
            };
            if cr + 2 > pending.len() {
                return Parse::NeedMore;
            }
            debug_assert_eq!(pending[0], b'*');
            let count = match parse_i64(&pending[1..cr]) {
                Some(n) if n <= PROTO_MAX_MULTIBULK_LEN => n,
                _ => {
                    return Parse::Error(ProtocolError::new(
                        "Protocol error: invalid multibulk length",
                        "invalid mbulk count",
                    ));
                }
            };
            q.advance_pos(cr + 2);
            if count <= 0 {
                return Parse::Ready;
            }
            self.multibulk_remaining = count;
            self.argv.clear();
            self.argv.reserve(count.min(1024) as usize);
        }

        while self.multibulk_remaining > 0 {
            if self.bulk_len.is_none() {
                let pending = q.pending();
                let Some(cr) = find_byte(pending, b'\r') else {
                    if pending.len() > PROTO_INLINE_MAX_SIZE {
                        return Parse::Error(ProtocolError::new(
                            "Protocol error: too big bulk count string",
                            "too big bulk count string",
                        ));
                    }
                    break;
                };
                if cr + 2 > pending.len() {
                    break;
                }
                if pending[0] != b'$' {
                    return Parse::Error(ProtocolError::new(
                        format!("Protocol error: expected '$', got '{}'", pending[0] as char),
                        "expected $ but got something else",
                    ));
                }
                let len = match parse_i64(&pending[1..cr]) {
                    Some(n) if n >= 0 && n as usize <= self.max_bulk_len => n as usize,
                    _ => {
                        return Parse::Error(ProtocolError::new(
                            "Protocol error: invalid bulk length",
                            "invalid bulk length",
                        ));
                    }
                };
                q.advance_pos(cr + 2);
                if len >= PROTO_MBULK_BIG_ARG && q.pending().len() <= len + 2 {
                    // Make the bulk body start at offset zero so it can be
                    // adopted without a copy once complete.
                    q.trim();
                    q.reserve(len + 2);
                }
                self.bulk_len = Some(len);
            }

            let len = match self.bulk_len {
                Some(len) => len,
                None => break,
            };
            if q.pending().len() < len + 2 {
                break;
            }
            if q.pos() == 0 && len >= PROTO_MBULK_BIG_ARG && q.len() == len + 2 {
                let arg = q.adopt(len);
                self.argv.push(arg);
            } else {
                let pending = q.pending();
                self.argv.push(Bytes::copy_from_slice(&pending[..len]));
                q.advance_pos(len + 2);
            }
            self.bulk_len = None;
            self.multibulk_remaining -= 1;
        }

        if self.multibulk_remaining == 0 {
            Parse::Ready
        } else {
            Parse::NeedMore
        }
    }

    fn parse_inline(&mut self, q: &mut QueryBuffer) -> Parse {
        let pending = q.pending();
        let Some(nl) = find_byte(pending, b'\n') else {
            if pending.len() > PROTO_INLINE_MAX_SIZE {
                return Parse::Error(ProtocolError::new(
                    "Protocol error: too big inline request",
                    "too big inline request",
                ));
            }
            return Parse::NeedMore;
        };
        let line_end = if nl > 0 && pending[nl - 1] == b'\r' {
            nl - 1
        } else {
            nl
        };
        let line = &pending[..line_end];
        let Some(args) = split_inline_args(line) else {
            return Parse::Error(ProtocolError::new(
                "Protocol error: unbalanced quotes in request",
                "unbalanced quotes in inline request",
            ));
        };
        self.inline_empty = line.is_empty();
        self.argv = args
            .into_iter()
            .filter(|a| !a.is_empty())
            .map(Bytes::from)
            .collect();
        q.advance_pos(nl + 1);
        Parse::Ready
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

/// Strict base-10 parse: optional leading '-', digits only, no blanks.
fn parse_i64(s: &[u8]) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    let (neg, digits) = if s[0] == b'-' {
        (true, &s[1..])
    } else {
        (false, s)
    };
    if digits.is_empty() {
        return None;
    }
    let mut v: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        v = v.checked_mul(10)?.checked_add((b - b'0') as i64)?;
    }
    Some(if neg { -v } else { v })
}

fn is_hex_digit(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

/// Split an inline request line into arguments, honoring double quotes
/// (with `\xHH` and the usual escapes), single quotes (literal except
/// `\'`), and whitespace separators. Returns `None` on unbalanced quotes
/// or a quote not followed by a separator.
fn split_inline_args(line: &[u8]) -> Option<Vec<Vec<u8>>> {
    let at = |i: usize| -> u8 {
        if i < line.len() {
            line[i]
        } else {
            0
        }
    };

    let mut args: Vec<Vec<u8>> = Vec::new();
    let mut i = 0usize;
    loop {
        while at(i) != 0 && at(i).is_ascii_whitespace() {
            i += 1;
        }
        if at(i) == 0 {
            return Some(args);
        }
        let mut current = Vec::new();
        let mut inq = false;
        let mut insq = false;
        let mut done = false;
        while !done {
            if inq {
                if at(i) == b'\\'
                    && at(i + 1) == b'x'
                    && is_hex_digit(at(i + 2))
                    && is_hex_digit(at(i + 3))
                {
                    current.push(hex_value(at(i + 2)) * 16 + hex_value(at(i + 3)));
                    i += 3;
                } else if at(i) == b'\\' && at(i + 1) != 0 {
                    i += 1;
                    current.push(match at(i) {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        b'b' => 0x08,
                        b'a' => 0x07,
                        c => c,
                    });
                } else if at(i) == b'"' {
                    // Closing quote must be followed by a separator.
                    if at(i + 1) != 0 && !at(i + 1).is_ascii_whitespace() {
                        return None;
                    }
                    done = true;
                } else if at(i) == 0 {
                    return None;
                } else {
                    current.push(at(i));
                }
            } else if insq {
                if at(i) == b'\\' && at(i + 1) == b'\'' {
                    i += 1;
                    current.push(b'\'');
                } else if at(i) == b'\'' {
                    if at(i + 1) != 0 && !at(i + 1).is_ascii_whitespace() {
                        return None;
                    }
                    done = true;
                } else if at(i) == 0 {
                    return None;
                } else {
                    current.push(at(i));
                }
            } else {
                match at(i) {
                    b' ' | b'\n' | b'\r' | b'\t' | 0 => done = true,
                    b'"' => inq = true,
                    b'\'' => insq = true,
                    c => current.push(c),
                }
            }
            if at(i) != 0 {
                i += 1;
            }
        }
        args.push(current);
    }
}
