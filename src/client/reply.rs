//! Reply storage and the typed reply formatters.
//!
//! Three tiers of storage per client: a fixed inline buffer, a FIFO of
//! owned spill blocks, and a growable scratch buffer used only when the
//! reply is being formulated from a thread that does not own the client.
//! The scratch contents are later spliced into the real reply queue on
//! the owner thread.
//!
//! Every formatter goes through [`ReplyWriter`], which decides sync vs
//! async placement, performs the prepare-to-write bookkeeping, and emits
//! RESP2 or RESP3 framing depending on the client's negotiated version.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::client::{Client, ClientState, ClientType};
use crate::protocol::{shared, CRLF, PROTO_REPLY_CHUNK_BYTES, SHARED_BULKHDR_LEN};
use crate::server::Server;

use tracing::warn;

/// Capacity of the fixed inline reply buffer.
pub const REPLY_INLINE_CAP: usize = 16 * 1024;

/// One owned block of reply bytes. `size` is the allocated capacity,
/// `used` the filled prefix.
pub struct ReplyBlock {
    data: Vec<u8>,
}

impl ReplyBlock {
    /// Block for a payload, allocated at least a chunk large so small
    /// writes keep landing in the same tail block.
    fn for_payload(bytes: &[u8]) -> ReplyBlock {
        let mut data = Vec::with_capacity(bytes.len().max(PROTO_REPLY_CHUNK_BYTES));
        data.extend_from_slice(bytes);
        ReplyBlock { data }
    }

    /// Block sized exactly to its contents (deferred fills, async splice).
    pub fn exact(bytes: &[u8]) -> ReplyBlock {
        ReplyBlock {
            data: bytes.to_vec(),
        }
    }

    fn empty() -> ReplyBlock {
        ReplyBlock { data: Vec::new() }
    }

    pub fn size(&self) -> usize {
        self.data.capacity()
    }

    pub fn used(&self) -> usize {
        self.data.len()
    }

    fn slack(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn extend(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.slack());
        self.data.extend_from_slice(bytes);
    }

    fn prepend(&mut self, bytes: &[u8]) {
        self.data.splice(0..0, bytes.iter().copied());
    }
}

/// The three reply tiers of one client.
pub struct ReplySurface {
    pub buf: Box<[u8; REPLY_INLINE_CAP]>,
    pub bufpos: usize,
    /// Bytes of the current head (inline or first block) already written
    /// to the socket.
    pub sentlen: usize,
    /// Spill FIFO. `None` entries are deferred-length placeholders that
    /// must be filled before control returns to the event loop.
    pub blocks: VecDeque<Option<ReplyBlock>>,
    /// Sum of allocated block capacities.
    pub reply_bytes: usize,
    /// Off-thread scratch buffer; drained by the async-write integrator.
    pub scratch: Vec<u8>,
}

impl ReplySurface {
    pub fn new() -> ReplySurface {
        ReplySurface {
            buf: Box::new([0u8; REPLY_INLINE_CAP]),
            bufpos: 0,
            sentlen: 0,
            blocks: VecDeque::new(),
            reply_bytes: 0,
            scratch: Vec::new(),
        }
    }

    /// Try to fit `bytes` into the inline buffer. Refused once the spill
    /// list is non-empty, so the wire order stays buffer-then-blocks.
    fn try_buffer(&mut self, bytes: &[u8]) -> bool {
        if !self.blocks.is_empty() {
            return false;
        }
        let available = REPLY_INLINE_CAP - self.bufpos;
        if bytes.len() > available {
            return false;
        }
        self.buf[self.bufpos..self.bufpos + bytes.len()].copy_from_slice(bytes);
        self.bufpos += bytes.len();
        true
    }

    /// Append to the spill list: fill the tail block's slack, then open a
    /// new block for the remainder.
    fn push_to_list(&mut self, mut bytes: &[u8]) {
        if let Some(Some(tail)) = self.blocks.back_mut() {
            let copy = tail.slack().min(bytes.len());
            if copy > 0 {
                tail.extend(&bytes[..copy]);
                bytes = &bytes[copy..];
            }
        }
        if !bytes.is_empty() {
            let block = ReplyBlock::for_payload(bytes);
            self.reply_bytes += block.size();
            self.blocks.push_back(Some(block));
        }
    }

    fn append_scratch(&mut self, bytes: &[u8]) {
        self.scratch.extend_from_slice(bytes);
    }

    /// Take the scratch buffer, leaving an empty one behind.
    pub fn take_scratch(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.scratch)
    }

    pub fn push_block(&mut self, block: ReplyBlock) {
        self.reply_bytes += block.size();
        self.blocks.push_back(Some(block));
    }

    fn add_deferred_node(&mut self) -> usize {
        self.blocks.push_back(None);
        self.blocks.len() - 1
    }

    /// Fill a deferred placeholder. When the following block has room and
    /// is not yet oversized, the header is prepended there and the
    /// placeholder degenerates to an empty block, saving a write(2) for
    /// the extra node later.
    fn set_deferred_node(&mut self, idx: usize, header: &[u8]) {
        debug_assert!(self.blocks[idx].is_none());
        let merge = matches!(
            self.blocks.get(idx + 1),
            Some(Some(next))
                if next.slack() >= header.len()
                    && next.used() < PROTO_REPLY_CHUNK_BYTES * 4
        );
        if merge {
            if let Some(Some(next)) = self.blocks.get_mut(idx + 1) {
                next.prepend(header);
            }
            self.blocks[idx] = Some(ReplyBlock::empty());
        } else {
            let block = ReplyBlock::exact(header);
            self.reply_bytes += block.size();
            self.blocks[idx] = Some(block);
        }
    }

    fn insert_scratch(&mut self, offset: usize, header: &[u8]) {
        debug_assert!(offset <= self.scratch.len());
        self.scratch.splice(offset..offset, header.iter().copied());
    }

    /// Bytes held on behalf of this client, for output-limit checks.
    pub fn memory_used(&self) -> usize {
        self.reply_bytes + self.scratch.capacity()
    }

    /// Move all buffered output of `src` to the end of `self`, clearing
    /// `src`.
    pub fn absorb(&mut self, src: &mut ReplySurface) {
        let inline: Vec<u8> = src.buf[..src.bufpos].to_vec();
        if !self.try_buffer(&inline) {
            self.push_to_list(&inline);
        }
        while let Some(entry) = src.blocks.pop_front() {
            if let Some(block) = entry {
                self.reply_bytes += block.size();
                self.blocks.push_back(Some(block));
            }
        }
        src.reply_bytes = 0;
        src.bufpos = 0;
    }

    #[cfg(test)]
    pub fn flatten(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.buf[..self.bufpos]);
        for entry in &self.blocks {
            if let Some(block) = entry {
                out.extend_from_slice(block.bytes());
            }
        }
        out
    }
}

impl Default for ReplySurface {
    fn default() -> Self {
        ReplySurface::new()
    }
}

/// Handle returned by [`ReplyWriter::deferred_len`].
#[derive(Debug, Clone, Copy)]
pub enum DeferredLen {
    /// Placeholder node in the spill list (sync path).
    Node(usize),
    /// Byte offset into the scratch buffer (async path).
    Scratch(usize),
    /// The client is not accepting output.
    Refused,
}

/// Typed reply formatters writing into one client's reply surface.
///
/// Created with `is_async = true` when the caller may be off the owner
/// thread; the flag is downgraded automatically when the calling thread
/// owns the client, so the sync fast path is taken whenever legal.
pub struct ReplyWriter<'a> {
    srv: &'a Server,
    client: &'a Arc<Client>,
    state: &'a mut ClientState,
    is_async: bool,
}

impl<'a> ReplyWriter<'a> {
    pub fn new(
        srv: &'a Server,
        client: &'a Arc<Client>,
        state: &'a mut ClientState,
        is_async: bool,
    ) -> ReplyWriter<'a> {
        let is_async = is_async && crate::server::current_iel() != Some(client.iel);
        ReplyWriter {
            srv,
            client,
            state,
            is_async,
        }
    }

    pub fn resp(&self) -> u8 {
        self.state.resp
    }

    /// The prepare-to-write contract: decide whether this client accepts
    /// output, and queue it for flushing on the first byte.
    fn prepare(&mut self) -> bool {
        let flags = &self.state.flags;
        if flags.force_reply {
            return true;
        }
        if flags.scripting || flags.module {
            return true;
        }
        if flags.reply_off || flags.reply_skip {
            return false;
        }
        if flags.master && !flags.master_force_reply {
            return false;
        }
        if self.state.is_fake() {
            return false;
        }

        if !self.is_async {
            if !self.state.has_pending_replies() && !self.state.flags.pending_write {
                self.state.flags.pending_write = true;
                self.srv.slot(self.client.iel).push_pending_write(Arc::clone(self.client));
            }
        } else if !self.state.flags.pending_async_write {
            self.state.flags.pending_async_write = true;
            self.srv.queue_pending_async(Arc::clone(self.client));
        }
        true
    }

    /// Append raw protocol bytes, already framed.
    pub fn raw(&mut self, bytes: &[u8]) {
        if !self.prepare() {
            return;
        }
        self.append(bytes);
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.state.flags.close_after_reply {
            return;
        }
        if self.is_async {
            self.state.reply.append_scratch(bytes);
            return;
        }
        if !self.state.reply.try_buffer(bytes) {
            self.state.reply.push_to_list(bytes);
            self.check_output_limits();
        }
    }

    /// Status line: `+<s>\r\n`.
    pub fn status(&mut self, s: &str) {
        self.raw(b"+");
        self.raw(s.as_bytes());
        self.raw(CRLF);
    }

    /// Error line. A leading `-` means the caller chose the error code;
    /// otherwise `-ERR ` is prepended. Replica/master errors are logged
    /// since they usually indicate a bug on one of the two sides.
    pub fn error(&mut self, msg: &str) {
        let msg: String = msg
            .chars()
            .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
            .collect();
        if !msg.starts_with('-') {
            self.raw(b"-ERR ");
        }
        self.raw(msg.as_bytes());
        self.raw(CRLF);

        let flags = &self.state.flags;
        if (flags.master || flags.replica) && !flags.monitor {
            let (from, to) = if flags.master {
                ("replica", "master")
            } else {
                ("master", "replica")
            };
            warn!(
                error = %msg,
                command = self.state.last_cmd.as_deref().unwrap_or("<unknown>"),
                "== CRITICAL == this {from} is sending an error to its {to}"
            );
        }
    }

    /// Integer reply: `:<n>\r\n`.
    pub fn integer(&mut self, n: i64) {
        self.prefixed_len(b':', n);
    }

    /// `<prefix><n>\r\n`, reusing the shared header constants for the
    /// common small aggregate and bulk headers.
    fn prefixed_len(&mut self, prefix: u8, n: i64) {
        if (0..SHARED_BULKHDR_LEN).contains(&n) {
            if prefix == b'*' {
                let hdr = shared().mbulk(n).clone();
                self.raw(&hdr);
                return;
            } else if prefix == b'$' {
                let hdr = shared().bulk(n).clone();
                self.raw(&hdr);
                return;
            }
        }
        let mut line = Vec::with_capacity(24);
        line.push(prefix);
        line.extend_from_slice(n.to_string().as_bytes());
        line.extend_from_slice(CRLF);
        self.raw(&line);
    }

    fn aggregate_len(&mut self, len: i64, prefix: u8) {
        self.prefixed_len(prefix, len);
    }

    pub fn array_len(&mut self, len: i64) {
        self.aggregate_len(len, b'*');
    }

    /// Maps are native in RESP3; RESP2 sees a flat array of doubled
    /// length.
    pub fn map_len(&mut self, len: i64) {
        if self.state.resp == 2 {
            self.aggregate_len(len * 2, b'*');
        } else {
            self.aggregate_len(len, b'%');
        }
    }

    pub fn set_len(&mut self, len: i64) {
        let prefix = if self.state.resp == 2 { b'*' } else { b'~' };
        self.aggregate_len(len, prefix);
    }

    pub fn attribute_len(&mut self, len: i64) {
        if self.state.resp == 2 {
            self.aggregate_len(len * 2, b'*');
        } else {
            self.aggregate_len(len, b'|');
        }
    }

    pub fn push_len(&mut self, len: i64) {
        let prefix = if self.state.resp == 2 { b'*' } else { b'>' };
        self.aggregate_len(len, prefix);
    }

    pub fn null(&mut self) {
        if self.state.resp == 2 {
            self.raw(b"$-1\r\n");
        } else {
            self.raw(b"_\r\n");
        }
    }

    pub fn null_array(&mut self) {
        if self.state.resp == 2 {
            self.raw(b"*-1\r\n");
        } else {
            self.raw(b"_\r\n");
        }
    }

    pub fn bool_reply(&mut self, b: bool) {
        if self.state.resp == 2 {
            self.raw(if b { b":1\r\n" } else { b":0\r\n" });
        } else {
            self.raw(if b { b"#t\r\n" } else { b"#f\r\n" });
        }
    }

    pub fn double(&mut self, d: f64) {
        if d.is_infinite() {
            if self.state.resp == 2 {
                self.bulk(if d > 0.0 { b"inf" } else { b"-inf" });
            } else {
                self.raw(if d > 0.0 { b",inf\r\n" } else { b",-inf\r\n" });
            }
            return;
        }
        let s = format_double(d);
        if self.state.resp == 2 {
            self.bulk(s.as_bytes());
        } else {
            let line = format!(",{s}\r\n");
            self.raw(line.as_bytes());
        }
    }

    /// Human-readable double: fixed notation with trailing zeros trimmed.
    pub fn human_double(&mut self, d: f64) {
        let s = format_human_double(d);
        if self.state.resp == 2 {
            self.bulk(s.as_bytes());
        } else {
            let line = format!(",{s}\r\n");
            self.raw(line.as_bytes());
        }
    }

    /// Bulk string from a byte range: `$<len>\r\n<bytes>\r\n`.
    pub fn bulk(&mut self, bytes: &[u8]) {
        self.prefixed_len(b'$', bytes.len() as i64);
        self.raw(bytes);
        self.raw(CRLF);
    }

    pub fn bulk_string(&mut self, s: &str) {
        self.bulk(s.as_bytes());
    }

    /// Bulk string or protocol-appropriate null.
    pub fn bulk_opt(&mut self, bytes: Option<&[u8]>) {
        match bytes {
            Some(b) => self.bulk(b),
            None => self.null(),
        }
    }

    pub fn bulk_integer(&mut self, n: i64) {
        self.bulk(n.to_string().as_bytes());
    }

    /// Verbatim string with a three-character type tag. RESP2 has no
    /// native form and falls back to a bulk string.
    pub fn verbatim(&mut self, s: &[u8], ext: &str) {
        if self.state.resp == 2 {
            self.bulk(s);
            return;
        }
        let mut tag = [b' '; 3];
        for (i, b) in ext.bytes().take(3).enumerate() {
            tag[i] = b;
        }
        let mut header = format!("={}\r\n", s.len() + 4).into_bytes();
        header.extend_from_slice(&tag);
        header.push(b':');
        self.raw(&header);
        self.raw(s);
        self.raw(CRLF);
    }

    /// Allocate a deferred aggregate-length placeholder; filled later by
    /// one of the `set_deferred_*` calls once the element count is known.
    pub fn deferred_len(&mut self) -> DeferredLen {
        if !self.prepare() {
            return DeferredLen::Refused;
        }
        if self.is_async {
            DeferredLen::Scratch(self.state.reply.scratch.len())
        } else {
            DeferredLen::Node(self.state.reply.add_deferred_node())
        }
    }

    fn set_deferred(&mut self, d: DeferredLen, prefix: u8, len: i64) {
        let header = {
            let mut h = Vec::with_capacity(24);
            h.push(prefix);
            h.extend_from_slice(len.to_string().as_bytes());
            h.extend_from_slice(CRLF);
            h
        };
        match d {
            DeferredLen::Refused => {}
            DeferredLen::Node(idx) => {
                self.state.reply.set_deferred_node(idx, &header);
                self.check_output_limits();
            }
            DeferredLen::Scratch(offset) => {
                self.state.reply.insert_scratch(offset, &header);
            }
        }
    }

    pub fn set_deferred_array_len(&mut self, d: DeferredLen, len: i64) {
        self.set_deferred(d, b'*', len);
    }

    pub fn set_deferred_map_len(&mut self, d: DeferredLen, len: i64) {
        if self.state.resp == 2 {
            self.set_deferred(d, b'*', len * 2);
        } else {
            self.set_deferred(d, b'%', len);
        }
    }

    pub fn set_deferred_set_len(&mut self, d: DeferredLen, len: i64) {
        let prefix = if self.state.resp == 2 { b'*' } else { b'~' };
        self.set_deferred(d, prefix, len);
    }

    pub fn set_deferred_attribute_len(&mut self, d: DeferredLen, len: i64) {
        if self.state.resp == 2 {
            self.set_deferred(d, b'*', len * 2);
        } else {
            self.set_deferred(d, b'|', len);
        }
    }

    pub fn set_deferred_push_len(&mut self, d: DeferredLen, len: i64) {
        let prefix = if self.state.resp == 2 { b'*' } else { b'>' };
        self.set_deferred(d, prefix, len);
    }

    /// Array of status lines for a HELP subcommand, with a computed
    /// heading.
    pub fn help(&mut self, command: &str, lines: &[&str]) {
        let d = self.deferred_len();
        let heading = format!(
            "{} <subcommand> arg arg ... arg. Subcommands are:",
            command.to_ascii_uppercase()
        );
        self.status(&heading);
        for line in lines {
            self.status(line);
        }
        self.set_deferred_array_len(d, lines.len() as i64 + 1);
    }

    pub fn subcommand_syntax_error(&mut self, command: &str, subcommand: &str) {
        let msg = format!(
            "Unknown subcommand or wrong number of arguments for '{}'. Try {} HELP.",
            subcommand,
            command.to_ascii_uppercase()
        );
        self.error(&msg);
    }

    /// Move another client's buffered output into this reply, clearing
    /// the source.
    pub fn splice_from(&mut self, src: &mut ReplySurface) {
        if !self.prepare() {
            return;
        }
        if self.is_async {
            let inline: Vec<u8> = src.buf[..src.bufpos].to_vec();
            self.state.reply.append_scratch(&inline);
            while let Some(Some(block)) = src.blocks.pop_front() {
                self.state.reply.append_scratch(block.bytes());
            }
            src.bufpos = 0;
            src.reply_bytes = 0;
            return;
        }
        self.state.reply.absorb(src);
        self.check_output_limits();
    }

    fn check_output_limits(&mut self) {
        enforce_output_limits(self.srv, self.client.id, self.state);
    }
}

/// Flag the client for asynchronous close once the configured output
/// buffer limits are exceeded. The current reply is left intact; the
/// owner thread performs the actual teardown.
pub(crate) fn enforce_output_limits(srv: &Server, client_id: u64, st: &mut ClientState) {
    if st.is_fake() || st.flags.close_asap || st.reply.reply_bytes == 0 {
        return;
    }
    let mut class = st.flags.client_type();
    if class == ClientType::Master {
        class = ClientType::Normal;
    }
    let limits = srv.config.obuf_limit(class);
    let used = st.reply.memory_used();

    let mut over = limits.hard_bytes != 0 && used >= limits.hard_bytes;
    if !over && limits.soft_bytes != 0 && used >= limits.soft_bytes {
        let now = Instant::now();
        match st.obuf_soft_limit_start {
            None => st.obuf_soft_limit_start = Some(now),
            Some(start) => {
                if now.duration_since(start).as_secs() > limits.soft_seconds {
                    over = true;
                }
            }
        }
    } else if !over {
        st.obuf_soft_limit_start = None;
    }

    if over {
        st.flags.close_asap = true;
        warn!(
            client = client_id,
            used_bytes = used,
            "client scheduled to be closed ASAP for overcoming of output buffer limits"
        );
    }
}

fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d == d.trunc() && d.abs() < 1e17 {
        format!("{}", d as i64)
    } else {
        format!("{d}")
    }
}

fn format_human_double(d: f64) -> String {
    let mut s = format!("{d:.17}");
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::Server;
    use std::time::Instant;

    fn test_client(resp: u8) -> (Arc<Server>, Arc<Client>) {
        let srv = Server::new(Config::for_tests());
        let client = Arc::new(Client::new(1, 0, 5, false, Instant::now()));
        client.lock().resp = resp;
        (srv, client)
    }

    #[test]
    fn status_and_error_framing() {
        let (srv, client) = test_client(2);
        let mut st = client.lock();
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        w.status("PONG");
        w.error("something went wrong");
        w.error("-WRONGTYPE bad");
        drop(w);
        assert_eq!(
            st.reply.flatten(),
            b"+PONG\r\n-ERR something went wrong\r\n-WRONGTYPE bad\r\n"
        );
    }

    #[test]
    fn protocol_version_branch() {
        for (resp, null, truth, map) in [
            (2u8, &b"$-1\r\n"[..], &b":1\r\n"[..], &b"*4\r\n"[..]),
            (3u8, &b"_\r\n"[..], &b"#t\r\n"[..], &b"%2\r\n"[..]),
        ] {
            let (srv, client) = test_client(resp);
            let mut st = client.lock();
            let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
            w.null();
            w.bool_reply(true);
            w.map_len(2);
            drop(w);
            let mut expect = Vec::new();
            expect.extend_from_slice(null);
            expect.extend_from_slice(truth);
            expect.extend_from_slice(map);
            assert_eq!(st.reply.flatten(), expect);
        }
    }

    #[test]
    fn double_forms() {
        let (srv, client) = test_client(3);
        let mut st = client.lock();
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        w.double(1.5);
        w.double(f64::INFINITY);
        w.double(f64::NEG_INFINITY);
        w.double(3.0);
        drop(w);
        assert_eq!(st.reply.flatten(), b",1.5\r\n,inf\r\n,-inf\r\n,3\r\n");
    }

    #[test]
    fn verbatim_v3_header() {
        let (srv, client) = test_client(3);
        let mut st = client.lock();
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        w.verbatim(b"some text", "txt");
        drop(w);
        assert_eq!(st.reply.flatten(), b"=13\r\ntxt:some text\r\n");
    }

    #[test]
    fn inline_then_spill() {
        let (srv, client) = test_client(2);
        let mut st = client.lock();
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        let chunk = vec![b'a'; REPLY_INLINE_CAP - 10];
        w.raw(&chunk);
        w.raw(&chunk); // does not fit inline anymore
        w.raw(b"tail");
        drop(w);
        assert_eq!(st.reply.bufpos, REPLY_INLINE_CAP - 10);
        assert!(!st.reply.blocks.is_empty());
        let flat = st.reply.flatten();
        assert_eq!(flat.len(), 2 * (REPLY_INLINE_CAP - 10) + 4);
        assert!(flat.ends_with(b"tail"));
    }

    #[test]
    fn deferred_len_fills_in_place() {
        let (srv, client) = test_client(2);
        let mut st = client.lock();
        // Force the spill path so the deferred node has a following block.
        let filler = vec![b'x'; REPLY_INLINE_CAP];
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        w.raw(&filler);
        let d = w.deferred_len();
        w.bulk(b"one");
        w.bulk(b"two");
        w.set_deferred_array_len(d, 2);
        drop(w);
        let flat = st.reply.flatten();
        let tail = &flat[REPLY_INLINE_CAP..];
        assert_eq!(tail, b"*2\r\n$3\r\none\r\n$3\r\ntwo\r\n");
    }

    #[test]
    fn deferred_len_empty_aggregate() {
        let (srv, client) = test_client(2);
        let mut st = client.lock();
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        let d = w.deferred_len();
        w.set_deferred_array_len(d, 0);
        drop(w);
        assert_eq!(st.reply.flatten(), b"*0\r\n");
    }

    #[test]
    fn prepare_queues_pending_write_once() {
        let (srv, client) = test_client(2);
        let mut st = client.lock();
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        w.status("one");
        w.status("two");
        w.integer(3);
        drop(w);
        assert!(st.flags.pending_write);
        drop(st);
        let pending = srv.slot(0).take_pending_writes();
        assert_eq!(pending.len(), 1);
        assert!(Arc::ptr_eq(&pending[0], &client));
    }

    #[test]
    fn reply_off_refuses_output() {
        let (srv, client) = test_client(2);
        let mut st = client.lock();
        st.flags.reply_off = true;
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        w.status("nope");
        drop(w);
        assert_eq!(st.reply.flatten(), b"");
        assert!(!st.flags.pending_write);
    }

    #[test]
    fn fake_client_refuses_but_scripting_accepts() {
        let srv = Server::new(Config::for_tests());
        let fake = Arc::new(Client::new_fake(9, 0, Instant::now()));
        let mut st = fake.lock();
        let mut w = ReplyWriter::new(&srv, &fake, &mut st, false);
        w.status("dropped");
        drop(w);
        assert_eq!(st.reply.flatten(), b"");

        st.flags.scripting = true;
        let mut w = ReplyWriter::new(&srv, &fake, &mut st, false);
        w.status("kept");
        drop(w);
        assert_eq!(st.reply.flatten(), b"+kept\r\n");
        // Scripting clients never join the pending-write queue.
        assert!(!st.flags.pending_write);
    }

    #[test]
    fn shared_headers_are_used_for_small_lengths() {
        let (srv, client) = test_client(2);
        let mut st = client.lock();
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        w.array_len(3);
        w.bulk(b"abc");
        drop(w);
        assert_eq!(st.reply.flatten(), b"*3\r\n$3\r\nabc\r\n");
    }

    #[test]
    fn hard_output_limit_flags_close() {
        let mut config = Config::for_tests();
        config.obuf_normal.hard_bytes = 1024;
        let srv = Server::new(config);
        let client = Arc::new(Client::new(2, 0, 5, false, Instant::now()));
        let mut st = client.lock();
        let mut w = ReplyWriter::new(&srv, &client, &mut st, false);
        let big = vec![b'z'; 64 * 1024];
        w.raw(&big);
        drop(w);
        assert!(st.flags.close_asap);
    }

    #[test]
    fn absorb_moves_all_output() {
        let (srv, client) = test_client(2);
        let src_client = Arc::new(Client::new(3, 0, 6, false, Instant::now()));
        let mut src = src_client.lock();
        {
            let mut w = ReplyWriter::new(&srv, &src_client, &mut src, false);
            w.status("copied");
        }
        let mut dst = client.lock();
        let mut w = ReplyWriter::new(&srv, &client, &mut dst, false);
        w.splice_from(&mut src.reply);
        drop(w);
        assert_eq!(dst.reply.flatten(), b"+copied\r\n");
        assert_eq!(src.reply.flatten(), b"");
    }
}
