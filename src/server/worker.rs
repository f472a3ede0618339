//! Per-thread event loop worker.
//!
//! Owns the poll, the connection table, and this thread's share of the
//! accept load. Each iteration dispatches file events, runs posted
//! closures, and reprocesses unblocked clients. Before going back to
//! sleep it flushes pending writes straight to the sockets, splices
//! async scratch buffers into reply queues, and finalizes deferred
//! closes.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::client::reply::{ReplyBlock, ReplyWriter};
use crate::client::{Client, ClientState};
use crate::commands;
use crate::config::DispatchPolicy;
use crate::protocol::parser::{Parse, QueryBuffer, RequestKind, RequestParser};
use crate::protocol::{NET_MAX_WRITES_PER_EVENT, PROTO_IOBUF_LEN};
use crate::server::{schedule_close_locked, set_current_iel, Server};

const WAKER_TOKEN: Token = Token(usize::MAX);
const TCP_LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const UNIX_LISTENER_TOKEN: Token = Token(usize::MAX - 2);

/// Bound on accepts per readable event, to keep tail latency in check.
const MAX_ACCEPTS_PER_CALL: usize = 1000;

/// Either kind of accepted stream.
pub enum Sock {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Sock {
    fn raw_fd(&self) -> i32 {
        match self {
            Sock::Tcp(s) => s.as_raw_fd(),
            Sock::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Sock {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Sock::Tcp(s) => s.read(buf),
            Sock::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Sock {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sock::Tcp(s) => s.write(buf),
            Sock::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sock::Tcp(s) => s.flush(),
            Sock::Unix(s) => s.flush(),
        }
    }
}

impl Source for Sock {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Sock::Tcp(s) => s.register(registry, token, interests),
            Sock::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Sock::Tcp(s) => s.reregister(registry, token, interests),
            Sock::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        match self {
            Sock::Tcp(s) => s.deregister(registry),
            Sock::Unix(s) => s.deregister(registry),
        }
    }
}

/// Per-connection state owned by this thread.
pub struct Connection {
    sock: Sock,
    client: Arc<Client>,
    query: QueryBuffer,
    parser: RequestParser,
    want_write: bool,
    /// Process the writable side before the readable side of one event,
    /// so a pre-sleep fsync point never lands between a read and its
    /// reply on the same fd.
    barrier: bool,
}

pub struct Worker {
    srv: Arc<Server>,
    iel: usize,
    poll: Poll,
    conns: Slab<Connection>,
    tcp_listener: TcpListener,
    unix_listener: Option<UnixListener>,
}

/// Entry point for one worker thread.
pub fn run(
    srv: Arc<Server>,
    iel: usize,
    listener: std::net::TcpListener,
    unix: Option<std::os::unix::net::UnixListener>,
) {
    set_current_iel(iel);
    match Worker::new(srv, iel, listener, unix) {
        Ok(mut worker) => {
            if let Err(e) = worker.run_loop() {
                error!(worker = iel, error = %e, "worker failed");
            }
        }
        Err(e) => error!(worker = iel, error = %e, "worker setup failed"),
    }
}

enum WriteOutcome {
    /// Everything buffered was written.
    Drained,
    /// The socket would block; wait for a writable event.
    Blocked,
    /// Per-event write budget exhausted with the socket still open.
    Budget,
    /// Unrecoverable socket error.
    Error,
}

impl Worker {
    fn new(
        srv: Arc<Server>,
        iel: usize,
        listener: std::net::TcpListener,
        unix: Option<std::os::unix::net::UnixListener>,
    ) -> io::Result<Worker> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        srv.slot(iel).handle.attach_waker(waker);

        let mut tcp_listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut tcp_listener, TCP_LISTENER_TOKEN, Interest::READABLE)?;

        let mut unix_listener = unix.map(UnixListener::from_std);
        if let Some(ul) = unix_listener.as_mut() {
            ul.register(poll.registry(), UNIX_LISTENER_TOKEN, Interest::READABLE)?;
        }

        info!(worker = iel, "worker started");
        Ok(Worker {
            srv,
            iel,
            poll,
            conns: Slab::new(),
            tcp_listener,
            unix_listener,
        })
    }

    fn run_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            if self.srv.slot(self.iel).handle.is_closed() {
                break;
            }
            self.poll.poll(&mut events, Some(Duration::from_millis(100)))?;

            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                match token {
                    WAKER_TOKEN => {}
                    TCP_LISTENER_TOKEN => self.accept_tcp(),
                    UNIX_LISTENER_TOKEN => self.accept_unix(),
                    Token(key) => self.handle_conn_event(key, readable, writable),
                }
            }

            for task in self.srv.slot(self.iel).handle.take_tasks() {
                task(self);
            }

            self.drain_unblocked();
            self.srv.finish_pause_if_expired();

            self.handle_pending_writes();
            self.process_pending_async_writes();
            self.drain_close_queue();
        }
        Ok(())
    }

    /* ------------------------------------------------------------------
     * Accepting
     * ---------------------------------------------------------------- */

    fn accept_tcp(&mut self) {
        let mut budget = MAX_ACCEPTS_PER_CALL;
        loop {
            if budget == 0 {
                // More connections may be waiting; take them next tick.
                self.srv.slot(self.iel).handle.wake();
                break;
            }
            budget -= 1;
            match self.tcp_listener.accept() {
                Ok((stream, peer)) => self.dispatch_connection(Sock::Tcp(stream), peer.to_string()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(worker = self.iel, error = %e, "accepting client connection");
                    break;
                }
            }
        }
    }

    fn accept_unix(&mut self) {
        let Some(listener) = self.unix_listener.as_mut() else {
            return;
        };
        let path = self
            .srv
            .config
            .unixsocket
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let mut budget = MAX_ACCEPTS_PER_CALL;
        let mut accepted = Vec::new();
        loop {
            if budget == 0 {
                self.srv.slot(self.iel).handle.wake();
                break;
            }
            budget -= 1;
            match listener.accept() {
                Ok((stream, _)) => accepted.push(stream),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(worker = self.iel, error = %e, "accepting unix connection");
                    break;
                }
            }
        }
        for stream in accepted {
            self.register_client(Sock::Unix(stream), format!("{path}:0"), true);
        }
    }

    fn dispatch_connection(&mut self, sock: Sock, peer: String) {
        match self.srv.config.dispatch {
            DispatchPolicy::Local => self.register_client(sock, peer, false),
            DispatchPolicy::Random => {
                let target = self.srv.random_target_thread();
                if target == self.iel {
                    self.register_client(sock, peer, false);
                    return;
                }
                let posted = self.srv.slot(target).handle.post(Box::new(move |w| {
                    w.register_client(sock, peer, false);
                }));
                if let Err(e) = posted {
                    debug!(worker = self.iel, target_thread = target, error = %e, "dispatch post failed");
                }
            }
        }
    }

    fn register_client(&mut self, mut sock: Sock, peer: String, unix_socket: bool) {
        if let Sock::Tcp(stream) = &sock {
            let _ = stream.set_nodelay(true);
            if self.srv.config.tcp_keepalive > 0 {
                set_tcp_keepalive(stream.as_raw_fd(), self.srv.config.tcp_keepalive);
            }
            if self.srv.config.thread_affinity {
                set_incoming_cpu(stream.as_raw_fd(), self.iel);
            }
        }

        // Admission control: the socket is already non-blocking, so the
        // refusal line is written best-effort for free.
        {
            let registry = self.srv.registry.lock();
            if registry.len() >= self.srv.config.maxclients {
                drop(registry);
                let _ = sock.write(b"-ERR max number of clients reached\r\n");
                self.srv
                    .stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if self.refuse_in_protected_mode(&mut sock, unix_socket, &peer) {
            self.srv
                .stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let id = self.srv.next_client_id();
        let client = Arc::new(Client::new(
            id,
            self.iel,
            sock.raw_fd(),
            unix_socket,
            Instant::now(),
        ));

        let entry = self.conns.vacant_entry();
        let token = entry.key();
        {
            let mut state = client.lock();
            state.token = token;
            state.peer_id = Some(peer.clone());
            state.flags.authenticated = self.srv.config.requirepass.is_none();
        }
        let mut conn = Connection {
            sock,
            client: Arc::clone(&client),
            query: QueryBuffer::new(),
            parser: RequestParser::new(self.srv.config.proto_max_bulk_len),
            want_write: false,
            barrier: false,
        };
        if let Err(e) = conn
            .sock
            .register(self.poll.registry(), Token(token), Interest::READABLE)
        {
            warn!(error = %e, "error registering fd event for the new client");
            return;
        }
        entry.insert(conn);

        {
            let mut registry = self.srv.registry.lock();
            registry.link(client, &self.srv.slot(self.iel).connected);
        }
        self.srv
            .stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        debug!(worker = self.iel, conn_id = token, peer = %peer, "accepted connection");
    }

    /// Protected mode: with no password configured and the listener bound
    /// to every interface, only loopback and unix-socket peers are
    /// admitted.
    fn refuse_in_protected_mode(&self, sock: &mut Sock, unix_socket: bool, peer: &str) -> bool {
        if !self.srv.config.protected_mode
            || self.srv.config.requirepass.is_some()
            || unix_socket
        {
            return false;
        }
        let unbound = matches!(self.srv.config.host.as_str(), "0.0.0.0" | "::");
        if !unbound {
            return false;
        }
        let loopback = peer
            .rsplit_once(':')
            .and_then(|(ip, _)| ip.trim_matches(['[', ']']).parse::<std::net::IpAddr>().ok())
            .map(|ip| ip.is_loopback())
            .unwrap_or(false);
        if loopback {
            return false;
        }
        let _ = sock.write(
            b"-DENIED turnstile is running in protected mode because protected \
mode is enabled, no bind address was specified, and no authentication \
password is requested to clients. In this mode connections are only \
accepted from the loopback interface. To connect from external hosts, \
either disable protected mode, set a bind address, or configure an \
authentication password.\r\n",
        );
        true
    }

    /* ------------------------------------------------------------------
     * Readable path
     * ---------------------------------------------------------------- */

    fn handle_conn_event(&mut self, token: usize, readable: bool, writable: bool) {
        if !self.conns.contains(token) {
            return;
        }
        let barrier = self.conns[token].barrier;
        if barrier {
            if writable {
                self.handle_writable(token);
            }
            if readable && self.conns.contains(token) {
                self.handle_readable(token);
            }
        } else {
            if readable {
                self.handle_readable(token);
            }
            if writable && self.conns.contains(token) {
                self.handle_writable(token);
            }
        }
    }

    fn handle_readable(&mut self, token: usize) {
        let client = match self.conns.get(token) {
            Some(c) => Arc::clone(&c.client),
            None => return,
        };

        {
            // Skip if a foreign thread holds the client; retry shortly.
            let Some(mut state) = client.try_lock() else {
                self.srv.slot(self.iel).handle.wake();
                return;
            };
            loop {
                let conn = match self.conns.get_mut(token) {
                    Some(c) => c,
                    None => return,
                };
                let mut readlen = PROTO_IOBUF_LEN;
                // While a big bulk body streams in, clamp the read so the
                // body lands alone in the buffer for the zero-copy path.
                if let Some(remaining) = conn.parser.big_bulk_remaining(&conn.query) {
                    if remaining > 0 && remaining < readlen {
                        readlen = remaining;
                    }
                }
                match conn.query.read_from(&mut conn.sock, readlen) {
                    Ok(0) => {
                        debug!(client = client.id, "client closed connection");
                        drop(state);
                        self.srv.free_client_async(&client);
                        return;
                    }
                    Ok(n) => {
                        self.srv
                            .stats
                            .net_input_bytes
                            .fetch_add(n as u64, Ordering::Relaxed);
                        state.last_interaction = Instant::now();
                        state.qbuf_len = conn.query.len();
                        if conn.query.len() > self.srv.config.client_max_querybuf_len {
                            warn!(
                                client = client.id,
                                qbuf = conn.query.len(),
                                "closing client that reached max query buffer length"
                            );
                            drop(state);
                            self.srv.free_client_async(&client);
                            return;
                        }
                        if n < readlen {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(client = client.id, error = %e, "reading from client");
                        drop(state);
                        self.srv.free_client_async(&client);
                        return;
                    }
                }
            }
        }

        self.process_input(token);
    }

    /// Run the parse/dispatch loop over whatever sits in the query
    /// buffer. Called from the readable handler and again when a client
    /// is unblocked or unpaused.
    pub fn process_input(&mut self, token: usize) {
        loop {
            let Some(conn) = self.conns.get_mut(token) else {
                return;
            };
            if conn.query.pos() >= conn.query.len() {
                break;
            }
            {
                let state = conn.client.lock();
                if !state.flags.replica && self.srv.clients_paused() {
                    break;
                }
                if state.flags.blocked {
                    break;
                }
                if state.flags.close_after_reply || state.flags.close_asap {
                    break;
                }
            }

            match conn.parser.parse(&mut conn.query) {
                Parse::NeedMore => break,
                Parse::Error(e) => {
                    self.protocol_error(token, e);
                    break;
                }
                Parse::Ready => {
                    if conn.parser.argv.is_empty() {
                        if conn.parser.kind == Some(RequestKind::Inline) && conn.parser.inline_empty
                        {
                            let mut state = conn.client.lock();
                            if state.flags.replica {
                                state.repl_ack_time = Some(Instant::now());
                            }
                        }
                        conn.parser.reset();
                        continue;
                    }
                    let argv = std::mem::take(&mut conn.parser.argv);
                    let client = Arc::clone(&conn.client);
                    {
                        let mut registry = self.srv.registry.lock();
                        let mut state = client.lock();
                        if !state.flags.close_asap {
                            commands::execute(&self.srv, &mut registry, &client, &mut state, &argv);
                            reset_client(&mut state);
                        }
                        if state.flags.close_asap && !state.flags.close_queued {
                            schedule_close_locked(&mut registry, &client, &mut state);
                        }
                    }
                    if let Some(conn) = self.conns.get_mut(token) {
                        conn.parser.reset();
                    }
                }
            }
        }

        if let Some(conn) = self.conns.get_mut(token) {
            conn.query.trim();
        }

        // Async replies produced while executing commands on this thread
        // are spliced before going back to the loop.
        if self.srv.slot(self.iel).has_pending_async() {
            self.process_pending_async_writes();
        }
    }

    fn protocol_error(&mut self, token: usize, err: crate::protocol::parser::ProtocolError) {
        let Some(conn) = self.conns.get_mut(token) else {
            return;
        };
        let sample = printable_sample(conn.query.pending(), 128);
        let client = Arc::clone(&conn.client);
        debug!(
            client = client.id,
            error = err.log,
            query = %sample,
            "protocol error"
        );
        let mut state = client.lock();
        let mut w = ReplyWriter::new(&self.srv, &client, &mut state, false);
        w.error(&err.reply);
        state.flags.close_after_reply = true;
    }

    /* ------------------------------------------------------------------
     * Writable path
     * ---------------------------------------------------------------- */

    fn handle_writable(&mut self, token: usize) {
        let client = match self.conns.get(token) {
            Some(c) => Arc::clone(&c.client),
            None => return,
        };
        let outcome = {
            let mut state = client.lock();
            let Some(conn) = self.conns.get_mut(token) else {
                return;
            };
            write_to_client(&self.srv, &mut conn.sock, &mut state)
        };
        self.finish_write(token, &client, outcome, true);
    }

    /// Flush one client, then decide how its pending bytes (if any) get
    /// written next.
    fn finish_write(
        &mut self,
        token: usize,
        client: &Arc<Client>,
        outcome: WriteOutcome,
        handler_installed: bool,
    ) {
        match outcome {
            WriteOutcome::Drained => {
                if handler_installed {
                    self.set_want_write(token, false);
                }
                let close = client.lock().flags.close_after_reply;
                if close {
                    self.srv.free_client_async(client);
                }
            }
            WriteOutcome::Blocked => {
                self.set_want_write(token, true);
            }
            WriteOutcome::Budget => {
                // Still writable; continue from the pre-sleep flush on the
                // next iteration rather than waiting for an edge.
                let mut state = client.lock();
                if !state.flags.pending_write {
                    state.flags.pending_write = true;
                    drop(state);
                    self.srv
                        .slot(self.iel)
                        .push_pending_write(Arc::clone(client));
                }
                self.srv.slot(self.iel).handle.wake();
            }
            WriteOutcome::Error => {
                self.srv.free_client_async(client);
            }
        }
    }

    fn set_want_write(&mut self, token: usize, want: bool) {
        let Some(conn) = self.conns.get_mut(token) else {
            return;
        };
        if conn.want_write == want {
            return;
        }
        conn.want_write = want;
        conn.barrier = want && self.srv.config.fsync_always;
        let interest = if want {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = conn
            .sock
            .reregister(self.poll.registry(), Token(token), interest)
        {
            warn!(error = %e, "reregistering connection interest");
        }
    }

    /// Install the writable event for a client, typically posted here by
    /// the async-write integrator from another thread.
    pub fn install_write_handler(&mut self, client: &Arc<Client>) {
        let token = client.lock().token;
        let matches = self
            .conns
            .get(token)
            .map(|c| Arc::ptr_eq(&c.client, client))
            .unwrap_or(false);
        if matches {
            self.set_want_write(token, true);
        }
    }

    /// The pending-write coalescer: write queued replies directly to the
    /// sockets before sleeping, installing the writable handler only for
    /// clients whose socket filled up.
    fn handle_pending_writes(&mut self) {
        let list = self.srv.slot(self.iel).take_pending_writes();
        for client in list {
            debug_assert_eq!(client.iel, self.iel);
            let outcome = {
                let mut state = client.lock();
                state.flags.pending_write = false;
                if state.flags.protected {
                    continue;
                }
                let token = state.token;
                let Some(conn) = self.conns.get_mut(token) else {
                    continue;
                };
                if !Arc::ptr_eq(&conn.client, &client) {
                    continue;
                }
                write_to_client(&self.srv, &mut conn.sock, &mut state)
            };
            let token = client.lock().token;
            self.finish_write(token, &client, outcome, false);
        }
    }

    /* ------------------------------------------------------------------
     * Async-write integration
     * ---------------------------------------------------------------- */

    /// Splice scratch buffers filled by foreign threads into the real
    /// reply queues, then arrange for the owner thread to flush them.
    fn process_pending_async_writes(&mut self) {
        let list = self.srv.slot(self.iel).take_pending_async();
        if list.is_empty() {
            return;
        }
        let mut registry = self.srv.registry.lock();
        for client in list {
            let mut state = client.lock();
            debug_assert!(state.flags.pending_async_write);
            state.flags.pending_async_write = false;

            if state.flags.close_asap || state.flags.close_after_reply {
                state.reply.scratch = Vec::new();
                continue;
            }

            let scratch = state.reply.take_scratch();
            if !scratch.is_empty() {
                state.reply.push_block(ReplyBlock::exact(&scratch));
            }

            crate::client::reply::enforce_output_limits(&self.srv, client.id, &mut state);
            if state.flags.close_asap {
                schedule_close_locked(&mut registry, &client, &mut state);
                continue;
            }

            // The enqueue above must be visible before the counter is
            // observed on the owner thread.
            fence(Ordering::SeqCst);

            if state.async_ops_pending == 0 {
                if client.iel == self.iel {
                    if !state.flags.pending_write {
                        state.flags.pending_write = true;
                        self.srv
                            .slot(self.iel)
                            .push_pending_write(Arc::clone(&client));
                    }
                } else {
                    state.async_ops_pending += 1;
                    let target = Arc::clone(&client);
                    let posted = self.srv.slot(client.iel).handle.post(Box::new(move |w| {
                        {
                            let mut st = target.lock();
                            debug_assert!(st.async_ops_pending > 0);
                            st.async_ops_pending -= 1;
                        }
                        w.install_write_handler(&target);
                    }));
                    if posted.is_err() {
                        // Retry on a later pass.
                        state.async_ops_pending -= 1;
                    }
                }
            }
        }
    }

    /* ------------------------------------------------------------------
     * Unblocking and deferred destruction
     * ---------------------------------------------------------------- */

    fn drain_unblocked(&mut self) {
        let list = self.srv.slot(self.iel).take_unblocked();
        for client in list {
            let token = {
                let mut state = client.lock();
                state.flags.unblocked = false;
                if state.flags.close_asap {
                    continue;
                }
                state.token
            };
            let matches = self
                .conns
                .get(token)
                .map(|c| Arc::ptr_eq(&c.client, &client))
                .unwrap_or(false);
            if matches {
                self.process_input(token);
            }
        }
    }

    /// Finalize clients queued for deferred destruction on this thread.
    fn drain_close_queue(&mut self) {
        let mine: Vec<Arc<Client>> = {
            let mut registry = self.srv.registry.lock();
            let mut mine = Vec::new();
            let mut rest = Vec::new();
            for c in registry.close_asap.drain(..) {
                if c.iel == self.iel {
                    mine.push(c);
                } else {
                    rest.push(c);
                }
            }
            registry.close_asap = rest;
            mine
        };
        for client in mine {
            self.free_client(&client);
        }
    }

    /// Destroy a client: unlink it from every shared structure, tear the
    /// connection down, and mark its lock destroyed. Owner thread only,
    /// under the global lock.
    fn free_client(&mut self, client: &Arc<Client>) {
        let mut registry = self.srv.registry.lock();
        let token;
        {
            let mut state = client.lock();
            if state.flags.protected || state.async_ops_pending > 0 {
                // Not safe to tear down yet; keep it queued.
                registry.close_asap.push(Arc::clone(client));
                return;
            }
            state.flags.close_queued = false;
            state.flags.close_asap = false;

            registry.unlink(client, &self.srv.slot(client.iel).connected);
            if state.flags.pending_write {
                self.srv.slot(client.iel).remove_pending_write(client);
                state.flags.pending_write = false;
            }
            if state.flags.unblocked {
                self.srv.slot(client.iel).remove_unblocked(client);
                state.flags.unblocked = false;
            }
            if state.flags.pending_async_write {
                for iel in 0..self.srv.thread_count() {
                    if self.srv.slot(iel).remove_pending_async(client) {
                        break;
                    }
                }
                state.flags.pending_async_write = false;
            }
            crate::tracking::disable(&self.srv, &mut state);
            token = state.token;
            state.fd = -1;
        }

        let matches = self
            .conns
            .get(token)
            .map(|c| Arc::ptr_eq(&c.client, client))
            .unwrap_or(false);
        if matches {
            let mut conn = self.conns.remove(token);
            let _ = conn.sock.deregister(self.poll.registry());
        }

        // Every shared structure has dropped its reference; any late
        // holder still owns an Arc, so marking the lock destroyed is
        // safe.
        client.raw_lock().free();
        debug!(client = client.id, "connection closed");
    }

    /// Suspend a client's file events so no error can free it while a
    /// long operation is in flight.
    pub fn protect_client(&mut self, client: &Arc<Client>) {
        let token = {
            let mut state = client.lock();
            state.flags.protected = true;
            state.token
        };
        if let Some(conn) = self.conns.get_mut(token) {
            if Arc::ptr_eq(&conn.client, client) {
                let _ = conn.sock.deregister(self.poll.registry());
            }
        }
    }

    pub fn unprotect_client(&mut self, client: &Arc<Client>) {
        let (token, pending) = {
            let mut state = client.lock();
            if !state.flags.protected {
                return;
            }
            state.flags.protected = false;
            (state.token, state.has_pending_replies())
        };
        if let Some(conn) = self.conns.get_mut(token) {
            if Arc::ptr_eq(&conn.client, client) {
                conn.want_write = false;
                let _ = conn
                    .sock
                    .register(self.poll.registry(), Token(token), Interest::READABLE);
            }
        }
        if pending {
            let mut state = client.lock();
            if !state.flags.pending_write {
                state.flags.pending_write = true;
                drop(state);
                self.srv
                    .slot(self.iel)
                    .push_pending_write(Arc::clone(client));
            }
        }
    }
}

/// Write buffered replies to one socket: inline buffer first, then the
/// spill blocks, bounded by the per-event budget except for replicas.
fn write_to_client(srv: &Server, sock: &mut Sock, state: &mut ClientState) -> WriteOutcome {
    let mut totwritten = 0usize;
    let mut blocked = false;
    let mut failed = false;

    while state.has_pending_replies() {
        if state.reply.bufpos > 0 {
            let (from, to) = (state.reply.sentlen, state.reply.bufpos);
            match sock.write(&state.reply.buf[from..to]) {
                Ok(0) => {
                    failed = true;
                    break;
                }
                Ok(n) => {
                    state.reply.sentlen += n;
                    totwritten += n;
                    if state.reply.sentlen == state.reply.bufpos {
                        state.reply.bufpos = 0;
                        state.reply.sentlen = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    blocked = true;
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "error writing to client");
                    failed = true;
                    break;
                }
            }
        } else {
            let (used, size) = match state.reply.blocks.front() {
                None => break,
                Some(None) => {
                    // Unfilled deferred placeholder; nothing to send yet.
                    debug_assert!(false, "deferred length never set");
                    state.reply.blocks.pop_front();
                    continue;
                }
                Some(Some(block)) => (block.used(), block.size()),
            };
            if used == 0 {
                state.reply.reply_bytes -= size;
                state.reply.blocks.pop_front();
                continue;
            }
            let sent = state.reply.sentlen;
            let res = match state.reply.blocks.front() {
                Some(Some(block)) => sock.write(&block.bytes()[sent..used]),
                _ => unreachable!(),
            };
            match res {
                Ok(0) => {
                    failed = true;
                    break;
                }
                Ok(n) => {
                    state.reply.sentlen += n;
                    totwritten += n;
                    if state.reply.sentlen == used {
                        state.reply.reply_bytes -= size;
                        state.reply.blocks.pop_front();
                        state.reply.sentlen = 0;
                        if state.reply.blocks.is_empty() {
                            debug_assert_eq!(state.reply.reply_bytes, 0);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    blocked = true;
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "error writing to client");
                    failed = true;
                    break;
                }
            }
        }
        // Cap the bytes served to one client per event so the loop keeps
        // serving its other clients; replicas are exempt or their stream
        // would grow without bound.
        if totwritten > NET_MAX_WRITES_PER_EVENT && !state.flags.replica {
            break;
        }
    }

    srv.stats
        .net_output_bytes
        .fetch_add(totwritten as u64, Ordering::Relaxed);
    if totwritten > 0 && !state.flags.master {
        state.last_interaction = Instant::now();
    }

    if failed {
        return WriteOutcome::Error;
    }
    if !state.has_pending_replies() {
        state.reply.sentlen = 0;
        WriteOutcome::Drained
    } else if blocked {
        WriteOutcome::Blocked
    } else {
        WriteOutcome::Budget
    }
}

/// Between-commands bookkeeping: the reply-skip window advances by one
/// command.
fn reset_client(state: &mut ClientState) {
    state.flags.reply_skip = false;
    if state.flags.reply_skip_next {
        state.flags.reply_skip = true;
        state.flags.reply_skip_next = false;
    }
}

/// Sample of the offending bytes for protocol-error logs, with
/// non-printable characters replaced.
fn printable_sample(bytes: &[u8], max: usize) -> String {
    bytes
        .iter()
        .take(max)
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn set_tcp_keepalive(fd: i32, interval_secs: u64) {
    let enable: libc::c_int = 1;
    let idle: libc::c_int = interval_secs as libc::c_int;
    let intvl: libc::c_int = (interval_secs / 3).max(1) as libc::c_int;
    let cnt: libc::c_int = 3;
    // SAFETY: fd is a live socket; the option payloads are c_ints.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            &idle as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            &intvl as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPCNT,
            &cnt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_keepalive(_fd: i32, _interval_secs: u64) {}

#[cfg(target_os = "linux")]
fn set_incoming_cpu(fd: i32, cpu: usize) {
    let cpu: libc::c_int = cpu as libc::c_int;
    // SAFETY: fd is a live socket.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_INCOMING_CPU,
            &cpu as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        warn!("failed to set socket affinity");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_incoming_cpu(_fd: i32, _cpu: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_sample_masks_binary() {
        assert_eq!(printable_sample(b"PING\r\n\x01", 16), "PING...");
        assert_eq!(printable_sample(b"abcdef", 3), "abc");
    }

    #[test]
    fn reset_client_reply_skip_window() {
        let client = Client::new(1, 0, 3, false, Instant::now());
        let mut state = client.lock();
        state.flags.reply_skip_next = true;
        reset_client(&mut state);
        assert!(state.flags.reply_skip);
        assert!(!state.flags.reply_skip_next);
        reset_client(&mut state);
        assert!(!state.flags.reply_skip);
    }
}
