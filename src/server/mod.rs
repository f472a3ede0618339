//! Server state shared across event-loop threads, listener setup, and
//! the thread-slot bookkeeping that ties clients to their owner loops.

pub mod worker;

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::info;

use crate::client::{Client, ClientId, Registry};
use crate::config::Config;
use crate::event::EventLoopHandle;
use crate::lock::FairMutex;

thread_local! {
    static CURRENT_IEL: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the event loop running on this thread, if any.
pub fn current_iel() -> Option<usize> {
    CURRENT_IEL.with(|c| c.get())
}

pub(crate) fn set_current_iel(iel: usize) {
    CURRENT_IEL.with(|c| c.set(Some(iel)));
}

/// Externally observable counters.
#[derive(Default)]
pub struct Stats {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub net_input_bytes: AtomicU64,
    pub net_output_bytes: AtomicU64,
}

/// Per-event-loop-thread state reachable from any thread.
pub struct ThreadSlot {
    pub handle: EventLoopHandle,
    /// Clients with queued replies, flushed before the loop sleeps.
    /// Guarded by its own fair lock, taken after the client lock.
    pending_writes: FairMutex<Vec<Arc<Client>>>,
    /// Clients with a scratch buffer awaiting splice on their owner
    /// thread.
    pending_async: FairMutex<Vec<Arc<Client>>>,
    /// Unblocked clients whose query buffers need reprocessing.
    unblocked: FairMutex<Vec<Arc<Client>>>,
    pub connected: AtomicUsize,
}

impl ThreadSlot {
    fn new() -> ThreadSlot {
        ThreadSlot {
            handle: EventLoopHandle::new(),
            pending_writes: FairMutex::new(Vec::new()),
            pending_async: FairMutex::new(Vec::new()),
            unblocked: FairMutex::new(Vec::new()),
            connected: AtomicUsize::new(0),
        }
    }

    pub fn push_pending_write(&self, client: Arc<Client>) {
        self.pending_writes.lock().push(client);
    }

    pub fn take_pending_writes(&self) -> Vec<Arc<Client>> {
        std::mem::take(&mut *self.pending_writes.lock())
    }

    pub fn remove_pending_write(&self, client: &Arc<Client>) {
        let mut vec = self.pending_writes.lock();
        if let Some(idx) = vec.iter().position(|c| Arc::ptr_eq(c, client)) {
            vec.remove(idx);
        }
    }

    pub fn push_pending_async(&self, client: Arc<Client>) {
        self.pending_async.lock().push(client);
    }

    pub fn take_pending_async(&self) -> Vec<Arc<Client>> {
        std::mem::take(&mut *self.pending_async.lock())
    }

    pub fn has_pending_async(&self) -> bool {
        !self.pending_async.lock().is_empty()
    }

    pub fn remove_pending_async(&self, client: &Arc<Client>) -> bool {
        let mut vec = self.pending_async.lock();
        if let Some(idx) = vec.iter().position(|c| Arc::ptr_eq(c, client)) {
            vec.remove(idx);
            true
        } else {
            false
        }
    }

    pub fn push_unblocked(&self, client: Arc<Client>) {
        self.unblocked.lock().push(client);
    }

    pub fn take_unblocked(&self) -> Vec<Arc<Client>> {
        std::mem::take(&mut *self.unblocked.lock())
    }

    pub fn remove_unblocked(&self, client: &Arc<Client>) {
        let mut vec = self.unblocked.lock();
        if let Some(idx) = vec.iter().position(|c| Arc::ptr_eq(c, client)) {
            vec.remove(idx);
        }
    }
}

/// Process-wide server state.
pub struct Server {
    pub config: Config,
    /// The global lock: client list, id index, close queue.
    pub registry: FairMutex<Registry>,
    /// Client-side caching slot table.
    pub tracking: FairMutex<crate::tracking::TrackingTable>,
    threads: Vec<ThreadSlot>,
    next_client_id: AtomicU64,
    pub stats: Stats,
    pub start_time: Instant,
    paused: AtomicBool,
    /// Pause deadline in milliseconds since `start_time`.
    pause_end_ms: AtomicU64,
    dispatch_seed: AtomicU64,
}

impl Server {
    pub fn new(config: Config) -> Arc<Server> {
        let nthreads = config.effective_threads();
        Arc::new(Server {
            config,
            registry: FairMutex::new(Registry::new()),
            tracking: FairMutex::new(crate::tracking::TrackingTable::default()),
            threads: (0..nthreads).map(|_| ThreadSlot::new()).collect(),
            next_client_id: AtomicU64::new(1),
            stats: Stats::default(),
            start_time: Instant::now(),
            paused: AtomicBool::new(false),
            pause_end_ms: AtomicU64::new(0),
            dispatch_seed: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn slot(&self, iel: usize) -> &ThreadSlot {
        &self.threads[iel]
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a client whose scratch buffer holds async output. The list
    /// of the calling event thread is preferred so its own post-command
    /// integrator pass picks it up; from outside any loop, the owner's
    /// list is used and its loop woken.
    pub fn queue_pending_async(&self, client: Arc<Client>) {
        match current_iel() {
            Some(iel) => self.threads[iel].push_pending_async(client),
            None => {
                let slot = &self.threads[client.iel];
                slot.push_pending_async(client);
                slot.handle.wake();
            }
        }
    }

    /// Schedule `client` for destruction at the next safe point on its
    /// owner thread. Callers must not hold the client's lock.
    pub fn free_client_async(&self, client: &Arc<Client>) {
        {
            let mut registry = self.registry.lock();
            let mut state = client.lock();
            schedule_close_locked(&mut registry, client, &mut state);
        }
        self.threads[client.iel].handle.wake();
    }

    /// Pick an event loop for a new connection under the random dispatch
    /// policy: uniform over the non-main threads.
    pub fn random_target_thread(&self) -> usize {
        if self.threads.len() <= 1 {
            return 0;
        }
        let mut x = self.dispatch_seed.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.dispatch_seed.store(x, Ordering::Relaxed);
        1 + (x as usize % (self.threads.len() - 1))
    }

    fn now_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Suspend command processing for non-replica clients. An existing
    /// longer pause is never shortened.
    pub fn pause_clients(&self, duration_ms: u64) {
        let end = self.now_ms() + duration_ms;
        if !self.paused.load(Ordering::Acquire) || end > self.pause_end_ms.load(Ordering::Acquire) {
            self.pause_end_ms.store(end, Ordering::Release);
        }
        self.paused.store(true, Ordering::Release);
    }

    /// Are clients currently paused? Pure read; expiry is handled by
    /// `finish_pause_if_expired` on a worker tick.
    pub fn clients_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire) && self.now_ms() < self.pause_end_ms.load(Ordering::Acquire)
    }

    /// When the pause deadline has passed, clear the pause and queue all
    /// non-replica, non-blocked clients for reprocessing of any input
    /// that accumulated while paused.
    pub fn finish_pause_if_expired(&self) {
        if !self.paused.load(Ordering::Acquire) || self.now_ms() < self.pause_end_ms.load(Ordering::Acquire)
        {
            return;
        }
        self.paused.store(false, Ordering::Release);

        let registry = self.registry.lock();
        for client in &registry.clients {
            let mut state = client.lock();
            if state.flags.replica || state.flags.blocked {
                continue;
            }
            if state.flags.unblocked {
                continue;
            }
            state.flags.unblocked = true;
            drop(state);
            let slot = &self.threads[client.iel];
            slot.push_unblocked(Arc::clone(client));
            slot.handle.wake();
        }
    }
}

/// Mark a client close-asap and place it on the registry's close queue,
/// for callers already holding both the global lock and the client lock.
/// Scripting pseudo-clients are never torn down this way.
pub fn schedule_close_locked(
    registry: &mut Registry,
    client: &Arc<Client>,
    state: &mut crate::client::ClientState,
) {
    if state.flags.scripting {
        return;
    }
    state.flags.close_asap = true;
    if !state.flags.close_queued {
        state.flags.close_queued = true;
        registry.close_asap.push(Arc::clone(client));
    }
}

/// A running server: resolved listen address plus the worker threads.
pub struct ServerHandle {
    pub srv: Arc<Server>,
    addr: SocketAddr,
    workers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Block until the workers exit on their own.
    pub fn wait(self) {
        for w in self.workers {
            let _ = w.join();
        }
    }

    /// Ask every worker to stop and wait for them.
    pub fn shutdown(self) {
        for i in 0..self.srv.thread_count() {
            self.srv.slot(i).handle.close();
        }
        for w in self.workers {
            let _ = w.join();
        }
    }
}

/// Bind listeners and start one worker per configured thread. The first
/// listener resolves an ephemeral port so the remaining SO_REUSEPORT
/// listeners and the caller all agree on the address.
pub fn spawn(config: Config) -> io::Result<ServerHandle> {
    let srv = Server::new(config);
    let nthreads = srv.thread_count();

    let requested: SocketAddr = format!("{}:{}", srv.config.host, srv.config.port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let first = create_reuseport_listener(requested)?;
    let addr = first.local_addr()?;

    let mut listeners = vec![first];
    for _ in 1..nthreads {
        listeners.push(create_reuseport_listener(addr)?);
    }

    let unix_listener = match &srv.config.unixsocket {
        Some(path) => {
            let _ = std::fs::remove_file(path);
            let listener = std::os::unix::net::UnixListener::bind(path)?;
            listener.set_nonblocking(true)?;
            Some(listener)
        }
        None => None,
    };

    info!(
        addr = %addr,
        threads = nthreads,
        unixsocket = ?srv.config.unixsocket,
        "server listening"
    );

    let mut workers = Vec::with_capacity(nthreads);
    let mut unix_listener = unix_listener;
    for (iel, listener) in listeners.into_iter().enumerate() {
        let srv = Arc::clone(&srv);
        let unix = if iel == 0 { unix_listener.take() } else { None };
        let handle = std::thread::Builder::new()
            .name(format!("worker-{iel}"))
            .spawn(move || worker::run(srv, iel, listener, unix))?;
        workers.push(handle);
    }

    Ok(ServerHandle { srv, addr, workers })
}

/// TCP listener with SO_REUSEPORT so the kernel balances accepts across
/// the per-thread listeners.
fn create_reuseport_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_deadline_extends_not_shrinks() {
        let srv = Server::new(Config::for_tests());
        assert!(!srv.clients_paused());
        srv.pause_clients(10_000);
        assert!(srv.clients_paused());
        let end = srv.pause_end_ms.load(Ordering::Relaxed);
        srv.pause_clients(1);
        assert_eq!(srv.pause_end_ms.load(Ordering::Relaxed), end);
        srv.pause_clients(60_000);
        assert!(srv.pause_end_ms.load(Ordering::Relaxed) > end);
    }

    #[test]
    fn random_dispatch_targets_non_main_threads() {
        let mut config = Config::for_tests();
        config.threads = 4;
        let srv = Server::new(config);
        for _ in 0..100 {
            let t = srv.random_target_thread();
            assert!((1..4).contains(&t));
        }
    }
}
