//! Client records: identity, flags, lifecycle, and the process-wide
//! registry.
//!
//! Each connected client is split in two. The socket, query buffer, and
//! parser state live in the owner thread's connection table and are never
//! touched by other threads. Everything a foreign thread may need (flags,
//! reply surfaces, counters) lives here behind the client's fair lock,
//! reachable through an `Arc` from the registry.

pub mod reply;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::lock::{FairMutex, FairMutexGuard};

use self::reply::ReplySurface;

pub type ClientId = u64;

/// Fake clients (scripting, loaders) carry this fd.
pub const FAKE_CLIENT_FD: i32 = -1;

/// Connection kind, lifecycle, reply gating, and I/O scheduling bits,
/// spelled out as named booleans.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientFlags {
    // Connection kind
    pub master: bool,
    pub replica: bool,
    pub monitor: bool,
    pub pubsub: bool,
    pub unix_socket: bool,
    pub readonly: bool,
    pub scripting: bool,
    pub module: bool,
    // Lifecycle
    pub multi: bool,
    pub blocked: bool,
    pub unblocked: bool,
    pub protected: bool,
    pub close_after_reply: bool,
    pub close_asap: bool,
    /// Already sitting in the registry's close queue.
    pub close_queued: bool,
    // Client-side caching
    pub tracking: bool,
    pub tracking_broken_redir: bool,
    pub dirty_cas: bool,
    // Reply gating
    pub reply_off: bool,
    pub reply_skip: bool,
    pub reply_skip_next: bool,
    pub force_reply: bool,
    pub master_force_reply: bool,
    pub authenticated: bool,
    // I/O scheduling
    pub pending_write: bool,
    pub pending_async_write: bool,
}

/// Output-limit and LIST/KILL classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Normal,
    Replica,
    PubSub,
    Master,
}

impl ClientType {
    pub fn from_name(name: &str) -> Option<ClientType> {
        match name.to_ascii_lowercase().as_str() {
            "normal" => Some(ClientType::Normal),
            "slave" | "replica" => Some(ClientType::Replica),
            "pubsub" => Some(ClientType::PubSub),
            "master" => Some(ClientType::Master),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ClientType::Normal => "normal",
            ClientType::Replica => "slave",
            ClientType::PubSub => "pubsub",
            ClientType::Master => "master",
        }
    }
}

impl ClientFlags {
    pub fn client_type(&self) -> ClientType {
        if self.master {
            ClientType::Master
        } else if self.replica && !self.monitor {
            ClientType::Replica
        } else if self.pubsub {
            ClientType::PubSub
        } else {
            ClientType::Normal
        }
    }

    /// Single-letter encoding used by CLIENT LIST.
    pub fn letters(&self) -> String {
        let mut s = String::new();
        if self.replica {
            s.push(if self.monitor { 'O' } else { 'S' });
        }
        if self.master {
            s.push('M');
        }
        if self.pubsub {
            s.push('P');
        }
        if self.multi {
            s.push('x');
        }
        if self.blocked {
            s.push('b');
        }
        if self.tracking {
            s.push('t');
        }
        if self.tracking_broken_redir {
            s.push('R');
        }
        if self.dirty_cas {
            s.push('d');
        }
        if self.close_after_reply {
            s.push('c');
        }
        if self.unblocked {
            s.push('u');
        }
        if self.close_asap {
            s.push('A');
        }
        if self.unix_socket {
            s.push('U');
        }
        if self.readonly {
            s.push('r');
        }
        if s.is_empty() {
            s.push('N');
        }
        s
    }
}

/// Parameters of a blocking operation in flight.
#[derive(Debug, Default)]
pub struct BlockedState {
    pub timeout_ms: u64,
    pub keys: Vec<Vec<u8>>,
    pub target: Option<Vec<u8>>,
    pub numreplicas: u32,
    pub reploffset: u64,
}

/// Everything guarded by the per-client fair lock.
pub struct ClientState {
    pub fd: i32,
    /// Connection-table key on the owner thread; meaningless for fakes.
    pub token: usize,
    pub flags: ClientFlags,
    /// Negotiated protocol version, 2 or 3.
    pub resp: u8,
    pub name: Option<String>,
    /// Lazily rendered peer id ("ip:port" or "path:0").
    pub peer_id: Option<String>,
    pub reply: ReplySurface,
    /// Last observed query buffer length, mirrored here by the owner
    /// thread so CLIENT LIST can report it.
    pub qbuf_len: usize,
    pub blocked: Option<BlockedState>,
    pub pubsub_channels: HashSet<Vec<u8>>,
    pub watched_keys: Vec<Vec<u8>>,
    pub tracking_redirect: ClientId,
    pub create_time: Instant,
    pub last_interaction: Instant,
    pub repl_ack_time: Option<Instant>,
    pub obuf_soft_limit_start: Option<Instant>,
    /// Cross-thread writable-handler posts in flight.
    pub async_ops_pending: u32,
    pub last_cmd: Option<String>,
}

impl ClientState {
    /// Does this client have reply bytes waiting for the socket?
    pub fn has_pending_replies(&self) -> bool {
        (self.reply.bufpos > 0 || !self.reply.blocks.is_empty()) && !self.flags.close_asap
    }

    pub fn is_fake(&self) -> bool {
        self.fd == FAKE_CLIENT_FD
    }
}

/// The shared half of a client. Owner thread index and id are fixed for
/// the record's lifetime; everything else sits behind the fair lock.
pub struct Client {
    pub id: ClientId,
    pub iel: usize,
    state: FairMutex<ClientState>,
}

impl Client {
    pub fn new(id: ClientId, iel: usize, fd: i32, unix_socket: bool, now: Instant) -> Client {
        let flags = ClientFlags {
            unix_socket,
            ..ClientFlags::default()
        };
        Client {
            id,
            iel,
            state: FairMutex::new(ClientState {
                fd,
                token: usize::MAX,
                flags,
                resp: 2,
                name: None,
                peer_id: None,
                reply: ReplySurface::new(),
                qbuf_len: 0,
                blocked: None,
                pubsub_channels: HashSet::new(),
                watched_keys: Vec::new(),
                tracking_redirect: 0,
                create_time: now,
                last_interaction: now,
                repl_ack_time: None,
                obuf_soft_limit_start: None,
                async_ops_pending: 0,
                last_cmd: None,
            }),
        }
    }

    /// A non-connected client for scripting and loader contexts. All
    /// socket-touching paths short-circuit on `fd == -1`.
    pub fn new_fake(id: ClientId, iel: usize, now: Instant) -> Client {
        Client::new(id, iel, FAKE_CLIENT_FD, false, now)
    }

    pub fn lock(&self) -> FairMutexGuard<'_, ClientState> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<FairMutexGuard<'_, ClientState>> {
        self.state.try_lock()
    }

    /// The raw fair lock, for destruction and ownership assertions.
    pub fn raw_lock(&self) -> &crate::lock::FairLock {
        self.state.raw()
    }
}

/// Process-wide client bookkeeping: the live list, the id index, and the
/// deferred-close queue. Mutated only under the global lock
/// (`Server::registry`).
pub struct Registry {
    pub clients: Vec<Arc<Client>>,
    by_id: std::collections::HashMap<ClientId, Arc<Client>>,
    pub close_asap: Vec<Arc<Client>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            clients: Vec::new(),
            by_id: std::collections::HashMap::new(),
            close_asap: Vec::new(),
        }
    }

    pub fn link(&mut self, client: Arc<Client>, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.by_id.insert(client.id, Arc::clone(&client));
        self.clients.push(client);
    }

    pub fn unlink(&mut self, client: &Arc<Client>, counter: &AtomicUsize) {
        if self.by_id.remove(&client.id).is_some() {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(idx) = self.clients.iter().position(|c| Arc::ptr_eq(c, client)) {
            self.clients.remove(idx);
        }
    }

    /// Look up a registered client by id. Fake clients are never
    /// registered.
    pub fn lookup(&self, id: ClientId) -> Option<&Arc<Client>> {
        self.by_id.get(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_letters() {
        let mut f = ClientFlags::default();
        assert_eq!(f.letters(), "N");
        f.replica = true;
        f.multi = true;
        f.close_asap = true;
        assert_eq!(f.letters(), "SxA");
        f.monitor = true;
        assert_eq!(f.letters(), "OxA");
    }

    #[test]
    fn client_type_classification() {
        let mut f = ClientFlags::default();
        assert_eq!(f.client_type(), ClientType::Normal);
        f.pubsub = true;
        assert_eq!(f.client_type(), ClientType::PubSub);
        f.replica = true;
        assert_eq!(f.client_type(), ClientType::Replica);
        f.monitor = true;
        assert_eq!(f.client_type(), ClientType::PubSub);
        f.master = true;
        assert_eq!(f.client_type(), ClientType::Master);
    }

    #[test]
    fn registry_link_lookup_unlink() {
        let counter = AtomicUsize::new(0);
        let mut reg = Registry::new();
        let c = Arc::new(Client::new(7, 0, 10, false, Instant::now()));
        reg.link(Arc::clone(&c), &counter);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(reg.lookup(7).is_some());
        assert!(reg.lookup(8).is_none());
        reg.unlink(&c, &counter);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert!(reg.lookup(7).is_none());
        assert!(reg.is_empty());
    }
}
