//! Client-side caching support: key tracking and invalidation pushes.
//!
//! Keys are hashed into 2^24 slots; per slot we remember the ids of
//! clients that may hold cached copies. When a key in a slot changes,
//! every remembered client gets an invalidation message carrying the
//! slot number, and the slot's membership is dropped to be rebuilt
//! lazily. Clients may redirect their invalidation traffic to another
//! connection id; if that connection goes away, the original client is
//! told its redirection is broken.

use std::collections::{HashMap, HashSet};

use crate::client::reply::ReplyWriter;
use crate::client::{ClientId, ClientState, Registry};
use crate::server::Server;

const TRACKING_TABLE_BITS: u32 = 24;

/// Channel used to deliver invalidations to RESP2 clients reached via a
/// redirection in Pub/Sub mode.
pub const INVALIDATE_CHANNEL: &[u8] = b"__turnstile__:invalidate";

/// Slot membership table. Lives behind its own lock on the server.
#[derive(Default)]
pub struct TrackingTable {
    slots: HashMap<u32, HashSet<ClientId>>,
    pub tracking_clients: usize,
}

/// Slot of a key.
pub fn key_slot(key: &[u8]) -> u32 {
    // FNV-1a, folded to the table width.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in key {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash & ((1 << TRACKING_TABLE_BITS) - 1)) as u32
}

/// Turn tracking on for a client, optionally redirecting invalidation
/// messages to another connection id.
pub fn enable(srv: &Server, state: &mut ClientState, redirect_to: ClientId) {
    if state.flags.tracking {
        return;
    }
    state.flags.tracking = true;
    state.flags.tracking_broken_redir = false;
    state.tracking_redirect = redirect_to;
    srv.tracking.lock().tracking_clients += 1;
}

/// Turn tracking off. Slot entries referencing the client are dropped
/// lazily when their slot is next invalidated.
pub fn disable(srv: &Server, state: &mut ClientState) {
    if state.flags.tracking {
        srv.tracking.lock().tracking_clients -= 1;
        state.flags.tracking = false;
        state.flags.tracking_broken_redir = false;
    }
}

/// Record that `client_id` was served the given keys.
pub fn remember_keys<'a>(srv: &Server, client_id: ClientId, keys: impl Iterator<Item = &'a [u8]>) {
    let mut table = srv.tracking.lock();
    for key in keys {
        table
            .slots
            .entry(key_slot(key))
            .or_default()
            .insert(client_id);
    }
}

/// A key changed: push an invalidation to every client remembered for
/// its slot. Callers hold the global lock but no client lock.
pub fn invalidate_key(srv: &Server, registry: &Registry, key: &[u8]) {
    let slot = key_slot(key);
    let ids = match srv.tracking.lock().slots.remove(&slot) {
        Some(ids) => ids,
        None => return,
    };

    for id in ids {
        let Some(client) = registry.lookup(id) else {
            continue;
        };
        let mut state = client.lock();
        if !state.flags.tracking {
            continue;
        }

        let redirect = state.tracking_redirect;
        if redirect != 0 {
            let Some(target) = registry.lookup(redirect) else {
                // The redirection target is gone; tell the tracking
                // client so it can stop trusting its cache.
                state.flags.tracking_broken_redir = true;
                if state.resp > 2 {
                    let mut w = ReplyWriter::new(srv, client, &mut state, true);
                    w.push_len(3);
                    w.bulk(b"tracking-redir-broken");
                    w.integer(redirect as i64);
                }
                continue;
            };
            drop(state);
            let mut target_state = target.lock();
            if target_state.resp > 2 {
                let mut w = ReplyWriter::new(srv, target, &mut target_state, true);
                w.push_len(2);
                w.bulk(b"invalidate");
                w.integer(slot as i64);
            } else if target_state.flags.pubsub {
                // RESP2 can still be reached through Pub/Sub framing.
                let payload = slot.to_string();
                let mut w = ReplyWriter::new(srv, target, &mut target_state, true);
                w.array_len(3);
                w.bulk(b"message");
                w.bulk(INVALIDATE_CHANNEL);
                w.bulk(payload.as_bytes());
            }
            continue;
        }

        if state.resp > 2 {
            let mut w = ReplyWriter::new(srv, client, &mut state, true);
            w.push_len(2);
            w.bulk(b"invalidate");
            w.integer(slot as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::Config;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn slot_is_stable_and_bounded() {
        let a = key_slot(b"somekey");
        assert_eq!(a, key_slot(b"somekey"));
        assert!(a < (1 << TRACKING_TABLE_BITS));
        assert_ne!(key_slot(b"somekey"), key_slot(b"otherkey"));
    }

    #[test]
    fn invalidation_pushes_to_resp3_client() {
        let srv = crate::server::Server::new(Config::for_tests());
        let counter = AtomicUsize::new(0);
        let client = Arc::new(Client::new(1, 0, 4, false, Instant::now()));
        {
            let mut state = client.lock();
            state.resp = 3;
            enable(&srv, &mut state, 0);
        }
        {
            let mut registry = srv.registry.lock();
            registry.link(Arc::clone(&client), &counter);
        }
        remember_keys(&srv, 1, [b"watched".as_slice()].into_iter());

        let registry = srv.registry.lock();
        invalidate_key(&srv, &registry, b"watched");
        drop(registry);

        // Produced off the owner thread, so the push sits in the async
        // scratch buffer awaiting the integrator.
        let state = client.lock();
        let expect = format!(">2\r\n$10\r\ninvalidate\r\n:{}\r\n", key_slot(b"watched"));
        assert_eq!(state.reply.scratch, expect.as_bytes());
        assert!(state.flags.pending_async_write);
    }

    #[test]
    fn invalidation_is_one_shot_per_slot() {
        let srv = crate::server::Server::new(Config::for_tests());
        remember_keys(&srv, 9, [b"k".as_slice()].into_iter());
        assert!(srv.tracking.lock().slots.contains_key(&key_slot(b"k")));
        let registry = srv.registry.lock();
        invalidate_key(&srv, &registry, b"k");
        drop(registry);
        assert!(!srv.tracking.lock().slots.contains_key(&key_slot(b"k")));
    }
}
