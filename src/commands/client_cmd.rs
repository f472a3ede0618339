//! The CLIENT admin surface and the HELLO handshake.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::client::reply::ReplyWriter;
use crate::client::{Client, ClientState, ClientType, Registry};
use crate::server::{schedule_close_locked, Server};
use crate::tracking;

use super::{authenticate, AuthResult};

const CLIENT_HELP: &[&str] = &[
    "id                     -- Return the ID of the current connection.",
    "getname                -- Return the name of the current connection.",
    "kill <ip:port>         -- Kill connection made from <ip:port>.",
    "kill <option> <value> [option value ...] -- Kill connections. Options are:",
    "     addr <ip:port>                      -- Kill connection made from <ip:port>",
    "     type (normal|master|replica|pubsub) -- Kill connections by type.",
    "     skipme (yes|no)   -- Skip killing current connection (default: yes).",
    "list [options ...]     -- Return information about client connections. Options:",
    "     type (normal|master|replica|pubsub) -- Return clients of specified type.",
    "pause <timeout>        -- Suspend all clients for <timeout> milliseconds.",
    "reply (on|off|skip)    -- Control the replies sent to the current connection.",
    "setname <name>         -- Assign the name <name> to the current connection.",
    "unblock <clientid> [TIMEOUT|ERROR] -- Unblock the specified blocked client.",
    "tracking (on|off) [REDIRECT <id>] -- Enable client keys tracking for client side caching.",
];

/// HELLO <protocol-version> [AUTH <user> <password>] [SETNAME <name>]
pub fn hello(srv: &Server, client: &Arc<Client>, state: &mut ClientState, argv: &[Bytes]) {
    let ver = argv.get(1).and_then(|a| parse_i64(a));
    let ver = match ver {
        Some(v @ 2..=3) => v as u8,
        _ => {
            ReplyWriter::new(srv, client, state, false)
                .error("-NOPROTO unsupported protocol version");
            return;
        }
    };

    let mut pending_name: Option<Option<String>> = None;
    let mut j = 2;
    while j < argv.len() {
        let more = argv.len() - 1 - j;
        let opt = String::from_utf8_lossy(&argv[j]).to_ascii_uppercase();
        if opt == "AUTH" && more >= 2 {
            match authenticate(srv, Some(&argv[j + 1]), &argv[j + 2]) {
                AuthResult::Ok => state.flags.authenticated = true,
                _ => {
                    ReplyWriter::new(srv, client, state, false)
                        .error("-WRONGPASS invalid username-password pair");
                    return;
                }
            }
            j += 3;
        } else if opt == "SETNAME" && more >= 1 {
            match validate_name(&argv[j + 1]) {
                Ok(name) => pending_name = Some(name),
                Err(msg) => {
                    ReplyWriter::new(srv, client, state, false).error(msg);
                    return;
                }
            }
            j += 2;
        } else {
            let msg = format!(
                "Syntax error in HELLO option '{}'",
                String::from_utf8_lossy(&argv[j])
            );
            ReplyWriter::new(srv, client, state, false).error(&msg);
            return;
        }
    }

    if srv.config.requirepass.is_some() && !state.flags.authenticated {
        ReplyWriter::new(srv, client, state, false).error(
            "-NOAUTH HELLO must be called with the client already authenticated, \
otherwise the HELLO AUTH <user> <pass> option can be used to authenticate \
the client and select the RESP protocol version at the same time",
        );
        return;
    }

    if let Some(name) = pending_name {
        state.name = name;
    }
    state.resp = ver;

    let id = client.id as i64;
    let mut w = ReplyWriter::new(srv, client, state, false);
    w.map_len(7);
    w.bulk(b"server");
    w.bulk(b"turnstile");
    w.bulk(b"version");
    w.bulk(env!("CARGO_PKG_VERSION").as_bytes());
    w.bulk(b"proto");
    w.integer(ver as i64);
    w.bulk(b"id");
    w.integer(id);
    w.bulk(b"mode");
    w.bulk(b"standalone");
    w.bulk(b"role");
    w.bulk(b"master");
    w.bulk(b"modules");
    w.array_len(0);
}

/// CLIENT <subcommand> dispatch.
pub fn client(
    srv: &Server,
    registry: &mut Registry,
    client: &Arc<Client>,
    state: &mut ClientState,
    argv: &[Bytes],
) {
    if argv.len() < 2 {
        ReplyWriter::new(srv, client, state, false)
            .error("wrong number of arguments for 'client' command");
        return;
    }
    let sub = String::from_utf8_lossy(&argv[1]).to_ascii_lowercase();
    match sub.as_str() {
        "help" if argv.len() == 2 => {
            ReplyWriter::new(srv, client, state, false).help("client", CLIENT_HELP);
        }
        "id" if argv.len() == 2 => {
            let id = client.id as i64;
            ReplyWriter::new(srv, client, state, false).integer(id);
        }
        "list" => client_list(srv, registry, client, state, argv),
        "reply" if argv.len() == 3 => client_reply(srv, client, state, &argv[2]),
        "kill" => client_kill(srv, registry, client, state, argv),
        "unblock" if argv.len() == 3 || argv.len() == 4 => {
            client_unblock(srv, registry, client, state, argv)
        }
        "setname" if argv.len() == 3 => match validate_name(&argv[2]) {
            Ok(name) => {
                state.name = name;
                ReplyWriter::new(srv, client, state, false).status("OK");
            }
            Err(msg) => ReplyWriter::new(srv, client, state, false).error(msg),
        },
        "getname" if argv.len() == 2 => {
            let name = state.name.clone();
            let mut w = ReplyWriter::new(srv, client, state, false);
            match name {
                Some(n) => w.bulk(n.as_bytes()),
                None => w.null(),
            }
        }
        "pause" if argv.len() == 3 => {
            let ms = match parse_i64(&argv[2]) {
                Some(ms) if ms >= 0 => ms as u64,
                Some(_) => {
                    ReplyWriter::new(srv, client, state, false).error("timeout is negative");
                    return;
                }
                None => {
                    ReplyWriter::new(srv, client, state, false)
                        .error("timeout is not an integer or out of range");
                    return;
                }
            };
            srv.pause_clients(ms);
            ReplyWriter::new(srv, client, state, false).status("OK");
        }
        "tracking" if argv.len() == 3 || argv.len() == 5 => {
            client_tracking(srv, registry, client, state, argv)
        }
        _ => {
            let sub = String::from_utf8_lossy(&argv[1]).to_string();
            ReplyWriter::new(srv, client, state, false).subcommand_syntax_error("client", &sub);
        }
    }
}

fn client_reply(srv: &Server, client: &Arc<Client>, state: &mut ClientState, mode: &[u8]) {
    match mode.to_ascii_lowercase().as_slice() {
        b"on" => {
            state.flags.reply_skip = false;
            state.flags.reply_off = false;
            ReplyWriter::new(srv, client, state, false).status("OK");
        }
        b"off" => {
            state.flags.reply_off = true;
        }
        b"skip" => {
            if !state.flags.reply_off {
                state.flags.reply_skip_next = true;
            }
        }
        _ => {
            ReplyWriter::new(srv, client, state, false).error("syntax error");
        }
    }
}

fn client_list(
    srv: &Server,
    registry: &mut Registry,
    client: &Arc<Client>,
    state: &mut ClientState,
    argv: &[Bytes],
) {
    let mut type_filter: Option<ClientType> = None;
    if argv.len() == 4 && argv[2].eq_ignore_ascii_case(b"type") {
        let name = String::from_utf8_lossy(&argv[3]).to_string();
        match ClientType::from_name(&name) {
            Some(t) => type_filter = Some(t),
            None => {
                let msg = format!("Unknown client type '{name}'");
                ReplyWriter::new(srv, client, state, false).error(&msg);
                return;
            }
        }
    } else if argv.len() != 2 {
        ReplyWriter::new(srv, client, state, false).error("syntax error");
        return;
    }

    let now = Instant::now();
    let mut out = String::new();
    for other in &registry.clients {
        if Arc::ptr_eq(other, client) {
            if type_filter.is_some_and(|t| state.flags.client_type() != t) {
                continue;
            }
            out.push_str(&cat_client_info(other, state, now));
        } else {
            let other_state = other.lock();
            if type_filter.is_some_and(|t| other_state.flags.client_type() != t) {
                continue;
            }
            out.push_str(&cat_client_info(other, &other_state, now));
        }
        out.push('\n');
    }
    ReplyWriter::new(srv, client, state, false).bulk(out.as_bytes());
}

/// One CLIENT LIST line, format compatible with the usual tooling.
fn cat_client_info(client: &Arc<Client>, state: &ClientState, now: Instant) -> String {
    let mut events = String::from("r");
    if state.flags.pending_write || state.flags.pending_async_write {
        events.push('w');
    }
    format!(
        "id={} addr={} fd={} name={} age={} idle={} flags={} db=0 sub={} psub=0 \
multi=-1 qbuf={} qbuf-free=0 obl={} oll={} omem={} events={} cmd={}",
        client.id,
        state.peer_id.as_deref().unwrap_or("?:0"),
        state.fd,
        state.name.as_deref().unwrap_or(""),
        now.duration_since(state.create_time).as_secs(),
        now.duration_since(state.last_interaction).as_secs(),
        state.flags.letters(),
        state.pubsub_channels.len(),
        state.qbuf_len,
        state.reply.bufpos,
        state.reply.blocks.len(),
        state.reply.memory_used(),
        events,
        state.last_cmd.as_deref().unwrap_or("NULL"),
    )
}

fn client_kill(
    srv: &Server,
    registry: &mut Registry,
    client: &Arc<Client>,
    state: &mut ClientState,
    argv: &[Bytes],
) {
    let mut addr: Option<String> = None;
    let mut type_filter: Option<ClientType> = None;
    let mut id: u64 = 0;
    let mut skipme = true;
    let legacy = argv.len() == 3;

    if legacy {
        // Old style syntax: CLIENT KILL <addr>. It may kill the caller.
        addr = Some(String::from_utf8_lossy(&argv[2]).to_string());
        skipme = false;
    } else if argv.len() > 3 {
        let mut i = 2;
        while i < argv.len() {
            if i + 1 >= argv.len() {
                ReplyWriter::new(srv, client, state, false).error("syntax error");
                return;
            }
            let opt = String::from_utf8_lossy(&argv[i]).to_ascii_lowercase();
            let val = &argv[i + 1];
            match opt.as_str() {
                "id" => match parse_i64(val) {
                    Some(v) if v > 0 => id = v as u64,
                    _ => {
                        ReplyWriter::new(srv, client, state, false)
                            .error("value is not an integer or out of range");
                        return;
                    }
                },
                "type" => {
                    let name = String::from_utf8_lossy(val).to_string();
                    match ClientType::from_name(&name) {
                        Some(t) => type_filter = Some(t),
                        None => {
                            let msg = format!("Unknown client type '{name}'");
                            ReplyWriter::new(srv, client, state, false).error(&msg);
                            return;
                        }
                    }
                }
                "addr" => addr = Some(String::from_utf8_lossy(val).to_string()),
                "skipme" => match val.to_ascii_lowercase().as_slice() {
                    b"yes" => skipme = true,
                    b"no" => skipme = false,
                    _ => {
                        ReplyWriter::new(srv, client, state, false).error("syntax error");
                        return;
                    }
                },
                _ => {
                    ReplyWriter::new(srv, client, state, false).error("syntax error");
                    return;
                }
            }
            i += 2;
        }
    } else {
        ReplyWriter::new(srv, client, state, false).error("syntax error");
        return;
    }

    let mut victims: Vec<Arc<Client>> = Vec::new();
    let mut close_this_client = false;
    let mut killed = 0;
    for other in &registry.clients {
        let this_one = Arc::ptr_eq(other, client);
        let matches = if this_one {
            matches_kill_filters(client.id, state, &addr, type_filter, id)
        } else {
            let other_state = other.lock();
            matches_kill_filters(other.id, &other_state, &addr, type_filter, id)
        };
        if !matches {
            continue;
        }
        if this_one {
            if skipme {
                continue;
            }
            close_this_client = true;
        } else {
            victims.push(Arc::clone(other));
        }
        killed += 1;
    }

    for victim in victims {
        {
            let mut victim_state = victim.lock();
            schedule_close_locked(registry, &victim, &mut victim_state);
        }
        srv.slot(victim.iel).handle.wake();
    }

    let mut w = ReplyWriter::new(srv, client, state, false);
    if legacy {
        if killed == 0 {
            w.error("No such client");
        } else {
            w.status("OK");
        }
    } else {
        w.integer(killed);
    }
    drop(w);

    // The caller is flagged only after its reply is queued.
    if close_this_client {
        state.flags.close_after_reply = true;
    }
}

fn matches_kill_filters(
    id: u64,
    state: &ClientState,
    addr: &Option<String>,
    type_filter: Option<ClientType>,
    id_filter: u64,
) -> bool {
    if let Some(addr) = addr {
        if state.peer_id.as_deref() != Some(addr.as_str()) {
            return false;
        }
    }
    if let Some(t) = type_filter {
        if state.flags.client_type() != t {
            return false;
        }
    }
    if id_filter != 0 && id != id_filter {
        return false;
    }
    true
}

fn client_unblock(
    srv: &Server,
    registry: &mut Registry,
    client: &Arc<Client>,
    state: &mut ClientState,
    argv: &[Bytes],
) {
    let mut unblock_error = false;
    if argv.len() == 4 {
        match argv[3].to_ascii_lowercase().as_slice() {
            b"timeout" => unblock_error = false,
            b"error" => unblock_error = true,
            _ => {
                ReplyWriter::new(srv, client, state, false)
                    .error("CLIENT UNBLOCK reason should be TIMEOUT or ERROR");
                return;
            }
        }
    }
    let Some(id) = parse_i64(&argv[2]).filter(|v| *v > 0) else {
        ReplyWriter::new(srv, client, state, false)
            .error("value is not an integer or out of range");
        return;
    };

    let target = registry
        .lookup(id as u64)
        .filter(|t| !Arc::ptr_eq(*t, client))
        .cloned();
    let unblocked = match target {
        Some(target) => {
            let mut target_state = target.lock();
            if target_state.flags.blocked {
                {
                    let mut w = ReplyWriter::new(srv, &target, &mut target_state, true);
                    if unblock_error {
                        w.error("-UNBLOCKED client unblocked via CLIENT UNBLOCK");
                    } else {
                        w.null_array();
                    }
                }
                target_state.blocked = None;
                target_state.flags.blocked = false;
                if !target_state.flags.unblocked {
                    target_state.flags.unblocked = true;
                    drop(target_state);
                    let slot = srv.slot(target.iel);
                    slot.push_unblocked(Arc::clone(&target));
                    slot.handle.wake();
                }
                true
            } else {
                false
            }
        }
        None => false,
    };

    ReplyWriter::new(srv, client, state, false).integer(if unblocked { 1 } else { 0 });
}

fn client_tracking(
    srv: &Server,
    registry: &mut Registry,
    client: &Arc<Client>,
    state: &mut ClientState,
    argv: &[Bytes],
) {
    let mut redirect = 0u64;
    if argv.len() == 5 {
        if !argv[3].eq_ignore_ascii_case(b"redirect") {
            ReplyWriter::new(srv, client, state, false).error("syntax error");
            return;
        }
        match parse_i64(&argv[4]) {
            Some(v) if v > 0 => redirect = v as u64,
            _ => {
                ReplyWriter::new(srv, client, state, false)
                    .error("value is not an integer or out of range");
                return;
            }
        }
        if registry.lookup(redirect).is_none() {
            ReplyWriter::new(srv, client, state, false)
                .error("The client ID you want redirect to does not exist");
            return;
        }
    }

    match argv[2].to_ascii_lowercase().as_slice() {
        b"on" => tracking::enable(srv, state, redirect),
        b"off" => tracking::disable(srv, state),
        _ => {
            ReplyWriter::new(srv, client, state, false).error("syntax error");
            return;
        }
    }
    ReplyWriter::new(srv, client, state, false).status("OK");
}

/// Client names must be printable ASCII with no spaces so CLIENT LIST
/// stays splittable. An empty name unsets the current one.
fn validate_name(name: &[u8]) -> Result<Option<String>, &'static str> {
    if name.is_empty() {
        return Ok(None);
    }
    for &b in name {
        if !(b'!'..=b'~').contains(&b) {
            return Err("Client names cannot contain spaces, newlines or special characters.");
        }
    }
    Ok(Some(String::from_utf8_lossy(name).to_string()))
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<Server>, Arc<Client>, AtomicUsize) {
        let srv = Server::new(Config::for_tests());
        let client = Arc::new(Client::new(1, 0, 5, false, Instant::now()));
        client.lock().peer_id = Some("127.0.0.1:50000".to_string());
        let counter = AtomicUsize::new(0);
        srv.registry.lock().link(Arc::clone(&client), &counter);
        (srv, client, counter)
    }

    fn run(srv: &Server, client: &Arc<Client>, args: &[&[u8]]) -> Vec<u8> {
        let argv: Vec<Bytes> = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
        let mut registry = srv.registry.lock();
        let mut state = client.lock();
        super::client(srv, &mut registry, client, &mut state, &argv);
        let out = state.reply.flatten();
        state.reply = crate::client::reply::ReplySurface::new();
        state.flags.pending_write = false;
        drop(state);
        drop(registry);
        srv.slot(0).take_pending_writes();
        out
    }

    #[test]
    fn client_id_and_getname() {
        let (srv, client, _c) = setup();
        assert_eq!(run(&srv, &client, &[b"CLIENT", b"ID"]), b":1\r\n");
        assert_eq!(run(&srv, &client, &[b"CLIENT", b"GETNAME"]), b"$-1\r\n");
        assert_eq!(
            run(&srv, &client, &[b"CLIENT", b"SETNAME", b"worker-1"]),
            b"+OK\r\n"
        );
        assert_eq!(
            run(&srv, &client, &[b"CLIENT", b"GETNAME"]),
            b"$8\r\nworker-1\r\n"
        );
    }

    #[test]
    fn setname_rejects_spaces() {
        let (srv, client, _c) = setup();
        let out = run(&srv, &client, &[b"CLIENT", b"SETNAME", b"two words"]);
        assert!(out.starts_with(b"-ERR Client names cannot contain"));
    }

    #[test]
    fn reply_off_and_on() {
        let (srv, client, _c) = setup();
        assert_eq!(run(&srv, &client, &[b"CLIENT", b"REPLY", b"off"]), b"");
        assert!(client.lock().flags.reply_off);
        // ON must answer even though replies were off.
        let out = run(&srv, &client, &[b"CLIENT", b"REPLY", b"on"]);
        assert_eq!(out, b"+OK\r\n");
        assert!(!client.lock().flags.reply_off);
    }

    #[test]
    fn list_contains_flags_and_id() {
        let (srv, client, _c) = setup();
        let out = run(&srv, &client, &[b"CLIENT", b"LIST"]);
        let s = String::from_utf8_lossy(&out);
        assert!(s.contains("id=1"), "{s}");
        assert!(s.contains("addr=127.0.0.1:50000"), "{s}");
        assert!(s.contains("flags=N"), "{s}");
        assert!(s.contains("cmd=NULL"), "{s}");
    }

    #[test]
    fn kill_by_id_schedules_close() {
        let (srv, client, counter) = setup();
        let victim = Arc::new(Client::new(2, 0, 6, false, Instant::now()));
        victim.lock().peer_id = Some("127.0.0.1:50001".to_string());
        srv.registry.lock().link(Arc::clone(&victim), &counter);

        let out = run(&srv, &client, &[b"CLIENT", b"KILL", b"ID", b"2"]);
        assert_eq!(out, b":1\r\n");
        assert!(victim.lock().flags.close_asap);
        assert!(!client.lock().flags.close_after_reply);
    }

    #[test]
    fn kill_legacy_addr_can_kill_self() {
        let (srv, client, _c) = setup();
        let out = run(&srv, &client, &[b"CLIENT", b"KILL", b"127.0.0.1:50000"]);
        assert_eq!(out, b"+OK\r\n");
        assert!(client.lock().flags.close_after_reply);
    }

    #[test]
    fn kill_unmatched_addr_errors() {
        let (srv, client, _c) = setup();
        let out = run(&srv, &client, &[b"CLIENT", b"KILL", b"10.0.0.1:1"]);
        assert!(out.starts_with(b"-ERR No such client"));
    }

    #[test]
    fn unblock_blocked_client() {
        let (srv, client, counter) = setup();
        let blocked = Arc::new(Client::new(2, 0, 6, false, Instant::now()));
        {
            let mut st = blocked.lock();
            st.flags.blocked = true;
            st.blocked = Some(Default::default());
        }
        srv.registry.lock().link(Arc::clone(&blocked), &counter);

        let out = run(&srv, &client, &[b"CLIENT", b"UNBLOCK", b"2", b"ERROR"]);
        assert_eq!(out, b":1\r\n");
        let st = blocked.lock();
        assert!(!st.flags.blocked);
        assert!(st.flags.unblocked);
        // The reply was produced off the owner thread, so it sits in the
        // async scratch buffer until the integrator splices it.
        assert!(st.flags.pending_async_write);
        assert!(st
            .reply
            .scratch
            .starts_with(b"-UNBLOCKED client unblocked via CLIENT UNBLOCK"));

        let out = run(&srv, &client, &[b"CLIENT", b"UNBLOCK", b"99"]);
        assert_eq!(out, b":0\r\n");
    }

    #[test]
    fn tracking_redirect_must_exist() {
        let (srv, client, _c) = setup();
        let out = run(
            &srv,
            &client,
            &[b"CLIENT", b"TRACKING", b"on", b"REDIRECT", b"42"],
        );
        assert!(out.starts_with(b"-ERR The client ID you want redirect to does not exist"));
        let out = run(&srv, &client, &[b"CLIENT", b"TRACKING", b"on"]);
        assert_eq!(out, b"+OK\r\n");
        assert!(client.lock().flags.tracking);
        let out = run(&srv, &client, &[b"CLIENT", b"TRACKING", b"off"]);
        assert_eq!(out, b"+OK\r\n");
        assert!(!client.lock().flags.tracking);
    }

    #[test]
    fn hello_negotiates_resp3() {
        let (srv, client, _c) = setup();
        let argv: Vec<Bytes> = [b"HELLO".as_slice(), b"3"]
            .iter()
            .map(|a| Bytes::copy_from_slice(a))
            .collect();
        let mut state = client.lock();
        hello(&srv, &client, &mut state, &argv);
        assert_eq!(state.resp, 3);
        let out = state.reply.flatten();
        let s = String::from_utf8_lossy(&out);
        assert!(s.starts_with("%7\r\n"), "{s}");
        assert!(s.contains("$6\r\nserver\r\n$9\r\nturnstile\r\n"), "{s}");
        assert!(s.contains("$5\r\nproto\r\n:3\r\n"), "{s}");
    }

    #[test]
    fn hello_rejects_bad_version() {
        let (srv, client, _c) = setup();
        let argv: Vec<Bytes> = [b"HELLO".as_slice(), b"9"]
            .iter()
            .map(|a| Bytes::copy_from_slice(a))
            .collect();
        let mut state = client.lock();
        hello(&srv, &client, &mut state, &argv);
        assert!(state
            .reply
            .flatten()
            .starts_with(b"-NOPROTO unsupported protocol version"));
        assert_eq!(state.resp, 2);
    }
}
