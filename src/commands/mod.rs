//! Command dispatch.
//!
//! The core serves connection plumbing; the command surface here is the
//! narrow set the plumbing itself needs (PING/ECHO for liveness, AUTH and
//! HELLO for the handshake, CLIENT for the admin surface, QUIT) plus the
//! cross-protocol-scripting guard. Anything else is an unknown command.

pub mod client_cmd;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::client::reply::ReplyWriter;
use crate::client::{Client, ClientState, Registry};
use crate::server::{schedule_close_locked, Server};

/// Run one parsed command. Called on the client's owner thread with the
/// global lock and the client lock held.
pub fn execute(
    srv: &Server,
    registry: &mut Registry,
    client: &Arc<Client>,
    state: &mut ClientState,
    argv: &[Bytes],
) {
    let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
    state.last_cmd = Some(name.clone());

    // HTTP verbs mean somebody is speaking cross-protocol at us; hang up
    // rather than let header lines be interpreted as commands.
    if name == "POST" || name == "HOST:" {
        security_warning(registry, client, state);
        return;
    }

    if srv.config.requirepass.is_some()
        && !state.flags.authenticated
        && !matches!(name.as_str(), "AUTH" | "HELLO" | "QUIT")
    {
        ReplyWriter::new(srv, client, state, false).error("-NOAUTH Authentication required.");
        return;
    }

    match name.as_str() {
        "PING" => ping(srv, client, state, argv),
        "ECHO" => echo(srv, client, state, argv),
        "QUIT" => {
            ReplyWriter::new(srv, client, state, false).status("OK");
            state.flags.close_after_reply = true;
        }
        "AUTH" => auth(srv, client, state, argv),
        "HELLO" => client_cmd::hello(srv, client, state, argv),
        "CLIENT" => client_cmd::client(srv, registry, client, state, argv),
        "COMMAND" => ReplyWriter::new(srv, client, state, false).array_len(0),
        _ => {
            let msg = format!(
                "unknown command '{}'",
                String::from_utf8_lossy(&argv[0]).escape_default()
            );
            ReplyWriter::new(srv, client, state, false).error(&msg);
        }
    }
}

fn ping(srv: &Server, client: &Arc<Client>, state: &mut ClientState, argv: &[Bytes]) {
    let mut w = ReplyWriter::new(srv, client, state, false);
    match argv.len() {
        1 => w.status("PONG"),
        2 => w.bulk(&argv[1]),
        _ => w.error("wrong number of arguments for 'ping' command"),
    }
}

fn echo(srv: &Server, client: &Arc<Client>, state: &mut ClientState, argv: &[Bytes]) {
    let mut w = ReplyWriter::new(srv, client, state, false);
    if argv.len() != 2 {
        w.error("wrong number of arguments for 'echo' command");
        return;
    }
    w.bulk(&argv[1]);
}

fn auth(srv: &Server, client: &Arc<Client>, state: &mut ClientState, argv: &[Bytes]) {
    let (user, pass) = match argv.len() {
        2 => (None, &argv[1]),
        3 => (Some(&argv[1]), &argv[2]),
        _ => {
            let mut w = ReplyWriter::new(srv, client, state, false);
            w.error("wrong number of arguments for 'auth' command");
            return;
        }
    };
    let ok = authenticate(srv, user.map(|u| &u[..]), pass);
    let mut w = ReplyWriter::new(srv, client, state, false);
    match ok {
        AuthResult::Ok => {
            drop(w);
            state.flags.authenticated = true;
            ReplyWriter::new(srv, client, state, false).status("OK");
        }
        AuthResult::NoPasswordSet => {
            w.error("Client sent AUTH, but no password is set.");
        }
        AuthResult::Wrong => {
            w.error("-WRONGPASS invalid username-password pair");
        }
    }
}

pub(crate) enum AuthResult {
    Ok,
    NoPasswordSet,
    Wrong,
}

/// Check credentials against the single configured default user.
pub(crate) fn authenticate(srv: &Server, user: Option<&[u8]>, pass: &[u8]) -> AuthResult {
    let Some(expected) = srv.config.requirepass.as_deref() else {
        return AuthResult::NoPasswordSet;
    };
    if let Some(user) = user {
        if user != b"default" {
            return AuthResult::Wrong;
        }
    }
    if pass == expected.as_bytes() {
        AuthResult::Ok
    } else {
        AuthResult::Wrong
    }
}

/// Close a connection that sent POST or Host:, logging at most once a
/// minute.
fn security_warning(registry: &mut Registry, client: &Arc<Client>, state: &mut ClientState) {
    static LAST_LOGGED_SECS: AtomicU64 = AtomicU64::new(0);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let last = LAST_LOGGED_SECS.load(Ordering::Relaxed);
    if now.saturating_sub(last) > 60 {
        LAST_LOGGED_SECS.store(now, Ordering::Relaxed);
        warn!(
            "possible SECURITY ATTACK detected: POST or Host: commands seen, likely a \
cross protocol scripting attempt; connection aborted"
        );
    }
    schedule_close_locked(registry, client, state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Instant;

    fn setup(requirepass: Option<&str>) -> (Arc<Server>, Arc<Client>) {
        let mut config = Config::for_tests();
        config.requirepass = requirepass.map(|s| s.to_string());
        let srv = Server::new(config);
        let client = Arc::new(Client::new(1, 0, 5, false, Instant::now()));
        client.lock().flags.authenticated = requirepass.is_none();
        (srv, client)
    }

    fn run(srv: &Server, client: &Arc<Client>, args: &[&[u8]]) -> Vec<u8> {
        let argv: Vec<Bytes> = args.iter().map(|a| Bytes::copy_from_slice(a)).collect();
        let mut registry = srv.registry.lock();
        let mut state = client.lock();
        execute(srv, &mut registry, client, &mut state, &argv);
        let out = state.reply.flatten();
        state.reply = crate::client::reply::ReplySurface::new();
        state.flags.pending_write = false;
        drop(state);
        srv.slot(0).take_pending_writes();
        out
    }

    #[test]
    fn ping_and_echo() {
        let (srv, client) = setup(None);
        assert_eq!(run(&srv, &client, &[b"PING"]), b"+PONG\r\n");
        assert_eq!(run(&srv, &client, &[b"ping", b"hey"]), b"$3\r\nhey\r\n");
        assert_eq!(run(&srv, &client, &[b"ECHO", b"x"]), b"$1\r\nx\r\n");
    }

    #[test]
    fn unknown_command_errors() {
        let (srv, client) = setup(None);
        let out = run(&srv, &client, &[b"NOPE"]);
        assert!(out.starts_with(b"-ERR unknown command 'NOPE'"));
    }

    #[test]
    fn quit_flags_close_after_reply() {
        let (srv, client) = setup(None);
        let out = run(&srv, &client, &[b"QUIT"]);
        assert_eq!(out, b"+OK\r\n");
        assert!(client.lock().flags.close_after_reply);
    }

    #[test]
    fn auth_flow() {
        let (srv, client) = setup(Some("hunter2"));
        let out = run(&srv, &client, &[b"PING"]);
        assert!(out.starts_with(b"-NOAUTH"));
        let out = run(&srv, &client, &[b"AUTH", b"wrong"]);
        assert!(out.starts_with(b"-WRONGPASS"));
        let out = run(&srv, &client, &[b"AUTH", b"hunter2"]);
        assert_eq!(out, b"+OK\r\n");
        assert_eq!(run(&srv, &client, &[b"PING"]), b"+PONG\r\n");
    }

    #[test]
    fn auth_with_username() {
        let (srv, client) = setup(Some("pw"));
        let out = run(&srv, &client, &[b"AUTH", b"default", b"pw"]);
        assert_eq!(out, b"+OK\r\n");
        let (srv, client) = setup(Some("pw"));
        let out = run(&srv, &client, &[b"AUTH", b"other", b"pw"]);
        assert!(out.starts_with(b"-WRONGPASS"));
    }

    #[test]
    fn post_closes_connection() {
        let (srv, client) = setup(None);
        let out = run(&srv, &client, &[b"POST", b"/", b"HTTP/1.1"]);
        assert_eq!(out, b"");
        assert!(client.lock().flags.close_asap);
    }
}
