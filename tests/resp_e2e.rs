//! End-to-end tests against a live server on an ephemeral port.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use turnstile::client::reply::ReplyWriter;
use turnstile::config::Config;
use turnstile::server::{self, ServerHandle};

fn start_server(threads: usize) -> ServerHandle {
    let mut config = Config::for_tests();
    config.threads = threads;
    server::spawn(config).expect("server spawn")
}

fn connect(handle: &ServerHandle) -> TcpStream {
    let stream = TcpStream::connect(handle.addr()).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    stream
}

/// Read until `expected` bytes arrived or the deadline passes.
fn read_bytes(stream: &mut TcpStream, expected: usize, deadline: Duration) -> Vec<u8> {
    let start = Instant::now();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while out.len() < expected && start.elapsed() < deadline {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => panic!("read error: {e}"),
        }
    }
    out
}

#[test]
fn s1_multibulk_ping() {
    let handle = start_server(1);
    let mut c = connect(&handle);
    c.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
    let reply = read_bytes(&mut c, 7, Duration::from_secs(2));
    assert_eq!(reply, b"+PONG\r\n");
    handle.shutdown();
}

#[test]
fn s2_inline_ping() {
    let handle = start_server(1);
    let mut c = connect(&handle);
    c.write_all(b"PING\r\n").unwrap();
    let reply = read_bytes(&mut c, 7, Duration::from_secs(2));
    assert_eq!(reply, b"+PONG\r\n");
    handle.shutdown();
}

#[test]
fn s3_pipelined_pings_stay_ordered() {
    let handle = start_server(1);
    let mut c = connect(&handle);
    c.write_all(b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n")
        .unwrap();
    let reply = read_bytes(&mut c, 14, Duration::from_secs(2));
    assert_eq!(reply, b"+PONG\r\n+PONG\r\n");
    handle.shutdown();
}

#[test]
fn s4_invalid_multibulk_length_closes_connection() {
    let handle = start_server(1);
    let mut c = connect(&handle);
    c.write_all(b"*-1\r\n*9999999\r\n").unwrap();
    let expected = b"-ERR Protocol error: invalid multibulk length\r\n";
    let reply = read_bytes(&mut c, expected.len(), Duration::from_secs(2));
    assert_eq!(reply, expected);

    // The server hangs up once the error has been flushed.
    let start = Instant::now();
    let mut closed = false;
    let mut buf = [0u8; 64];
    while start.elapsed() < Duration::from_secs(2) {
        match c.read(&mut buf) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(_) => {
                closed = true;
                break;
            }
        }
    }
    assert!(closed, "connection was not closed after the protocol error");
    handle.shutdown();
}

#[test]
fn s5_hello_switches_null_form() {
    let handle = start_server(1);
    let mut c = connect(&handle);

    // RESP2 null first.
    c.write_all(b"*2\r\n$6\r\nCLIENT\r\n$7\r\nGETNAME\r\n").unwrap();
    let reply = read_bytes(&mut c, 5, Duration::from_secs(2));
    assert_eq!(reply, b"$-1\r\n");

    c.write_all(b"*2\r\n$5\r\nHELLO\r\n$1\r\n3\r\n").unwrap();
    // The HELLO reply is a 7-entry map; drain until the trailing empty
    // modules array arrives.
    let start = Instant::now();
    let mut hello = Vec::new();
    let mut buf = [0u8; 4096];
    while start.elapsed() < Duration::from_secs(2) && !hello.ends_with(b"*0\r\n") {
        match c.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hello.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => panic!("read error: {e}"),
        }
    }
    assert!(hello.starts_with(b"%7\r\n"), "{:?}", hello);

    // The same nil now uses the RESP3 native form.
    c.write_all(b"*2\r\n$6\r\nCLIENT\r\n$7\r\nGETNAME\r\n").unwrap();
    let reply = read_bytes(&mut c, 3, Duration::from_secs(2));
    assert_eq!(reply, b"_\r\n");
    handle.shutdown();
}

#[test]
fn s6_client_pause_delays_processing() {
    let handle = start_server(1);
    let mut x = connect(&handle);
    let mut y = connect(&handle);

    x.write_all(b"*3\r\n$6\r\nCLIENT\r\n$5\r\nPAUSE\r\n$3\r\n300\r\n")
        .unwrap();
    let reply = read_bytes(&mut x, 5, Duration::from_secs(2));
    assert_eq!(reply, b"+OK\r\n");

    let start = Instant::now();
    y.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
    let reply = read_bytes(&mut y, 7, Duration::from_secs(5));
    let elapsed = start.elapsed();
    assert_eq!(reply, b"+PONG\r\n");
    assert!(
        elapsed >= Duration::from_millis(200),
        "reply arrived after only {elapsed:?}"
    );
    handle.shutdown();
}

#[test]
fn big_bulk_argument_roundtrips() {
    let handle = start_server(1);
    let mut c = connect(&handle);
    let payload = vec![b'q'; 48 * 1024];
    let mut request = format!("*2\r\n$4\r\nECHO\r\n${}\r\n", payload.len()).into_bytes();
    request.extend_from_slice(&payload);
    request.extend_from_slice(b"\r\n");
    c.write_all(&request).unwrap();

    let header = format!("${}\r\n", payload.len()).into_bytes();
    let expected = header.len() + payload.len() + 2;
    let reply = read_bytes(&mut c, expected, Duration::from_secs(5));
    assert_eq!(reply.len(), expected);
    assert!(reply.starts_with(&header));
    assert_eq!(&reply[header.len()..header.len() + payload.len()], &payload[..]);
    handle.shutdown();
}

#[test]
fn async_reply_is_spliced_after_sync_bytes() {
    let handle = start_server(2);
    let mut c = connect(&handle);

    // Queue a normal reply first so ordering is observable.
    c.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
    let reply = read_bytes(&mut c, 7, Duration::from_secs(2));
    assert_eq!(reply, b"+PONG\r\n");

    // Find the connected client's shared record.
    let client: Arc<turnstile::client::Client> = {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            {
                let registry = handle.srv.registry.lock();
                if let Some(c) = registry.clients.first() {
                    break Arc::clone(c);
                }
            }
            assert!(Instant::now() < deadline, "client never registered");
            std::thread::sleep(Duration::from_millis(10));
        }
    };

    // This test thread runs no event loop, so the writer takes the
    // scratch path and the owner thread splices and flushes it.
    {
        let mut state = client.lock();
        let mut w = ReplyWriter::new(&handle.srv, &client, &mut state, true);
        w.push_len(2);
        w.bulk(b"invalidate");
        w.integer(99);
    }

    let expected: &[u8] = b"*2\r\n$10\r\ninvalidate\r\n:99\r\n";
    let reply = read_bytes(&mut c, expected.len(), Duration::from_secs(5));
    assert_eq!(reply, expected);
    handle.shutdown();
}

#[test]
fn maxclients_admission_control() {
    let mut config = Config::for_tests();
    config.threads = 1;
    config.maxclients = 1;
    let handle = server::spawn(config).expect("server spawn");

    let mut first = connect(&handle);
    first.write_all(b"PING\r\n").unwrap();
    assert_eq!(read_bytes(&mut first, 7, Duration::from_secs(2)), b"+PONG\r\n");

    let mut second = connect(&handle);
    let reply = read_bytes(&mut second, 16, Duration::from_secs(2));
    assert!(
        reply.starts_with(b"-ERR max number of clients reached"),
        "{:?}",
        String::from_utf8_lossy(&reply)
    );
    handle.shutdown();
}

#[test]
fn random_dispatch_serves_connections() {
    let mut config = Config::for_tests();
    config.threads = 3;
    config.dispatch = turnstile::config::DispatchPolicy::Random;
    let handle = server::spawn(config).expect("server spawn");

    for _ in 0..8 {
        let mut c = connect(&handle);
        c.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_bytes(&mut c, 7, Duration::from_secs(2)), b"+PONG\r\n");
    }
    handle.shutdown();
}
