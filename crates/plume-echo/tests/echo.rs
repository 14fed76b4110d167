//! Loopback tests against a running server with the echo plugin.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use plume_core::{Block, Config, Server};
use plume_echo::{EchoPlugin, EchoShared};

fn start_echo(block: Block) -> (Server, Arc<EchoShared>) {
    let config = Config::new().work_threads(2).block(block);
    let plugin = EchoPlugin::new();
    let shared = plugin.shared();
    let mut server = Server::new(config, vec![Box::new(plugin)]).unwrap();
    server.start().unwrap();
    (server, shared)
}

fn connect(shared: &EchoShared) -> TcpStream {
    let port = shared.port().expect("echo is listening");
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

#[test]
fn test_fixed_reply_keeps_connection_usable() {
    let (server, shared) = start_echo(
        Block::new("echo")
            .directive("echo_port", ["0"])
            .directive("echo_str", ["PONG"]),
    );

    let mut client = connect(&shared);
    for msg in [&b"PING\n"[..], b"anything at all", b"x"] {
        client.write_all(msg).unwrap();
        let mut got = [0u8; 4];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"PONG");
    }

    drop(client);
    server.shutdown();
    server.join();
    assert_eq!(shared.stats.accepted.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[test]
fn test_plain_echo() {
    let (server, shared) = start_echo(Block::new("echo").directive("echo_port", ["0"]));

    let mut client = connect(&shared);
    for msg in ["hello", "plume echo"] {
        client.write_all(msg.as_bytes()).unwrap();
        let mut got = vec![0u8; msg.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, msg.as_bytes());
    }

    client.shutdown(std::net::Shutdown::Write).unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    server.shutdown();
    server.join();
}

#[test]
fn test_many_clients() {
    let (server, shared) = start_echo(Block::new("echo").directive("echo_port", ["0"]));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let mut client = connect(&shared);
                let msg = format!("client {i}");
                client.write_all(msg.as_bytes()).unwrap();
                let mut got = vec![0u8; msg.len()];
                client.read_exact(&mut got).unwrap();
                assert_eq!(got, msg.as_bytes());
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    server.shutdown();
    server.join();
}

#[test]
fn test_flooding_client_does_not_starve_others() {
    let (server, shared) = start_echo(
        Block::new("echo")
            .directive("echo_port", ["0"])
            .directive("echo_str", ["PONG"]),
    );

    let mut flood = connect(&shared);
    let writer = {
        let mut flood = flood.try_clone().unwrap();
        std::thread::spawn(move || {
            let chunk = [b'f'; 4096];
            for _ in 0..64 {
                flood.write_all(&chunk).unwrap();
            }
        })
    };

    let mut quiet = connect(&shared);
    quiet.write_all(b"PING").unwrap();
    let mut got = [0u8; 4];
    quiet.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"PONG");

    writer.join().unwrap();
    let mut got = [0u8; 4];
    flood.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"PONG");

    drop(flood);
    drop(quiet);
    server.shutdown();
    server.join();
}
