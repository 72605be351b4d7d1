//! Loopback round-trip tests: bind, connect, send, receive.

use muxsock::{Config, Context, Error, Event, Frame, SendOptions};
use std::net::IpAddr;
use std::time::{Duration, Instant};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn free_port() -> u16 {
    portpicker::pick_unused_port().expect("no free port on loopback")
}

fn test_context() -> Context {
    init_tracing();
    Context::new(Config::default().with_recv_timeout(Duration::from_secs(2)))
}

#[test]
fn frame_round_trip_over_loopback() {
    let ctx = test_context();
    let server = ctx.open().unwrap();
    let port = free_port();
    ctx.bind(server, localhost(), port).unwrap();

    let client = ctx.open().unwrap();
    let conn = ctx.connect(client, localhost(), port).unwrap();
    ctx.send(
        client,
        conn,
        Frame::new(&b"ping-pong!"[..]),
        SendOptions::default(),
    )
    .unwrap();

    match ctx.recv_event(server, true).unwrap() {
        Event::NewConnection(_) => {}
        other => panic!("expected connection event, got {other:?}"),
    }
    match ctx.recv_event(server, true).unwrap() {
        Event::NewFrame(frame) => assert_eq!(frame.payload().as_ref(), b"ping-pong!"),
        other => panic!("expected frame event, got {other:?}"),
    }

    ctx.close(client).unwrap();
    ctx.close(server).unwrap();
}

#[test]
fn frames_arrive_in_send_order() {
    let ctx = test_context();
    let server = ctx.open().unwrap();
    let port = free_port();
    ctx.bind(server, localhost(), port).unwrap();

    let client = ctx.open().unwrap();
    let conn = ctx.connect(client, localhost(), port).unwrap();
    for i in 0..32u8 {
        ctx.send(client, conn, Frame::new(vec![i; 3]), SendOptions::default())
            .unwrap();
    }

    match ctx.recv_event(server, true).unwrap() {
        Event::NewConnection(_) => {}
        other => panic!("expected connection event, got {other:?}"),
    }
    for i in 0..32u8 {
        match ctx.recv_event(server, true).unwrap() {
            Event::NewFrame(frame) => assert_eq!(frame.payload().as_ref(), &[i; 3][..]),
            other => panic!("expected frame {i}, got {other:?}"),
        }
    }

    ctx.close(client).unwrap();
    ctx.close(server).unwrap();
}

#[test]
fn large_frame_spans_multiple_reads() {
    let ctx = test_context();
    let server = ctx.open().unwrap();
    let port = free_port();
    ctx.bind(server, localhost(), port).unwrap();

    let client = ctx.open().unwrap();
    let conn = ctx.connect(client, localhost(), port).unwrap();

    // Far larger than one 1400-byte read chunk.
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    ctx.send(
        client,
        conn,
        Frame::new(payload.clone()),
        SendOptions::default(),
    )
    .unwrap();

    match ctx.recv_event(server, true).unwrap() {
        Event::NewConnection(_) => {}
        other => panic!("expected connection event, got {other:?}"),
    }
    match ctx.recv_event(server, true).unwrap() {
        Event::NewFrame(frame) => assert_eq!(frame.payload().as_ref(), payload.as_slice()),
        other => panic!("expected frame event, got {other:?}"),
    }

    ctx.close(client).unwrap();
    ctx.close(server).unwrap();
}

#[test]
fn peer_loss_makes_connection_zombie() {
    let ctx = test_context();
    let server = ctx.open().unwrap();
    let port = free_port();
    ctx.bind(server, localhost(), port).unwrap();

    let client = ctx.open().unwrap();
    ctx.connect(client, localhost(), port).unwrap();

    let conn = match ctx.recv_event(server, true).unwrap() {
        Event::NewConnection(conn) => conn,
        other => panic!("expected connection event, got {other:?}"),
    };

    // Drop the peer; the server-side connection goes zombie once the EOF
    // is seen, and sends start bouncing.
    ctx.close(client).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match ctx.send(server, conn, Frame::new(&b"x"[..]), SendOptions::dont_wait()) {
            Err(Error::InvalidState) => break,
            Ok(()) | Err(Error::WouldBlock) => {
                assert!(
                    Instant::now() < deadline,
                    "connection never recognized as dead"
                );
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(other) => panic!("unexpected send error: {other}"),
        }
    }

    // Zombies stay until explicitly reaped; reaping twice is a clean error.
    ctx.close_connection(server, conn).unwrap();
    assert!(matches!(
        ctx.close_connection(server, conn),
        Err(Error::InvalidHandle(_))
    ));

    ctx.close(server).unwrap();
}
