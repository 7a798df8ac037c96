mod common;

use std::io::Read;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver};
use grbtoo::{
    listener::{ListenOpts, Listener, ListenerState},
    voevent::AlertDocument,
    Error,
};

use common::{
    fixture, opts, read_frame, send_frame, swift_alert, unused_port, FakeServer, CLIENT_IVORN,
    SWIFT_IVORN,
};

const WAIT: Duration = Duration::from_secs(5);

fn listener(
    opts: ListenOpts,
) -> (
    Listener<impl FnMut(&AlertDocument) + Send + 'static>,
    Receiver<String>,
) {
    let (tx, rx) = unbounded();
    let handler = move |alert: &AlertDocument| {
        tx.send(alert.ivorn.clone()).unwrap();
    };
    (Listener::new(opts, handler), rx)
}

#[test]
fn test_handshake_and_alerts_in_order() {
    let server = FakeServer::bind();
    let (mut listener, rx) = listener(opts(server.port()));
    listener.start().unwrap();
    assert_eq!(listener.state(), ListenerState::Running);

    let mut conn = server.accept(WAIT);

    send_frame(&mut conn, &fixture("iamalive.xml"));
    let reply = read_frame(&mut conn);
    assert!(reply.contains(r#"role="iamalive""#), "{reply}");
    assert!(
        reply.contains("<Origin>ivo://nasa.gsfc.tan/gcn</Origin>"),
        "{reply}"
    );
    assert!(
        reply.contains(&format!("<Response>{CLIENT_IVORN}</Response>")),
        "{reply}"
    );

    // dropped without a reply, the session continues
    send_frame(&mut conn, b"<voe:VOEvent ivorn=");

    send_frame(&mut conn, &fixture("swift_bat_grb_pos_ack.xml"));
    let ack = read_frame(&mut conn);
    assert!(ack.contains(r#"role="ack""#), "{ack}");
    assert!(ack.contains("<Origin>ivo://nasa.gsfc.gcn/SWIFT#BAT_GRB_Pos_1034857-826</Origin>"));

    let second = "ivo://nasa.gsfc.gcn/SWIFT#BAT_GRB_Pos_1034857-827";
    send_frame(&mut conn, &swift_alert(second));
    let ack = read_frame(&mut conn);
    assert!(ack.contains(second), "{ack}");

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SWIFT_IVORN);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), second);

    listener.stop().unwrap();
    assert_eq!(listener.state(), ListenerState::Stopped);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_reconnects_after_server_closes() {
    let server = FakeServer::bind();
    let (mut listener, rx) = listener(opts(server.port()));
    listener.start().unwrap();

    drop(server.accept(WAIT));

    let mut conn = server.accept(WAIT);
    send_frame(&mut conn, &fixture("swift_bat_grb_pos_ack.xml"));
    read_frame(&mut conn);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SWIFT_IVORN);

    listener.stop().unwrap();
}

#[test]
fn test_silent_server_times_out_and_reconnects() {
    let server = FakeServer::bind();
    let mut opts = opts(server.port());
    opts.iamalive_timeout = Duration::from_millis(200);
    let (mut listener, _rx) = listener(opts);
    listener.start().unwrap();

    let mut silent = server.accept(WAIT);
    let _second = server.accept(WAIT);

    // the dead session was shut down by the client
    let mut buf = [0u8; 1];
    assert_eq!(silent.read(&mut buf).unwrap(), 0);

    listener.stop().unwrap();
}

#[test]
fn test_stop_during_backoff_is_prompt_and_idempotent() {
    let mut opts = opts(unused_port());
    opts.initial_backoff = Duration::from_secs(30);
    opts.max_reconnect_timeout = Duration::from_secs(60);
    let (mut listener, _rx) = listener(opts);

    listener.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    listener.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
    assert_eq!(listener.state(), ListenerState::Stopped);
    listener.stop().unwrap();

    // restartable after a stop
    listener.start().unwrap();
    listener.stop().unwrap();
}

#[test]
fn test_stop_while_reading_is_prompt_and_closes_stream() {
    let server = FakeServer::bind();
    let mut opts = opts(server.port());
    opts.iamalive_timeout = Duration::from_secs(600);
    let (mut listener, _rx) = listener(opts);
    listener.start().unwrap();

    let mut conn = server.accept(WAIT);
    // let the client settle into its read loop on the silent stream
    std::thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    listener.stop().unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "{:?}",
        start.elapsed()
    );
    assert_eq!(listener.state(), ListenerState::Stopped);

    let mut buf = [0u8; 1];
    assert_eq!(conn.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_start_twice_fails() {
    let (mut listener, _rx) = listener(opts(unused_port()));
    listener.start().unwrap();

    let zult = listener.start();

    assert!(matches!(zult, Err(Error::AlreadyRunning)), "{zult:?}");
    listener.stop().unwrap();
}

#[test]
fn test_handler_panic_does_not_end_session() {
    let server = FakeServer::bind();
    let (tx, rx) = unbounded();
    let mut calls = 0;
    let handler = move |alert: &AlertDocument| {
        calls += 1;
        if calls == 1 {
            panic!("boom");
        }
        tx.send(alert.ivorn.clone()).unwrap();
    };
    let mut listener = Listener::new(opts(server.port()), handler);
    listener.start().unwrap();

    let mut conn = server.accept(WAIT);
    send_frame(&mut conn, &swift_alert("ivo://test/1"));
    read_frame(&mut conn);
    send_frame(&mut conn, &swift_alert("ivo://test/2"));
    read_frame(&mut conn);

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "ivo://test/2");
    listener.stop().unwrap();
}
