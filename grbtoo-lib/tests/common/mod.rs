#![allow(dead_code)]
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use grbtoo::listener::ListenOpts;

pub const SWIFT_IVORN: &str = "ivo://nasa.gsfc.gcn/SWIFT#BAT_GRB_Pos_1034857-826";
pub const CLIENT_IVORN: &str = "ivo://grbtoo/test";

pub fn fixture_path(name: &str) -> PathBuf {
    let mut path =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    path.push("tests/fixtures");
    path.push(name);
    path
}

pub fn fixture(name: &str) -> Vec<u8> {
    std::fs::read(fixture_path(name)).unwrap()
}

/// The Swift fixture with its ivorn replaced.
pub fn swift_alert(ivorn: &str) -> Vec<u8> {
    String::from_utf8(fixture("swift_bat_grb_pos_ack.xml"))
        .unwrap()
        .replace(SWIFT_IVORN, ivorn)
        .into_bytes()
}

/// Listener options with timeouts short enough for tests.
pub fn opts(port: u16) -> ListenOpts {
    ListenOpts::builder()
        .host("127.0.0.1")
        .port(port)
        .ivorn(CLIENT_IVORN)
        .iamalive_timeout(Duration::from_secs(5))
        .max_reconnect_timeout(Duration::from_millis(200))
        .initial_backoff(Duration::from_millis(50))
        .poll_interval(Duration::from_millis(20))
        .connect_timeout(Duration::from_secs(1))
        .build()
}

pub fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Server side of a VTP feed, scripted from the test thread.
pub struct FakeServer {
    listener: TcpListener,
}

impl FakeServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        FakeServer { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Wait for the client to connect, panicking after `timeout`.
    pub fn accept(&self, timeout: Duration) -> TcpStream {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).unwrap();
                    stream
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .unwrap();
                    return stream;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "client did not connect");
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        }
    }
}

pub fn send_frame(stream: &mut TcpStream, payload: &[u8]) {
    let len = u32::try_from(payload.len()).unwrap();
    stream.write_all(&len.to_be_bytes()).unwrap();
    stream.write_all(payload).unwrap();
    stream.flush().unwrap();
}

pub fn read_frame(stream: &mut TcpStream) -> String {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut payload).unwrap();
    String::from_utf8(payload).unwrap()
}
