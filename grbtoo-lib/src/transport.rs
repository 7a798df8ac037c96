use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::{cancel::Flag, Error, Result};

/// Exponential reconnect delay.
///
/// The delay before retry `k` (1-based) after `k` consecutive failures is
/// `min(initial * 2^(k-1), max)`. [Backoff::reset] returns to `initial`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub const DEFAULT_INITIAL: Duration = Duration::from_secs(1);

    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt. Advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }
}

/// A byte stream to a feed server that knows when it last carried traffic.
pub trait FeedStream: Read + Write + Send {
    /// Returns `false` if nothing was received within `timeout`, in which case the stream must be
    /// considered dead.
    fn is_alive(&self, timeout: Duration) -> bool;
}

/// Opens connections to a single feed endpoint, retrying with exponential backoff.
#[derive(Debug)]
pub struct Connector {
    host: String,
    port: u16,
    backoff: Backoff,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl Connector {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new<S: Into<String>>(host: S, port: u16, max_backoff: Duration) -> Self {
        Connector {
            host: host.into(),
            port,
            backoff: Backoff::new(Backoff::DEFAULT_INITIAL, max_backoff),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_initial_backoff(mut self, initial: Duration) -> Self {
        self.backoff = Backoff::new(initial, self.backoff.max);
        self
    }

    /// Read timeout applied to opened connections. This bounds how long a read blocks before
    /// the reader can check liveness and cancellation.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Timeout for each connect attempt to a single resolved address.
    ///
    /// A connect attempt is not interrupted by a stop request, so a stop issued while
    /// connecting to an unreachable host takes up to this long per resolved address.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Make a single connection attempt.
    ///
    /// # Errors
    /// [Error::Connection] if the address does not resolve or every resolved address refuses
    /// or is unreachable.
    pub fn connect(&self) -> Result<Connection> {
        let addr = self.addr();
        let conn_err = |source| Error::Connection {
            addr: addr.clone(),
            source,
        };
        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "address resolved to nothing",
        );
        for sockaddr in (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(conn_err)?
        {
            match TcpStream::connect_timeout(&sockaddr, self.connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.poll_interval))
                        .map_err(conn_err)?;
                    return Ok(Connection::new(stream, addr.clone()));
                }
                Err(err) => {
                    debug!(%sockaddr, %err, "connect attempt failed");
                    last_err = err;
                }
            }
        }
        Err(conn_err(last_err))
    }

    /// Connect, retrying with exponential backoff until connected or `stop` is set.
    ///
    /// Returns `None` only if `stop` was observed. A successful connect resets the backoff.
    pub fn open(&mut self, stop: &Flag) -> Option<Connection> {
        loop {
            if stop.is_set() {
                return None;
            }
            match self.connect() {
                Ok(conn) => {
                    self.backoff.reset();
                    info!(addr = %conn.peer(), "connected");
                    return Some(conn);
                }
                Err(err) => {
                    let delay = self.backoff.next_delay();
                    warn!(%err, ?delay, "could not connect, will retry");
                    if stop.sleep(delay, self.poll_interval) {
                        return None;
                    }
                }
            }
        }
    }

    /// Wait out the current backoff delay after a dead session.
    ///
    /// Returns `true` if `stop` was set while waiting.
    pub fn wait(&mut self, stop: &Flag) -> bool {
        let delay = self.backoff.next_delay();
        debug!(?delay, "waiting before reconnect");
        stop.sleep(delay, self.poll_interval)
    }
}

/// An open connection to the feed server.
///
/// The connection is shut down in both directions and closed on [Connection::close] or when
/// dropped, whichever happens first.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: String,
    last_activity: Instant,
    closed: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: String) -> Self {
        Connection {
            stream,
            peer,
            last_activity: Instant::now(),
            closed: false,
        }
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Shut down and close the connection. Failures are logged, never returned.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => info!(addr = %self.peer, "closed socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => {
                info!(addr = %self.peer, "closed socket; peer already gone");
            }
            Err(err) => error!(addr = %self.peer, %err, "could not shut down socket"),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.stream.read(buf)?;
        if n > 0 {
            self.last_activity = Instant::now();
        }
        Ok(n)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl FeedStream for Connection {
    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() <= timeout
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn backoff_matches_closed_form() {
        let initial = Duration::from_millis(250);
        let max = Duration::from_secs(1024);
        let mut backoff = Backoff::new(initial, max);
        for k in 1..=20u32 {
            let expected = initial.saturating_mul(2u32.saturating_pow(k - 1)).min(max);
            assert_eq!(backoff.next_delay(), expected, "attempt {k}");
        }
    }

    #[test]
    fn backoff_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(1024));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_ceiling_below_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn connect_refused_is_connection_error() {
        let connector = Connector::new("127.0.0.1", unused_port(), Duration::from_secs(1));
        let zult = connector.connect();
        assert!(matches!(zult, Err(Error::Connection { .. })), "{zult:?}");
    }

    #[test]
    fn connect_to_unreachable_host_is_bounded() {
        // TEST-NET-1, never routed
        let connector = Connector::new("192.0.2.1", 8099, Duration::from_secs(1))
            .with_connect_timeout(Duration::from_millis(200));
        assert_eq!(connector.connect_timeout(), Duration::from_millis(200));

        let start = Instant::now();
        let zult = connector.connect();

        assert!(matches!(zult, Err(Error::Connection { .. })), "{zult:?}");
        assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
    }

    #[test]
    fn connect_succeeds_and_tracks_activity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"x").unwrap();
        });

        let connector = Connector::new("127.0.0.1", port, Duration::from_secs(1))
            .with_poll_interval(Duration::from_millis(50));
        let mut conn = connector.connect().unwrap();
        let before = conn.last_activity();
        std::thread::sleep(Duration::from_millis(10));
        let mut buf = [0u8; 1];
        assert_eq!(conn.read(&mut buf).unwrap(), 1);
        assert!(conn.last_activity() > before);
        assert!(conn.is_alive(Duration::from_secs(1)));
        conn.close();
        handle.join().unwrap();
    }

    #[test]
    fn silent_connection_goes_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = Connector::new("127.0.0.1", port, Duration::from_secs(1));
        let conn = connector.connect().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!conn.is_alive(Duration::from_millis(10)));
        drop(listener);
    }

    #[test]
    fn open_returns_none_when_stopped_during_backoff() {
        let mut connector = Connector::new("127.0.0.1", unused_port(), Duration::from_secs(60))
            .with_initial_backoff(Duration::from_secs(30))
            .with_poll_interval(Duration::from_millis(20));
        let stop = Flag::new();
        let setter = stop.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            setter.set();
        });
        let start = Instant::now();
        assert!(connector.open(&stop).is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
