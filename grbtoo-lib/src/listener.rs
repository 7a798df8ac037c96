use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::{
    cancel::Flag,
    transport::{Backoff, Connector},
    vtp::{Handler, Ingestor},
    Error, Result,
};

/// Client ivorn used when none is configured.
pub const DEFAULT_IVORN: &str = "ivo://python_voeventclient/anonymous";

/// Options for connecting to and listening on a VOEvent feed.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ListenOpts {
    #[builder(setter(into))]
    pub host: String,
    pub port: u16,
    /// Identifies this client to the server.
    #[builder(setter(into), default = DEFAULT_IVORN.to_string())]
    pub ivorn: String,
    /// Silence on the stream longer than this means the connection is dead.
    #[builder(default = Duration::from_secs(150))]
    pub iamalive_timeout: Duration,
    /// Ceiling for the reconnect backoff.
    #[builder(default = Duration::from_secs(1024))]
    pub max_reconnect_timeout: Duration,
    #[builder(default = Backoff::DEFAULT_INITIAL)]
    pub initial_backoff: Duration,
    /// Upper bound on how long the listener goes without checking for a stop request.
    #[builder(default = Connector::DEFAULT_POLL_INTERVAL)]
    pub poll_interval: Duration,
    /// Timeout of a single connect attempt. A stop requested while connecting waits for the
    /// attempt in progress, so this also bounds stop latency when the server is unreachable.
    #[builder(default = Connector::DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Running,
    StopRequested,
}

/// Background task that keeps a feed connection open and hands every received alert to a
/// [Handler].
///
/// The task alone owns the connection. Alerts are handled one at a time, in arrival order, on
/// the task's thread.
///
/// # Example
/// ```no_run
/// use grbtoo::listener::{Listener, ListenOpts};
/// use grbtoo::voevent::AlertDocument;
///
/// let opts = ListenOpts::builder().host("68.169.57.253").port(8099).build();
/// let mut listener = Listener::new(opts, |alert: &AlertDocument| println!("{}", alert.ivorn));
/// listener.start().unwrap();
/// // ...
/// listener.stop().unwrap();
/// ```
pub struct Listener<H: Handler + 'static> {
    opts: ListenOpts,
    handler: Option<H>,
    stop: Flag,
    worker: Option<JoinHandle<H>>,
}

impl<H: Handler + 'static> Listener<H> {
    pub fn new(opts: ListenOpts, handler: H) -> Self {
        Listener {
            opts,
            handler: Some(handler),
            stop: Flag::new(),
            worker: None,
        }
    }

    #[must_use]
    pub fn opts(&self) -> &ListenOpts {
        &self.opts
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        match (&self.worker, self.stop.is_set()) {
            (None, _) => ListenerState::Stopped,
            (Some(_), false) => ListenerState::Running,
            (Some(_), true) => ListenerState::StopRequested,
        }
    }

    /// Handle that requests a stop from any thread without waiting for it. Use
    /// [Listener::stop] to wait for the task to exit.
    #[must_use]
    pub fn stop_handle(&self) -> Flag {
        self.stop.clone()
    }

    /// Start the background task.
    ///
    /// # Errors
    /// [Error::AlreadyRunning] if the task is running, or [Error::Task] if the handler was lost
    /// to an earlier task failure or the thread could not be spawned.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let handler = self
            .handler
            .take()
            .ok_or_else(|| Error::Task("handler lost by a previous listener task".into()))?;
        self.stop.clear();

        let opts = self.opts.clone();
        let stop = self.stop.clone();
        let worker = thread::Builder::new()
            .name("gcn::listen".into())
            .spawn(move || listen(&opts, handler, &stop))
            .map_err(|err| Error::Task(format!("failed to spawn listener: {err}")))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Request a stop and wait for the task to exit. Calling this when already stopped is a
    /// no-op.
    ///
    /// # Errors
    /// [Error::Task] if the task panicked, in which case the handler is lost.
    pub fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.stop.set();
        let zult = worker.join();
        self.stop.clear();
        match zult {
            Ok(handler) => {
                self.handler = Some(handler);
                Ok(())
            }
            Err(_) => Err(Error::Task("listener task panicked".into())),
        }
    }
}

impl<H: Handler + 'static> Drop for Listener<H> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(%err, "listener did not stop cleanly");
        }
    }
}

fn listen<H: Handler>(opts: &ListenOpts, mut handler: H, stop: &Flag) -> H {
    let mut connector = Connector::new(&opts.host, opts.port, opts.max_reconnect_timeout)
        .with_initial_backoff(opts.initial_backoff)
        .with_poll_interval(opts.poll_interval)
        .with_connect_timeout(opts.connect_timeout);
    info!(addr = %connector.addr(), ivorn = %opts.ivorn, "listening");

    while let Some(conn) = connector.open(stop) {
        let mut ingestor = Ingestor::new(conn, &opts.ivorn, opts.iamalive_timeout);
        let fault = loop {
            if stop.is_set() {
                break None;
            }
            match ingestor.poll(&mut handler) {
                Ok(_) => {}
                Err(err) if err.is_session_fatal() => break Some(err),
                Err(err) => warn!(%err, "dropping packet"),
            }
        };
        ingestor.into_inner().close();

        match fault {
            None => break,
            Some(Error::Timeout(window)) => warn!(?window, "timed out"),
            Some(err) => error!(%err, "socket error"),
        }
        if connector.wait(stop) {
            break;
        }
    }

    debug!("gcn::listen thread exit");
    handler
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voevent::AlertDocument;

    #[test]
    fn opts_defaults() {
        let opts = ListenOpts::builder().host("localhost").port(8099).build();
        assert_eq!(opts.ivorn, DEFAULT_IVORN);
        assert_eq!(opts.iamalive_timeout, Duration::from_secs(150));
        assert_eq!(opts.max_reconnect_timeout, Duration::from_secs(1024));
        assert_eq!(opts.initial_backoff, Duration::from_secs(1));
        assert_eq!(opts.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn stop_when_never_started_is_noop() {
        let opts = ListenOpts::builder().host("localhost").port(1).build();
        let mut listener = Listener::new(opts, |_: &AlertDocument| {});
        assert_eq!(listener.state(), ListenerState::Stopped);
        listener.stop().unwrap();
        listener.stop().unwrap();
        assert_eq!(listener.state(), ListenerState::Stopped);
    }
}
