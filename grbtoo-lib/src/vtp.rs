//! VOEvent Transport Protocol client side.
//!
//! Each message on the wire is a 4-byte big-endian length followed by that many bytes of XML.
//! The client answers `iamalive` transport messages with its own `iamalive` and acknowledges
//! every VOEvent with an `ack` receipt before handing it to the [Handler].
use std::io::{ErrorKind, Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, trace};

use crate::{
    cancel::Flag,
    transport::FeedStream,
    voevent::{transport_response, AlertDocument, Message},
    Error, Result,
};

/// Frames larger than this cannot be legitimate notices and mean framing is lost.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_SIZE: usize = 4;

/// Receives each alert document as it arrives on the stream.
pub trait Handler: Send {
    fn handle(&mut self, alert: &AlertDocument);
}

impl<F> Handler for F
where
    F: FnMut(&AlertDocument) + Send,
{
    fn handle(&mut self, alert: &AlertDocument) {
        self(alert);
    }
}

/// What a single ingested packet turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// Server liveness ping, answered.
    IAmAlive,
    /// VOEvent with the contained ivorn, acknowledged and handed to the handler.
    Alert(String),
    /// Well-formed but not actionable, e.g., an unknown transport role.
    Ignored,
}

/// Reads framed messages off a feed stream and acts on them.
pub struct Ingestor<S> {
    stream: S,
    ivorn: String,
    iamalive_timeout: Duration,
    buf: Vec<u8>,
}

impl<S: FeedStream> Ingestor<S> {
    /// `ivorn` identifies this client in responses. If nothing arrives within
    /// `iamalive_timeout` the stream is declared dead.
    pub fn new<I: Into<String>>(stream: S, ivorn: I, iamalive_timeout: Duration) -> Self {
        Ingestor {
            stream,
            ivorn: ivorn.into(),
            iamalive_timeout,
            buf: Vec::default(),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Read and handle exactly one packet, waiting as long as the stream stays alive.
    ///
    /// Returns `Ok(None)` if `stop` was set before a packet arrived.
    ///
    /// # Errors
    /// [Error::Timeout] if the stream goes silent, [Error::Stream] on IO failure or if the
    /// server closed the stream, and [Error::MalformedPayload] if the packet could not be
    /// parsed. Only the latter leaves the stream usable.
    pub fn ingest_one<H: Handler + ?Sized>(
        &mut self,
        handler: &mut H,
        stop: &Flag,
    ) -> Result<Option<Received>> {
        while !stop.is_set() {
            if let Some(received) = self.poll(handler)? {
                return Ok(Some(received));
            }
        }
        Ok(None)
    }

    /// Wait at most one read timeout of the underlying stream for a packet and handle it.
    ///
    /// Returns `Ok(None)` if no complete packet is available yet.
    ///
    /// # Errors
    /// See [Ingestor::ingest_one].
    pub fn poll<H: Handler + ?Sized>(&mut self, handler: &mut H) -> Result<Option<Received>> {
        match self.poll_frame()? {
            Some(payload) => self.handle_payload(&payload, handler).map(Some),
            None => Ok(None),
        }
    }

    fn poll_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(frame) = self.take_frame()? {
            return Ok(Some(frame));
        }
        let mut chunk = [0u8; 8192];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(Error::Stream(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed by server",
            ))),
            Ok(n) => {
                trace!(bytes = n, "read");
                self.buf.extend_from_slice(&chunk[..n]);
                self.take_frame()
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if self.stream.is_alive(self.iamalive_timeout) {
                    Ok(None)
                } else {
                    Err(Error::Timeout(self.iamalive_timeout))
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(Error::Stream(err)),
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < LEN_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Stream(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
            )));
        }
        if self.buf.len() < LEN_SIZE + len {
            return Ok(None);
        }
        let frame = self.buf[LEN_SIZE..LEN_SIZE + len].to_vec();
        self.buf.drain(..LEN_SIZE + len);
        Ok(Some(frame))
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            Error::Stream(std::io::Error::new(
                ErrorKind::InvalidInput,
                "response too large",
            ))
        })?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(payload.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }

    fn handle_payload<H: Handler + ?Sized>(
        &mut self,
        payload: &[u8],
        handler: &mut H,
    ) -> Result<Received> {
        debug!(bytes = payload.len(), "received packet");
        trace!(payload = %String::from_utf8_lossy(payload), "packet payload");

        match Message::parse(payload)? {
            Message::Transport(msg) => match msg.role.as_deref() {
                Some("iamalive") => {
                    debug!("received iamalive message");
                    let origin = msg.origin.unwrap_or_default();
                    let response =
                        transport_response("iamalive", &origin, &self.ivorn, Utc::now())?;
                    self.send(&response)?;
                    debug!("sent iamalive response");
                    Ok(Received::IAmAlive)
                }
                Some(role) => {
                    error!(role, "received transport message with unrecognized role");
                    Ok(Received::Ignored)
                }
                None => {
                    error!("received transport message without a role");
                    Ok(Received::Ignored)
                }
            },
            Message::VOEvent(alert) => {
                info!(ivorn = %alert.ivorn, packet_type = alert.packet_type, "received VOEvent");
                let receipt = transport_response("ack", &alert.ivorn, &self.ivorn, Utc::now())?;
                self.send(&receipt)?;
                debug!(ivorn = %alert.ivorn, "sent receipt response");

                if catch_unwind(AssertUnwindSafe(|| handler.handle(&alert))).is_err() {
                    error!(ivorn = %alert.ivorn, "panic in payload handler");
                }
                Ok(Received::Alert(alert.ivorn))
            }
            Message::Unknown(tag) => {
                error!(%tag, "received XML document with unrecognized root tag");
                Ok(Received::Ignored)
            }
        }
    }
}
