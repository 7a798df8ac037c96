use std::time::Duration;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Could not open a stream to the feed server.
    #[error("could not connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// No traffic from the server within the iamalive window.
    #[error("no traffic for {0:?}")]
    Timeout(Duration),

    /// IO failure on an open stream, including the peer closing it.
    #[error(transparent)]
    Stream(#[from] std::io::Error),

    /// A received payload could not be parsed into a document.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid position: {0}")]
    InvalidPosition(String),

    /// A device command failed.
    #[error("{device} failed to {command}: {reason}")]
    Device {
        device: String,
        command: String,
        reason: String,
    },

    #[error("invalid exposure plan: {0}")]
    Plan(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("rendering failed: {0}")]
    Render(String),

    #[error("listener is already running")]
    AlreadyRunning,

    #[error("listener task failed: {0}")]
    Task(String),
}

impl Error {
    /// Returns `true` if the error ends the current feed session, i.e., the stream must be
    /// closed and re-opened. Payload level errors only drop the offending packet.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::Timeout(_) | Error::Stream(_)
        )
    }

    /// Shorthand for [Error::Device], for use by device implementations.
    pub fn device<D: Into<String>, C: Into<String>, R: ToString>(
        device: D,
        command: C,
        reason: R,
    ) -> Self {
        Error::Device {
            device: device.into(),
            command: command.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<roxmltree::Error> for Error {
    fn from(err: roxmltree::Error) -> Self {
        Error::MalformedPayload(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_fatal_kinds() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_session_fatal());
        assert!(Error::Stream(std::io::ErrorKind::UnexpectedEof.into()).is_session_fatal());
        assert!(!Error::MalformedPayload("x".into()).is_session_fatal());
        assert!(!Error::InvalidPosition("x".into()).is_session_fatal());
    }
}
