use std::io;

use thiserror::Error;

use crate::frame::Tag;

/// Errors that may occur in this library.
///
/// None of these are fatal to the process: timeouts are scoped to the
/// one request that timed out, protocol problems to the one line that
/// did not parse, and connection losses to the session.
#[derive(Debug, Error)]
pub enum Error {
    /// No attached device matched the configured selector.
    #[error("No device found matching `{0}`")]
    DeviceNotFound(String),

    /// The port exists but we may not open it.
    #[error("Permission denied opening `{0}`")]
    PermissionDenied(String),

    /// The port could not be opened.
    #[error("Could not open `{port}`: {problem}")]
    Open {
        /// The port we tried to open.
        port: String,

        /// What went wrong.
        problem: String,
    },

    /// Connect was called on a session that is not disconnected.
    #[error("Session is already connected")]
    AlreadyConnected,

    /// A send was attempted while no connection is up.
    #[error("Not connected")]
    NotConnected,

    /// A request was submitted under a tag that is still pending.
    #[error("Tag {0} is already pending")]
    DuplicateTag(Tag),

    /// The request received no response within its timeout.
    #[error("Request {0} timed out")]
    Timeout(Tag),

    /// An untagged request received no plain response within its timeout.
    #[error("Untagged request timed out")]
    PlainTimeout,

    /// The connection went away while the request was pending.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A line from the device could not be parsed.
    #[error("Protocol problem: {0}")]
    Protocol(String),

    /// The configuration does not make sense.
    #[error("Bad config: {0}")]
    BadConfig(String),

    /// Underlying IO problem.
    #[error("IO problem")]
    Io(#[from] io::Error),
}
