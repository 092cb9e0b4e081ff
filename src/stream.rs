use std::io;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;

/// A duplex byte channel to the device.
///
/// The session never cares what the transport is; anything readable and
/// writable qualifies. See [`crate::serial`] for the real one and
/// [`crate::mock`] for the in-memory one.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Opens byte streams on demand.
///
/// The session holds one of these so it can reopen the transport when
/// the device reappears after an unplug, without knowing how opening
/// works.
pub trait StreamFactory: Send + Sync {
    /// Open a fresh stream to the device.
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ByteStream>, Error>>;
}

/// Problems on a live stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Underlying IO problem.
    #[error("Underlying IO problem")]
    Io(#[from] io::Error),

    /// The stream reached end of input: the device went away.
    #[error("Stream closed")]
    Closed,
}
