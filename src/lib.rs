#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// Command and response framing: tags, classification of incoming lines.
pub mod frame;

/// Matches responses to in-flight requests and times out stale ones.
pub mod correlator;

/// The background read loop for a connected stream.
pub(crate) mod listener;

/// Device state cache and event observers.
pub mod events;

/// The session: connection state machine, reconnect supervisor,
/// and the send entry points.
pub mod session;

/// The byte stream the device is reached through, as a trait,
/// so transports can be injected.
pub mod stream;

/// Serial port transport: device discovery and opening.
pub mod serial;

/// An in-memory transport, useful to test against without hardware.
pub mod mock;

/// Relates to configuration.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
