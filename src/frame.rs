//! The wire protocol is line oriented.
//!
//! Outgoing commands optionally carry a correlation tag suffix:
//! `km.move(10,5)#00042`.
//! Incoming lines are one of three kinds:
//!
//! - a tracked response, carrying the tag back: `>>> #00042:ok`,
//! - an event, starting with the event sentinel: `@button:0:1`,
//! - anything else, which is a plain response.

use std::{
    fmt::Display,
    str::FromStr,
    sync::atomic::{AtomicU32, Ordering},
};

/// Marks a line as a response from the device.
pub const RESPONSE_SENTINEL: &str = ">>>";

/// Marks a line as an unsolicited device event.
pub const EVENT_SENTINEL: char = '@';

/// Separates a command (or response sentinel) from its tag.
pub const TAG_SEPARATOR: char = '#';

/// Separates a response tag from its payload.
pub const TAG_PAYLOAD_SEPARATOR: char = ':';

/// Tags wrap after this many values.
/// Far more than any realistic number of concurrently pending requests.
const TAG_SPACE: u32 = 100_000;

/// A correlation tag: an opaque token appended to a command so the
/// eventual response can be matched back to the request that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u32);

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

impl FromStr for Tag {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<u32> for Tag {
    fn from(value: u32) -> Self {
        Self(value % TAG_SPACE)
    }
}

/// Hands out tags from a monotonically increasing counter,
/// wrapping within the tag space.
///
/// Uniqueness holds as long as fewer than the whole tag space of
/// requests are pending at once, which the driver does not get
/// anywhere near.
#[derive(Debug, Default)]
pub struct TagGenerator {
    next: AtomicU32,
}

impl TagGenerator {
    /// Create a generator starting at tag zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next tag.
    pub fn next_tag(&self) -> Tag {
        Tag::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// One decoded unit from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A response without a tag.
    /// Matched to the oldest pending untagged request.
    Plain(String),

    /// A response carrying the tag of the request it answers.
    Tracked {
        /// The tag echoed back by the device.
        tag: Tag,

        /// The response payload.
        payload: String,
    },

    /// An unsolicited device event, or a line we could not make sense
    /// of (those are logged and discarded downstream, never dropped
    /// silently here).
    Event(String),
}

/// Serialize an outgoing command, appending the tag suffix if one is
/// given. The line delimiter is the codec's business, not ours.
pub fn encode(command: &str, tag: Option<Tag>) -> String {
    match tag {
        Some(tag) => format!("{command}{TAG_SEPARATOR}{tag}"),
        None => command.to_string(),
    }
}

/// Classify one incoming line.
pub fn decode(line: &str) -> Frame {
    let line = line.trim_end_matches('\r');

    if let Some(payload) = line.strip_prefix(EVENT_SENTINEL) {
        return Frame::Event(payload.to_string());
    }

    if let Some(rest) = line.strip_prefix(RESPONSE_SENTINEL) {
        let rest = rest.trim_start();

        if let Some(tagged) = rest.strip_prefix(TAG_SEPARATOR) {
            return match tagged.split_once(TAG_PAYLOAD_SEPARATOR) {
                Some((tag, payload)) => match tag.parse() {
                    Ok(tag) => Frame::Tracked {
                        tag,
                        payload: payload.to_string(),
                    },
                    // A tag we cannot parse: malformed.
                    Err(_) => Frame::Event(line.to_string()),
                },
                // A tag separator with no payload separator: malformed.
                None => Frame::Event(line.to_string()),
            };
        }

        // The sentinel without a tag is a plain response;
        // the sentinel itself is not part of the payload.
        return Frame::Plain(rest.to_string());
    }

    Frame::Plain(line.to_string())
}
