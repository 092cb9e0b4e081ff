use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How to find the device among the attached serial ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Selector {
    /// Enumerate ports and pick the first one with the known usb ids.
    #[default]
    Auto,

    /// A fixed path.
    /// Likely "/dev/ttyACMx" or "COMx".
    Path(String),

    /// Enumerate ports and pick the first one with these usb ids.
    UsbId {
        /// Vendor id.
        vid: u16,

        /// Product id.
        pid: u16,
    },
}

/// How reconnect attempts are paced after a stream failure.
///
/// Delays grow exponentially from `initial_delay_ms` and are capped at
/// `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,

    /// Ceiling for the backoff, in milliseconds.
    pub max_delay_ms: u64,

    /// Give up after this many failed attempts.
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the first retry.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Ceiling for the backoff.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// The configuration for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Which device to connect to.
    pub selector: Selector,

    /// Baud rate.
    pub baud: u32,

    /// How long a request waits for its response unless the caller
    /// says otherwise, in milliseconds.
    pub response_timeout_ms: u64,

    /// Commands replayed, in order, after every successful connect or
    /// reconnect. Typically whatever enables the device's event
    /// reporting.
    pub init_commands: Vec<String>,

    /// Whether a lost connection is reestablished automatically.
    pub auto_reconnect: bool,

    /// Pacing for reconnect attempts.
    pub reconnect: ReconnectPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            selector: Selector::default(),
            baud: 115_200,
            response_timeout_ms: 1_000,
            init_commands: Vec::new(),
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Panics if the input is not valid .ron.
    pub fn deserialize(input: &str) -> Self {
        Self::ron().from_str::<Config>(input).unwrap()
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            selector: Selector::UsbId {
                vid: 0x1a86,
                pid: 0x55d3,
            },
            init_commands: vec!["km.buttons(1)".into()],
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Self {
        let s = std::fs::read_to_string(p).unwrap();

        Self::deserialize(&s)
    }

    /// How long a request waits for its response unless the caller
    /// says otherwise.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.baud == 0 {
            return Err(Error::BadConfig("Baud rate cannot be zero".into()));
        }

        if self.response_timeout_ms == 0 {
            return Err(Error::BadConfig(
                "The response timeout cannot be zero; a request must be able to expire".into(),
            ));
        }

        if self.reconnect.initial_delay_ms == 0 {
            return Err(Error::BadConfig(
                "Reconnecting with no delay would spin on a dead port".into(),
            ));
        }

        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(Error::BadConfig(format!(
                "Backoff ceiling ({} ms) is below the initial delay ({} ms)",
                self.reconnect.max_delay_ms, self.reconnect.initial_delay_ms
            )));
        }

        Ok(())
    }
}
