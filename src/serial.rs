use futures::future::BoxFuture;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::{
    config::{Config, Selector},
    error::Error,
    stream::{ByteStream, StreamFactory},
};

/// Codecs for encoding/decoding messages to/from wire.
pub mod codecs;

/// Vendor id of the usb-serial bridge the supported devices ship with.
pub const DEFAULT_VID: u16 = 0x1a86;

/// Product id of the usb-serial bridge the supported devices ship with.
pub const DEFAULT_PID: u16 = 0x55d3;

/// Opens serial port streams to the device.
///
/// Depending on the [`Selector`] this either opens a fixed path
/// (`/dev/ttyACM0` on unix, `COM3` on Windows) or enumerates attached
/// ports and picks the first one matching the wanted usb vendor and
/// product ids.
#[derive(Debug, Clone)]
pub struct SerialFactory {
    selector: Selector,
    baud: u32,
}

impl SerialFactory {
    /// A factory opening ports per the given selector.
    pub fn new(selector: Selector, baud: u32) -> Self {
        Self { selector, baud }
    }

    /// A factory matching the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.selector.clone(), config.baud)
    }

    fn resolve_path(&self) -> Result<String, Error> {
        match &self.selector {
            Selector::Path(path) => Ok(path.clone()),
            Selector::UsbId { vid, pid } => discover(*vid, *pid),
            Selector::Auto => discover(DEFAULT_VID, DEFAULT_PID),
        }
    }
}

impl StreamFactory for SerialFactory {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ByteStream>, Error>> {
        Box::pin(async move {
            let path = self.resolve_path()?;

            info!(%path, baud = %self.baud, "Opening serial port");

            let stream = tokio_serial::new(&path, self.baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| open_error(&path, e))?;

            Ok(Box::new(stream) as Box<dyn ByteStream>)
        })
    }
}

/// Enumerate attached ports and return the path of the first one whose
/// usb ids match.
pub fn discover(vid: u16, pid: u16) -> Result<String, Error> {
    let ports = serialport::available_ports().map_err(|e| Error::Open {
        port: "<enumeration>".into(),
        problem: e.to_string(),
    })?;

    for port in ports {
        if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
            debug!(path = %port.port_name, vid = usb.vid, pid = usb.pid, "Candidate port");

            if usb.vid == vid && usb.pid == pid {
                return Ok(port.port_name);
            }
        }
    }

    Err(Error::DeviceNotFound(format!("usb {vid:04x}:{pid:04x}")))
}

fn open_error(path: &str, e: tokio_serial::Error) -> Error {
    match e.kind {
        tokio_serial::ErrorKind::NoDevice => Error::DeviceNotFound(path.to_string()),
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            Error::PermissionDenied(path.to_string())
        }
        _ => Error::Open {
            port: path.to_string(),
            problem: e.to_string(),
        },
    }
}
