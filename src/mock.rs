//! An in-memory transport, useful to test session behavior without
//! hardware: unplugs are a dropped device end, replugs are the next
//! open.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{future::BoxFuture, SinkExt, StreamExt};
use tokio::{
    io::DuplexStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_util::codec::{Decoder, Framed};
use tracing::debug;

use crate::{
    error::Error,
    serial::codecs::lines::LinesCodec,
    stream::{ByteStream, StreamFactory},
};

/// Hands out in-memory streams instead of serial ports.
///
/// Every successful open produces a [`DeviceEnd`], delivered on the
/// channel returned by [`MockFactory::new`], which the test drives as
/// if it were the device firmware.
pub struct MockFactory {
    device_ends: UnboundedSender<DeviceEnd>,
    fail_opens: AtomicUsize,
    opens: AtomicUsize,
}

impl MockFactory {
    /// The factory, and the channel on which device ends arrive.
    pub fn new() -> (Self, UnboundedReceiver<DeviceEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                device_ends: tx,
                fail_opens: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Make the next `n` opens fail with a device-not-found error.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// How many opens have succeeded.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl StreamFactory for MockFactory {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ByteStream>, Error>> {
        Box::pin(async move {
            let failed = self
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                debug!("Mock open failing on purpose");
                return Err(Error::DeviceNotFound("mock".into()));
            }

            let (host_end, device_end) = tokio::io::duplex(4096);
            self.opens.fetch_add(1, Ordering::SeqCst);

            // The test may have gone away; the host side still works.
            let _ = self.device_ends.send(DeviceEnd {
                framed: LinesCodec::default().framed(device_end),
            });

            Ok(Box::new(host_end) as Box<dyn ByteStream>)
        })
    }
}

/// The device side of one mock connection.
///
/// Drop it to simulate an unplug: the host side sees end of input.
pub struct DeviceEnd {
    framed: Framed<DuplexStream, LinesCodec>,
}

impl DeviceEnd {
    /// Put one line on the wire towards the host.
    pub async fn send_line(&mut self, line: &str) {
        self.framed
            .send(line.to_string())
            .await
            .expect("Mock device write should work");
    }

    /// The next line the host sent, or `None` once the host hung up.
    pub async fn recv_line(&mut self) -> Option<String> {
        match self.framed.next().await? {
            Ok(line) => Some(line),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn open_hands_out_a_device_end() {
        let (factory, mut ends) = MockFactory::new();

        let mut host = factory.open().await.unwrap();
        let mut device = ends.recv().await.unwrap();

        host.write_all(b"hello\r\n").await.unwrap();

        assert_eq!(device.recv_line().await.unwrap(), "hello");
        assert_eq!(factory.opens(), 1);
    }

    #[tokio::test]
    async fn failed_opens_are_consumed_in_order() {
        let (factory, _ends) = MockFactory::new();

        factory.fail_next_opens(2);

        assert!(factory.open().await.is_err());
        assert!(factory.open().await.is_err());
        assert!(factory.open().await.is_ok());
    }
}
