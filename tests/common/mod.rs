#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use serial_tether::{
    config::{Config, ReconnectPolicy, Selector},
    mock::{DeviceEnd, MockFactory},
    session::Session,
};
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};

/// A session wired to the mock transport, plus the test's handle on
/// the factory and the device ends it produces.
pub struct Harness {
    pub session: Session,
    pub factory: Arc<MockFactory>,
    device_ends: UnboundedReceiver<DeviceEnd>,
}

impl Harness {
    /// The device end of the next (re)connection.
    pub async fn next_device(&mut self) -> DeviceEnd {
        timeout(Duration::from_secs(5), self.device_ends.recv())
            .await
            .expect("A connection should be made in time")
            .expect("The factory should still be alive")
    }
}

/// A config tuned for tests: fast timeouts, fast reconnects.
pub fn test_config() -> Config {
    Config {
        selector: Selector::Path("mock".into()),
        response_timeout_ms: 500,
        reconnect: ReconnectPolicy {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            max_retries: None,
        },
        ..Default::default()
    }
}

/// A disconnected session over a fresh mock factory.
pub fn harness(config: Config) -> Harness {
    let (factory, device_ends) = MockFactory::new();
    let factory = Arc::new(factory);

    let session = Session::new(config, factory.clone());

    Harness {
        session,
        factory,
        device_ends,
    }
}

/// A connected session, and the device end serving it.
pub async fn connected(config: Config) -> (Harness, DeviceEnd) {
    let mut harness = harness(config);

    harness
        .session
        .connect()
        .await
        .expect("Connecting over the mock transport should work");

    let device = harness.next_device().await;

    (harness, device)
}

/// Poll until the predicate holds, panicking after a couple of
/// seconds with the description of what we were waiting for.
pub async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);

    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Serve one tracked command: read it, answer with `payload` under the
/// same tag, and return the command text (tag suffix stripped).
pub async fn answer_tracked(device: &mut DeviceEnd, payload: &str) -> String {
    let line = device
        .recv_line()
        .await
        .expect("Expected a command from the host");

    let (command, tag) = line
        .rsplit_once('#')
        .expect("Expected a tracked command with a tag suffix");

    device.send_line(&format!(">>> #{tag}:{payload}")).await;

    command.to_string()
}
