//! A session is the lifetime of one logical connection to the device,
//! from connect to its eventual disconnect, surviving unplug/replug in
//! between.
//!
//! The session owns the supervisor task: it runs the listener for each
//! connected epoch, tears down pending requests the moment the stream
//! fails, and reopens the transport with bounded backoff.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{
    channel::mpsc::{self, UnboundedSender},
    future::BoxFuture,
    StreamExt,
};
use tokio::{runtime::Handle, sync::Mutex as AsyncMutex, task::JoinHandle};
use tokio_util::{codec::Decoder, sync::CancellationToken};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    correlator::{Correlator, ResponseSlot},
    error::Error,
    events::{ButtonEvent, DeviceState, EventDispatcher, ObserverId},
    frame::{self, TagGenerator},
    listener::{self, ExitReason},
    serial::{codecs::lines::LinesCodec, SerialFactory},
    stream::{ByteStream, StreamFactory},
};

/// Where the session currently is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, and nobody trying to make one.
    /// The initial state, and the terminal state of every session.
    Disconnected,

    /// An explicit connect is in progress.
    Connecting,

    /// Traffic flows.
    Connected,

    /// The connection was lost and the supervisor is retrying.
    Reconnecting,
}

/// Identifies a registered connection observer so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionObserverId(u64);

type ConnectionObserver = Arc<dyn Fn(bool) + Send + Sync>;

/// A handle to one device session. Cheap to clone; clones share the
/// same underlying session.
///
/// Both blocking and async callers may have requests pending
/// concurrently; they share one correlator and one listener.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    factory: Arc<dyn StreamFactory>,
    correlator: Arc<Correlator>,
    dispatcher: Arc<EventDispatcher>,
    tags: TagGenerator,

    state: Mutex<ConnectionState>,
    observers: Mutex<Vec<(ConnectionObserverId, ConnectionObserver)>>,
    next_observer: AtomicU64,

    /// The outgoing queue of the current connected epoch.
    /// `None` whenever no connection is up.
    writer: Mutex<Option<UnboundedSender<String>>>,

    cancel: Mutex<CancellationToken>,
    supervisor: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// A disconnected session talking through the given stream
    /// factory. Call [`Session::connect`] to bring it up.
    pub fn new(config: Config, factory: Arc<dyn StreamFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                correlator: Arc::new(Correlator::new()),
                dispatcher: Arc::new(EventDispatcher::new()),
                tags: TagGenerator::new(),
                state: Mutex::new(ConnectionState::Disconnected),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(0),
                writer: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
                supervisor: AsyncMutex::new(None),
            }),
        }
    }

    /// Convenience: a session over the serial transport, connected.
    pub async fn open(config: Config) -> Result<Self, Error> {
        let factory = Arc::new(SerialFactory::from_config(&config));

        let session = Self::new(config, factory);
        session.connect().await?;

        Ok(session)
    }

    /// Open the transport and start the session.
    ///
    /// A failure to open is surfaced here and leaves the session
    /// disconnected; auto-reconnect only governs connections lost
    /// *after* they were up. May be called again after a disconnect.
    pub async fn connect(&self) -> Result<(), Error> {
        self.inner.config.validate()?;

        {
            let mut state = self.inner.state.lock().expect("State mutex poisoned");

            if *state != ConnectionState::Disconnected {
                return Err(Error::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }
        info!("Connecting");

        // Expiry timers (and hence blocking sends) need somewhere to
        // run; bind them to the runtime we are connecting on.
        self.inner.correlator.bind_runtime(Handle::current());

        let stream = match self.inner.factory.open().await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().expect("Cancel mutex poisoned") = cancel.clone();

        // The epoch is installed before connect returns, so a send
        // immediately afterwards finds the write queue in place.
        let epoch = self.inner.begin_epoch(stream, &cancel);

        let handle = tokio::spawn(
            supervise(Arc::clone(&self.inner), epoch, cancel).instrument(info_span!("session")),
        );
        *self.inner.supervisor.lock().await = Some(handle);

        Ok(())
    }

    /// Stop the session.
    ///
    /// The listener and any reconnect timer are fully stopped before
    /// the stream is closed, every pending request is resolved with a
    /// connection failure, and connection observers see `false`.
    pub async fn disconnect(&self) {
        let handle = { self.inner.supervisor.lock().await.take() };

        if let Some(handle) = handle {
            self.inner
                .cancel
                .lock()
                .expect("Cancel mutex poisoned")
                .cancel();

            if handle.await.is_err() {
                error!("Supervisor task failed");
            }
        }
    }

    /// Whether traffic currently flows.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("State mutex poisoned")
    }

    /// Send a tracked command and await its response, with the
    /// configured response timeout.
    pub async fn send(&self, command: &str) -> Result<String, Error> {
        self.send_with_timeout(command, self.inner.config.response_timeout())
            .await
    }

    /// Send a tracked command and await its response.
    pub async fn send_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        self.submit_tracked(command, timeout)?.resolved().await
    }

    /// Send a tracked command and block until its response, with the
    /// configured response timeout.
    ///
    /// For callers outside the async runtime; must not be called from
    /// a runtime thread.
    pub fn send_sync(&self, command: &str) -> Result<String, Error> {
        self.send_sync_with_timeout(command, self.inner.config.response_timeout())
    }

    /// Send a tracked command and block until its response.
    ///
    /// For callers outside the async runtime; must not be called from
    /// a runtime thread.
    pub fn send_sync_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        self.submit_tracked(command, timeout)?.wait()
    }

    /// Send an untagged command and await the next plain response.
    ///
    /// The device answers untagged commands without a correlation tag,
    /// so at most one such command should be in flight at a time;
    /// concurrent plain requests resolve in submission order.
    pub async fn send_plain(&self, command: &str) -> Result<String, Error> {
        self.submit_untagged(command, self.inner.config.response_timeout())?
            .resolved()
            .await
    }

    /// Blocking form of [`Session::send_plain`]; must not be called
    /// from a runtime thread.
    pub fn send_plain_sync(&self, command: &str) -> Result<String, Error> {
        self.submit_untagged(command, self.inner.config.response_timeout())?
            .wait()
    }

    /// Send a command expecting no response at all.
    pub fn send_nowait(&self, command: &str) -> Result<(), Error> {
        let writer = self.writer()?;

        self.inner.correlator.note_sent(command);
        writer
            .unbounded_send(frame::encode(command, None))
            .map_err(|_| Error::NotConnected)
    }

    /// Register a connection observer, invoked with `true`/`false` as
    /// the session comes up and goes down. Invocation is in
    /// registration order; a panicking observer is isolated.
    pub fn on_connection_change<F>(&self, observer: F) -> ConnectionObserverId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = ConnectionObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));

        self.inner
            .observers
            .lock()
            .expect("Observer mutex poisoned")
            .push((id, Arc::new(observer)));

        id
    }

    /// Remove a connection observer. No-op when already removed.
    pub fn remove_connection_observer(&self, id: ConnectionObserverId) {
        self.inner
            .observers
            .lock()
            .expect("Observer mutex poisoned")
            .retain(|(registered, _)| *registered != id);
    }

    /// Register a button event observer.
    pub fn on_button_event<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ButtonEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(observer)
    }

    /// Remove a button event observer. No-op when already removed.
    pub fn remove_button_observer(&self, id: ObserverId) {
        self.inner.dispatcher.unsubscribe(id)
    }

    /// A snapshot of the cached device state. Never blocks on event
    /// traffic.
    pub fn device_state(&self) -> DeviceState {
        self.inner.dispatcher.snapshot()
    }

    fn writer(&self) -> Result<UnboundedSender<String>, Error> {
        self.inner
            .writer
            .lock()
            .expect("Writer mutex poisoned")
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Register the pending request, then put the command on the wire.
    /// In that order- the response must never race its own
    /// registration.
    fn submit_tracked(&self, command: &str, timeout: Duration) -> Result<ResponseSlot, Error> {
        let writer = self.writer()?;

        let tag = self.inner.tags.next_tag();
        let slot = self.inner.correlator.submit(tag, timeout)?;

        self.inner.correlator.note_sent(command);
        if writer
            .unbounded_send(frame::encode(command, Some(tag)))
            .is_err()
        {
            // The epoch ended under us; retire the registration.
            self.inner.correlator.expire(tag);
            return Err(Error::NotConnected);
        }

        Ok(slot)
    }

    fn submit_untagged(&self, command: &str, timeout: Duration) -> Result<ResponseSlot, Error> {
        let writer = self.writer()?;

        let slot = self.inner.correlator.submit_untagged(timeout)?;

        self.inner.correlator.note_sent(command);
        if writer
            .unbounded_send(frame::encode(command, None))
            .is_err()
        {
            // The pending entry is retired by its own timer.
            return Err(Error::NotConnected);
        }

        Ok(slot)
    }
}

impl Inner {
    fn set_state(&self, to: ConnectionState) {
        let mut state = self.state.lock().expect("State mutex poisoned");

        debug!(from = ?*state, ?to, "Connection state");
        *state = to;
    }

    /// Tell connection observers, in registration order, without
    /// holding any lock.
    fn notify(&self, connected: bool) {
        let observers: Vec<ConnectionObserver> = {
            let observers = self.observers.lock().expect("Observer mutex poisoned");
            observers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(connected))).is_err() {
                warn!("A connection observer panicked; continuing with the rest");
            }
        }
    }

    /// Wire up one connected epoch: frame the stream, install the
    /// write queue, queue the init replay, and announce the
    /// connection. Returns the listener future for the supervisor to
    /// drive.
    fn begin_epoch(
        self: &Arc<Self>,
        stream: Box<dyn ByteStream>,
        cancel: &CancellationToken,
    ) -> BoxFuture<'static, ExitReason> {
        let framed = LinesCodec::default().framed(stream);
        let (sink, reads) = framed.split();

        let (tx, rx) = mpsc::unbounded();

        for command in &self.config.init_commands {
            self.correlator.note_sent(command);
            let _ = tx.unbounded_send(frame::encode(command, None));
        }

        *self.writer.lock().expect("Writer mutex poisoned") = Some(tx);

        self.set_state(ConnectionState::Connected);
        self.notify(true);

        Box::pin(listener::run(
            reads,
            sink,
            rx,
            Arc::clone(&self.correlator),
            Arc::clone(&self.dispatcher),
            cancel.clone(),
        ))
    }

    /// The epoch is over: nothing pending may survive, and the cached
    /// device state is no longer current.
    fn end_epoch(&self, reason: &str) {
        *self.writer.lock().expect("Writer mutex poisoned") = None;
        self.correlator.teardown_all(reason);
        self.dispatcher.reset();
    }
}

/// Drives one session to its end: runs the listener per epoch, and on
/// stream failure either reconnects or gives up per the configuration.
async fn supervise(
    inner: Arc<Inner>,
    mut epoch: BoxFuture<'static, ExitReason>,
    cancel: CancellationToken,
) {
    loop {
        let exit = epoch.await;

        match exit {
            ExitReason::Shutdown => {
                info!("Session stopped");
                inner.end_epoch("disconnected");
                inner.set_state(ConnectionState::Disconnected);
                inner.notify(false);
                return;
            }
            ExitReason::StreamFailure(reason) => {
                warn!(%reason, "Stream failed");
                inner.end_epoch(&reason);

                if !inner.config.auto_reconnect {
                    inner.set_state(ConnectionState::Disconnected);
                    inner.notify(false);
                    return;
                }

                inner.set_state(ConnectionState::Reconnecting);
                inner.notify(false);

                match reopen(&inner, &cancel).await {
                    Some(stream) => epoch = inner.begin_epoch(stream, &cancel),
                    None => {
                        inner.set_state(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        }
    }
}

/// Retry opening the transport with bounded exponential backoff.
/// `None` when retries are exhausted or the session was cancelled.
async fn reopen(inner: &Arc<Inner>, cancel: &CancellationToken) -> Option<Box<dyn ByteStream>> {
    let policy = &inner.config.reconnect;

    let mut delay = policy.initial_delay();
    let mut attempts = 0u32;

    loop {
        if let Some(max) = policy.max_retries {
            if attempts >= max {
                error!(%attempts, "Reconnect attempts exhausted, giving up");
                return None;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        attempts += 1;
        match inner.factory.open().await {
            Ok(stream) => {
                info!(%attempts, "Reconnected");
                return Some(stream);
            }
            Err(e) => {
                debug!(?e, %attempts, ?delay, "Reconnect attempt failed");
                delay = (delay * 2).min(policy.max_delay());
            }
        }
    }
}
