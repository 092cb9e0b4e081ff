//! Owns the table of in-flight requests.
//!
//! The listener resolves requests from one side while any number of
//! callers submit from the other; the table mutex is the only thing
//! they share, and it is only ever held for short, non-blocking
//! critical sections. Waiters block or await on their own
//! [`ResponseSlot`], never on the table.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use tokio::{runtime::Handle, sync::oneshot};
use tracing::{debug, trace, warn};

use crate::{error::Error, frame::Tag};

/// How many recently sent command texts to remember for echo
/// suppression. The device echoes commands back on the same line
/// channel, and an echo must not satisfy a pending plain request.
const ECHO_LOG_MAX: usize = 32;

/// The receiving end of one request's write-once result.
///
/// This is the single resolution primitive both call surfaces share:
/// an async caller awaits [`ResponseSlot::resolved`], a blocking caller
/// parks on [`ResponseSlot::wait`]. The correlator and listener are
/// oblivious to which adapter a given request uses.
#[derive(Debug)]
pub struct ResponseSlot {
    rx: oneshot::Receiver<Result<String, Error>>,
}

impl ResponseSlot {
    /// Await the response (or failure) cooperatively.
    pub async fn resolved(self) -> Result<String, Error> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost("request dropped unresolved".into())),
        }
    }

    /// Block the calling thread until resolved.
    ///
    /// Must not be called from an async runtime thread.
    pub fn wait(self) -> Result<String, Error> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost("request dropped unresolved".into())),
        }
    }
}

/// One in-flight request, exclusively owned by the correlator until it
/// is resolved by a response, a timer, or session teardown.
#[derive(Debug)]
struct Pending {
    slot: oneshot::Sender<Result<String, Error>>,
    submitted_at: Instant,
    deadline: Instant,
}

impl Pending {
    fn new(timeout: Duration) -> (Self, ResponseSlot) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        (
            Self {
                slot: tx,
                submitted_at: now,
                deadline: now + timeout,
            },
            ResponseSlot { rx },
        )
    }

    fn resolve(self, result: Result<String, Error>) {
        // The waiter may have gone away (an async caller can drop its
        // future); then nobody cares about the result.
        let _ = self.slot.send(result);
    }
}

#[derive(Debug, Default)]
struct Table {
    tagged: HashMap<Tag, Pending>,
    untagged: VecDeque<(u64, Pending)>,
    next_untagged: u64,
    recently_sent: VecDeque<String>,
}

/// Matches incoming responses to pending requests.
///
/// Lives for the whole session, across reconnects.
#[derive(Debug, Default)]
pub struct Correlator {
    table: Mutex<Table>,

    /// Where expiry timers are spawned. Bound once, at first connect.
    runtime: OnceLock<Handle>,
}

impl Correlator {
    /// A correlator with an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the runtime used for expiry timers.
    /// Only the first call has an effect.
    pub fn bind_runtime(&self, handle: Handle) {
        let _ = self.runtime.set(handle);
    }

    /// Register a tagged request. Its timer is already running when
    /// this returns.
    pub fn submit(self: &Arc<Self>, tag: Tag, timeout: Duration) -> Result<ResponseSlot, Error> {
        let (pending, slot) = Pending::new(timeout);

        {
            let mut table = self.table.lock().expect("Correlator mutex poisoned");

            if table.tagged.contains_key(&tag) {
                return Err(Error::DuplicateTag(tag));
            }

            table.tagged.insert(tag, pending);
        }

        let this = Arc::clone(self);
        self.timer_runtime()?.spawn(async move {
            tokio::time::sleep(timeout).await;
            this.expire(tag);
        });

        Ok(slot)
    }

    /// Register an untagged request at the back of the plain-response
    /// queue.
    pub fn submit_untagged(self: &Arc<Self>, timeout: Duration) -> Result<ResponseSlot, Error> {
        let (pending, slot) = Pending::new(timeout);

        let seq = {
            let mut table = self.table.lock().expect("Correlator mutex poisoned");

            let seq = table.next_untagged;
            table.next_untagged += 1;
            table.untagged.push_back((seq, pending));
            seq
        };

        let this = Arc::clone(self);
        self.timer_runtime()?.spawn(async move {
            tokio::time::sleep(timeout).await;
            this.expire_untagged(seq);
        });

        Ok(slot)
    }

    /// Resolve the request pending under `tag`.
    ///
    /// A no-op when the tag is unknown: the requester may already have
    /// timed out, and a late response must be harmless.
    pub fn resolve(&self, tag: Tag, payload: String) {
        let pending = {
            let mut table = self.table.lock().expect("Correlator mutex poisoned");
            table.tagged.remove(&tag)
        };

        match pending {
            Some(pending) => {
                trace!(%tag, elapsed = ?pending.submitted_at.elapsed(), "Resolved");
                pending.resolve(Ok(payload));
            }
            None => debug!(%tag, "Response for unknown tag, ignoring"),
        }
    }

    /// Resolve the oldest pending untagged request with a plain
    /// response.
    ///
    /// No-ops: nothing untagged pending, or the line is an echo of a
    /// command we recently sent.
    pub fn resolve_plain(&self, payload: String) {
        let pending = {
            let mut table = self.table.lock().expect("Correlator mutex poisoned");

            if table.untagged.is_empty() {
                trace!(%payload, "Plain line with nothing pending, ignoring");
                return;
            }

            if table.recently_sent.iter().any(|sent| sent == &payload) {
                debug!(%payload, "Command echo, ignoring");
                return;
            }

            table.untagged.pop_front()
        };

        if let Some((_, pending)) = pending {
            pending.resolve(Ok(payload));
        }
    }

    /// Timer-invoked: fail the request under `tag` if still pending.
    pub fn expire(&self, tag: Tag) {
        let pending = {
            let mut table = self.table.lock().expect("Correlator mutex poisoned");
            table.tagged.remove(&tag)
        };

        if let Some(pending) = pending {
            debug!(%tag, deadline = ?pending.deadline, "Request timed out");
            pending.resolve(Err(Error::Timeout(tag)));
        }
    }

    /// Timer-invoked: fail the untagged request `seq` if still pending.
    fn expire_untagged(&self, seq: u64) {
        let pending = {
            let mut table = self.table.lock().expect("Correlator mutex poisoned");

            match table.untagged.iter().position(|(s, _)| *s == seq) {
                Some(at) => table.untagged.remove(at),
                None => None,
            }
        };

        if let Some((_, pending)) = pending {
            debug!("Untagged request timed out");
            pending.resolve(Err(Error::PlainTimeout));
        }
    }

    /// Fail every pending request with a connection-loss reason.
    /// Invoked by the session on disconnect, so no caller hangs past
    /// that point.
    pub fn teardown_all(&self, reason: &str) {
        let (tagged, untagged) = {
            let mut table = self.table.lock().expect("Correlator mutex poisoned");

            (
                std::mem::take(&mut table.tagged),
                std::mem::take(&mut table.untagged),
            )
        };

        let count = tagged.len() + untagged.len();
        if count > 0 {
            warn!(%count, %reason, "Tearing down pending requests");
        }

        for (_, pending) in tagged {
            pending.resolve(Err(Error::ConnectionLost(reason.to_string())));
        }

        for (_, pending) in untagged {
            pending.resolve(Err(Error::ConnectionLost(reason.to_string())));
        }
    }

    /// Remember a sent command text for echo suppression.
    pub fn note_sent(&self, command: &str) {
        let mut table = self.table.lock().expect("Correlator mutex poisoned");

        if table.recently_sent.len() == ECHO_LOG_MAX {
            table.recently_sent.pop_front();
        }
        table.recently_sent.push_back(command.to_string());
    }

    /// How many requests are currently pending.
    pub fn pending(&self) -> usize {
        let table = self.table.lock().expect("Correlator mutex poisoned");
        table.tagged.len() + table.untagged.len()
    }

    fn timer_runtime(&self) -> Result<&Handle, Error> {
        self.runtime.get().ok_or(Error::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn correlator() -> Arc<Correlator> {
        let correlator = Arc::new(Correlator::new());
        correlator.bind_runtime(Handle::current());
        correlator
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn response_resolves_its_own_request() {
        let correlator = correlator();

        let a = correlator.submit(Tag::from(1), LONG).unwrap();
        let b = correlator.submit(Tag::from(2), LONG).unwrap();

        correlator.resolve(Tag::from(2), "two".into());
        correlator.resolve(Tag::from(1), "one".into());

        assert_eq!(a.resolved().await.unwrap(), "one");
        assert_eq!(b.resolved().await.unwrap(), "two");
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn duplicate_tag_is_rejected() {
        let correlator = correlator();

        let _slot = correlator.submit(Tag::from(7), LONG).unwrap();

        assert!(matches!(
            correlator.submit(Tag::from(7), LONG),
            Err(Error::DuplicateTag(_))
        ));
    }

    #[tokio::test]
    async fn unknown_tag_is_a_no_op() {
        let correlator = correlator();

        correlator.resolve(Tag::from(99), "nobody asked".into());

        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn timeout_resolves_and_late_response_is_ignored() {
        let correlator = correlator();

        let slot = correlator
            .submit(Tag::from(3), Duration::from_millis(10))
            .unwrap();

        assert!(matches!(slot.resolved().await, Err(Error::Timeout(_))));
        assert_eq!(correlator.pending(), 0);

        // The response shows up anyway. Nothing should blow up.
        correlator.resolve(Tag::from(3), "late".into());
    }

    #[tokio::test]
    async fn plain_responses_resolve_fifo() {
        let correlator = correlator();

        let first = correlator.submit_untagged(LONG).unwrap();
        let second = correlator.submit_untagged(LONG).unwrap();

        correlator.resolve_plain("one".into());
        correlator.resolve_plain("two".into());

        assert_eq!(first.resolved().await.unwrap(), "one");
        assert_eq!(second.resolved().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn echoes_do_not_satisfy_plain_requests() {
        let correlator = correlator();

        correlator.note_sent("km.click(1)");
        let slot = correlator.submit_untagged(LONG).unwrap();

        // The device echoes the command before answering.
        correlator.resolve_plain("km.click(1)".into());
        correlator.resolve_plain("clicked".into());

        assert_eq!(slot.resolved().await.unwrap(), "clicked");
    }

    #[tokio::test]
    async fn plain_response_with_nothing_pending_is_ignored() {
        let correlator = correlator();

        correlator.resolve_plain("spurious".into());

        let slot = correlator.submit_untagged(LONG).unwrap();
        correlator.resolve_plain("real".into());

        assert_eq!(slot.resolved().await.unwrap(), "real");
    }

    #[tokio::test]
    async fn teardown_fails_everything() {
        let correlator = correlator();

        let tagged = correlator.submit(Tag::from(1), LONG).unwrap();
        let untagged = correlator.submit_untagged(LONG).unwrap();

        correlator.teardown_all("unplugged");

        assert!(matches!(
            tagged.resolved().await,
            Err(Error::ConnectionLost(_))
        ));
        assert!(matches!(
            untagged.resolved().await,
            Err(Error::ConnectionLost(_))
        ));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn blocking_adapter_sees_the_same_resolution() {
        let correlator = correlator();

        let slot = correlator.submit(Tag::from(5), LONG).unwrap();

        // A blocking caller parks on its slot from a plain thread.
        let waiter = std::thread::spawn(move || slot.wait());

        correlator.resolve(Tag::from(5), "ok".into());

        let result = waiter.join().unwrap();
        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn many_concurrent_submitters_resolve_one_to_one() {
        let correlator = correlator();

        let mut waiters = Vec::new();
        for n in 0..100u32 {
            let slot = correlator.submit(Tag::from(n), LONG).unwrap();
            waiters.push((n, slot));
        }

        // Resolve in reverse to prove arrival order does not matter.
        for n in (0..100u32).rev() {
            correlator.resolve(Tag::from(n), format!("payload-{n}"));
        }

        for (n, slot) in waiters {
            assert_eq!(slot.resolved().await.unwrap(), format!("payload-{n}"));
        }
    }
}
