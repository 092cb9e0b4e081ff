use std::sync::Arc;

use futures::{
    channel::mpsc::UnboundedReceiver, future, stream, Sink, SinkExt, Stream, StreamExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    correlator::Correlator,
    events::EventDispatcher,
    frame::{self, Frame},
    stream::StreamError,
};

/// Why the listener loop ended.
#[derive(Debug)]
pub(crate) enum ExitReason {
    /// The stream failed or reached end of input; the session should
    /// tear down pending requests and consider reconnecting.
    StreamFailure(String),

    /// We were asked to stop.
    Shutdown,
}

enum Step {
    FromWire(Result<String, StreamError>),
    ToWire(String),
    Eof,
}

/// The read loop for one connected epoch.
///
/// Owns the read half exclusively, and is also the single consumer of
/// the outgoing queue, which is what serializes writes: interleaved
/// partial writes would corrupt the line framing.
///
/// Dispatch only- responses go to the correlator, events to the
/// dispatcher. No caller-visible work happens on this task.
pub(crate) async fn run<R, W>(
    reads: R,
    mut sink: W,
    writes: UnboundedReceiver<String>,
    correlator: Arc<Correlator>,
    dispatcher: Arc<EventDispatcher>,
    cancel: CancellationToken,
) -> ExitReason
where
    R: Stream<Item = Result<String, StreamError>> + Unpin,
    W: Sink<String, Error = StreamError> + Unpin,
{
    // Reads and queued writes are handled by the same loop, so mark
    // the end of the read stream explicitly: the merged stream only
    // ends when both sides do.
    let reads = reads
        .map(Step::FromWire)
        .chain(stream::once(future::ready(Step::Eof)));
    let writes = writes.map(Step::ToWire);

    let mut steps = stream::select(reads, writes);

    loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => return ExitReason::Shutdown,
            step = steps.next() => step,
        };

        match step {
            Some(Step::FromWire(Ok(line))) => {
                trace!(%line, "From wire");
                dispatch(frame::decode(&line), &correlator, &dispatcher);
            }
            Some(Step::FromWire(Err(e))) => {
                debug!(?e, "Read failure");
                return ExitReason::StreamFailure(e.to_string());
            }
            Some(Step::ToWire(line)) => {
                trace!(%line, "To wire");

                // A stalled device stops draining its buffer; the
                // write then pends and must still observe shutdown.
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return ExitReason::Shutdown,
                    sent = sink.send(line) => sent,
                };

                if let Err(e) = sent {
                    debug!(?e, "Write failure");
                    return ExitReason::StreamFailure(e.to_string());
                }
            }
            Some(Step::Eof) | None => {
                return ExitReason::StreamFailure("stream closed".into());
            }
        }
    }
}

fn dispatch(frame: Frame, correlator: &Correlator, dispatcher: &EventDispatcher) {
    match frame {
        Frame::Tracked { tag, payload } => correlator.resolve(tag, payload),
        Frame::Plain(payload) => correlator.resolve_plain(payload),
        Frame::Event(payload) => dispatcher.on_event(&payload),
    }
}
