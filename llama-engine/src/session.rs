// llama-engine/src/session.rs
//
// Generation session: the pull-driven completion loop and the stream handed
// to the caller.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::guard::ResourceGuard;
use crate::native::Step;

/// Lower bound on the target length of a session.
pub const MIN_TARGET_LENGTH: i32 = 50;

/// Target length for a prompt: half its character count, at least [`MIN_TARGET_LENGTH`].
pub fn target_length(prompt: &str) -> i32 {
    let half = prompt.chars().count() / 2;
    i32::try_from(half)
        .unwrap_or(i32::MAX)
        .max(MIN_TARGET_LENGTH)
}

type FragmentReply = oneshot::Sender<Option<Result<String>>>;

/// Why a session stopped producing fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    TargetReached,
    EndOfGeneration,
    Cancelled,
    ConsumerGone,
    Fault,
}

/// Outcome of the serve loop, with the consumer request still to be answered.
struct Finish {
    end: SessionEnd,
    emitted: usize,
    reply: Option<FragmentReply>,
    fault: Option<EngineError>,
}

impl Finish {
    fn new(end: SessionEnd, emitted: usize, reply: Option<FragmentReply>) -> Self {
        Self {
            end,
            emitted,
            reply,
            fault: None,
        }
    }
}

/// One `send` invocation. Runs on the serializer thread and occupies it
/// until the loop ends, which is what keeps sessions from overlapping.
pub(crate) struct GenerationSession {
    prompt: String,
    format_chat: bool,
    target_len: i32,
    counter: i32,
    cancel: CancellationToken,
    /// Engine-wide token cancelled by `clean_up` and `destroy`.
    root: CancellationToken,
    demand: mpsc::UnboundedReceiver<FragmentReply>,
}

impl GenerationSession {
    /// Create a session and the stream that drives it.
    pub(crate) fn new(
        prompt: String,
        format_chat: bool,
        cancel: CancellationToken,
        root: CancellationToken,
    ) -> (Self, TokenStream) {
        let target_len = target_length(&prompt);
        let (demand_tx, demand_rx) = mpsc::unbounded_channel();
        let stream = TokenStream {
            demand: demand_tx,
            pending: None,
            cancel: cancel.clone(),
            target_len,
            finished: false,
        };
        let session = Self {
            prompt,
            format_chat,
            target_len,
            counter: 0,
            cancel,
            root,
            demand: demand_rx,
        };
        (session, stream)
    }

    /// Start the session, report the outcome through `started`, then serve
    /// fragments on demand until the loop ends.
    pub(crate) fn run(mut self, guard: &mut ResourceGuard, started: oneshot::Sender<Result<()>>) {
        if self.is_cancelled() {
            // Cancelled while queued: the stream ends empty, the backend is never touched.
            log::debug!("Generation cancelled before it started");
            let _ = started.send(Ok(()));
            return;
        }
        if let Err(e) = guard.begin_generation() {
            let _ = started.send(Err(e));
            return;
        }

        // From here on the cache is cleared and the state restored on every exit path.
        let mut active = ActiveGeneration { guard };

        let init = active
            .guard
            .session_init(&self.prompt, self.format_chat, self.target_len);
        match init {
            Ok(counter) => self.counter = counter,
            Err(e) => {
                log::error!("Failed to start generation: {}", e);
                drop(active);
                let _ = started.send(Err(EngineError::Native(e)));
                return;
            }
        }

        log::info!(
            "Generation started (target length: {}, initial position: {})",
            self.target_len,
            self.counter
        );
        if started.send(Ok(())).is_err() {
            log::debug!("Caller went away before generation started");
            return;
        }

        let finish = self.serve(&mut active);
        drop(active);

        // The last reply goes out only after cleanup, so a consumer that sees
        // the end of the stream also sees `ModelReady`.
        if let Some(reply) = finish.reply {
            let _ = reply.send(finish.fault.map(Err));
        }
        log::info!(
            "Generation finished after {} fragments ({:?})",
            finish.emitted,
            finish.end
        );
    }

    fn serve(&mut self, active: &mut ActiveGeneration<'_>) -> Finish {
        let mut emitted = 0usize;
        loop {
            let Some(reply) = self.next_demand() else {
                let end = if self.is_cancelled() {
                    SessionEnd::Cancelled
                } else {
                    SessionEnd::ConsumerGone
                };
                return Finish::new(end, emitted, None);
            };

            if self.is_cancelled() {
                return Finish::new(SessionEnd::Cancelled, emitted, Some(reply));
            }
            if self.counter >= self.target_len {
                return Finish::new(SessionEnd::TargetReached, emitted, Some(reply));
            }

            match active.guard.session_step(self.target_len, self.counter) {
                Ok(Step::Fragment { text, counter }) => {
                    self.counter = counter;
                    emitted += 1;
                    if reply.send(Some(Ok(text))).is_err() {
                        return Finish::new(SessionEnd::ConsumerGone, emitted, None);
                    }
                }
                Ok(Step::End) => {
                    return Finish::new(SessionEnd::EndOfGeneration, emitted, Some(reply));
                }
                Err(e) => {
                    log::error!("Generation step failed at position {}: {}", self.counter, e);
                    let mut finish = Finish::new(SessionEnd::Fault, emitted, Some(reply));
                    finish.fault = Some(EngineError::Native(e));
                    return finish;
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.root.is_cancelled()
    }

    /// Block the worker until the consumer asks for a fragment, the stream is
    /// dropped, or the session is cancelled.
    ///
    /// A request still waiting when the session is cancelled is dropped with
    /// the session, after cleanup.
    fn next_demand(&mut self) -> Option<FragmentReply> {
        let cancel = self.cancel.clone();
        let root = self.root.clone();
        let demand = &mut self.demand;
        futures::executor::block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = root.cancelled() => None,
                reply = demand.recv() => reply,
            }
        })
    }
}

/// Scoped acquisition of the `Generating` state.
struct ActiveGeneration<'a> {
    guard: &'a mut ResourceGuard,
}

impl Drop for ActiveGeneration<'_> {
    fn drop(&mut self) {
        self.guard.finish_generation();
    }
}

/// Lazy, finite, ordered stream of generated fragments.
///
/// Each poll asks the worker for exactly one fragment, so the backend never
/// runs ahead of the consumer. Dropping the stream ends the session.
#[derive(Debug)]
#[must_use = "the session holds the engine until the stream is consumed or dropped"]
pub struct TokenStream {
    demand: mpsc::UnboundedSender<FragmentReply>,
    pending: Option<oneshot::Receiver<Option<Result<String>>>>,
    cancel: CancellationToken,
    target_len: i32,
    finished: bool,
}

impl TokenStream {
    /// Stop the session after the fragment currently being produced, if any.
    ///
    /// The stream still ends only once the engine is back in `ModelReady`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this session, for handing to another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn target_length(&self) -> i32 {
        self.target_len
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if this.pending.is_none() {
            let (tx, rx) = oneshot::channel();
            if this.demand.send(tx).is_err() {
                this.finished = true;
                return Poll::Ready(None);
            }
            this.pending = Some(rx);
        }
        let Some(pending) = this.pending.as_mut() else {
            return Poll::Ready(None);
        };

        let reply = match Pin::new(pending).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(reply) => reply,
        };
        this.pending = None;

        match reply {
            Ok(Some(Ok(text))) => Poll::Ready(Some(Ok(text))),
            Ok(Some(Err(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            // End of session, or the request was dropped with a cancelled session.
            Ok(None) | Err(_) => {
                this.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_length_has_floor() {
        assert_eq!(target_length("hello"), MIN_TARGET_LENGTH);
        assert_eq!(target_length(""), MIN_TARGET_LENGTH);
        assert_eq!(target_length(&"a".repeat(99)), MIN_TARGET_LENGTH);
    }

    #[test]
    fn test_target_length_is_half_the_characters() {
        assert_eq!(target_length(&"a".repeat(300)), 150);
        assert_eq!(target_length(&"a".repeat(301)), 150);
        // Counted in characters, not bytes
        assert_eq!(target_length(&"é".repeat(240)), 120);
    }

    #[tokio::test]
    async fn test_stream_ends_when_worker_side_is_gone() {
        use futures_util::StreamExt;

        let (session, mut stream) = GenerationSession::new(
            "hello".to_string(),
            false,
            CancellationToken::new(),
            CancellationToken::new(),
        );
        drop(session);

        assert!(stream.next().await.is_none());
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn test_cancelled_stream_waits_for_the_worker() {
        use futures_util::StreamExt;

        let (mut session, mut stream) = GenerationSession::new(
            "hello".to_string(),
            false,
            CancellationToken::new(),
            CancellationToken::new(),
        );
        stream.cancel();

        // The stream does not end on its own; the session has to let go first.
        assert!(futures::poll!(stream.next()).is_pending());
        let reply = session.demand.try_recv().unwrap();
        assert!(session.is_cancelled());

        drop(reply);
        drop(session);
        assert!(stream.next().await.is_none());
        assert!(stream.is_finished());
    }

    #[test]
    fn test_root_cancellation_reaches_session() {
        let root = CancellationToken::new();
        let (session, stream) = GenerationSession::new(
            "hello".to_string(),
            false,
            CancellationToken::new(),
            root.clone(),
        );
        root.cancel();

        assert!(session.is_cancelled());
        assert!(!stream.cancellation_token().is_cancelled());
    }
}
