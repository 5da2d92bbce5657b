//! Lazily started, cancellable turn stream.
//!
//! A [`TurnStream`] owns an [`EventQueue`] and a producer closure. The
//! producer is started on the first read (or an explicit
//! [`start`](TurnStream::start)), exactly once no matter how many tasks race
//! for it. It receives a [`TurnSink`] to push events, read the cancellation
//! mode, and record usage. When the producer's future finishes the queue is
//! closed with its result, so consumers drain buffered events first and then
//! see the end of stream or the error.
//!
//! Dropping the last handle to a stream aborts a running producer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{watch, Mutex, OnceCell};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

use crate::event::{ThreadEvent, Usage};
use crate::stream::queue::{CloseReason, EventQueue, Pop};
use crate::stream::EventStream;
use crate::{AppError, Result};

/// Cancellation requested by the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancelMode {
    /// Keep running.
    #[default]
    None,
    /// Stop at the producer's next yield point.
    Immediate,
    /// Let the current turn finish, then stop.
    AfterTurn,
}

/// Event as seen by a stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Backend event, unchanged.
    Raw(ThreadEvent),
    /// Cumulative usage after merging a backend usage report.
    UsageUpdated(Usage),
    /// The producer stopped because of a cancellation request.
    Cancelled(CancelMode),
}

/// Future run by a started producer.
pub type ProducerFuture = BoxFuture<'static, Result<()>>;

/// Producer closure. Errors returned directly are start failures.
pub type Producer = Box<dyn FnOnce(TurnSink) -> Result<ProducerFuture> + Send>;

#[derive(Debug)]
struct Control {
    cancel: watch::Sender<CancelMode>,
    usage: watch::Sender<Usage>,
}

/// Producer-side handle of a [`TurnStream`].
#[derive(Debug, Clone)]
pub struct TurnSink {
    queue: EventQueue<StreamEvent>,
    control: Arc<Control>,
}

impl TurnSink {
    /// Push a backend event; usage it carries is merged and announced.
    pub fn emit(&self, event: ThreadEvent) {
        let usage = event.usage().cloned();
        self.queue.push(StreamEvent::Raw(event));
        if let Some(usage) = usage {
            let snapshot = self.record_usage(&usage);
            self.queue.push(StreamEvent::UsageUpdated(snapshot));
        }
    }

    /// Push any stream event.
    pub fn push(&self, event: StreamEvent) {
        self.queue.push(event);
    }

    /// Current cancellation mode.
    #[must_use]
    pub fn cancel_mode(&self) -> CancelMode {
        *self.control.cancel.borrow()
    }

    /// Resolve once an immediate cancel is requested.
    pub async fn immediate_cancel(&self) {
        let mut rx = self.control.cancel.subscribe();
        if rx.wait_for(|mode| *mode == CancelMode::Immediate).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Add `usage` to the cumulative counters and return the new totals.
    pub fn record_usage(&self, usage: &Usage) -> Usage {
        self.control.usage.send_modify(|total| {
            for (key, value) in usage {
                *total.entry(key.clone()).or_insert(0) += value;
            }
        });
        self.control.usage.borrow().clone()
    }
}

/// How [`pump`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The source stream ran out.
    Exhausted,
    /// A cancellation request was honored.
    Cancelled(CancelMode),
}

/// Forward `events` into `sink`, honoring cancellation at every event.
///
/// # Errors
///
/// Returns the first error yielded by `events`, after everything before it
/// has been pushed.
pub async fn pump(
    mut events: BoxStream<'_, Result<ThreadEvent>>,
    sink: &TurnSink,
) -> Result<PumpEnd> {
    loop {
        let next = tokio::select! {
            biased;
            () = sink.immediate_cancel() => {
                sink.push(StreamEvent::Cancelled(CancelMode::Immediate));
                return Ok(PumpEnd::Cancelled(CancelMode::Immediate));
            }
            next = events.next() => next,
        };

        let Some(event) = next else {
            return Ok(PumpEnd::Exhausted);
        };
        let event = event?;
        let terminal = event.is_terminal();
        sink.emit(event);

        if terminal && sink.cancel_mode() == CancelMode::AfterTurn {
            sink.push(StreamEvent::Cancelled(CancelMode::AfterTurn));
            return Ok(PumpEnd::Cancelled(CancelMode::AfterTurn));
        }
    }
}

struct Inner {
    queue: EventQueue<StreamEvent>,
    control: Arc<Control>,
    producer: Mutex<Option<Producer>>,
    started: OnceCell<std::result::Result<AbortOnDropHandle<()>, AppError>>,
}

/// Consumer-side handle of a streamed turn. Cheap to clone.
#[derive(Clone)]
pub struct TurnStream {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TurnStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnStream")
            .field("started", &self.inner.started.initialized())
            .field("cancel", &self.cancel_mode())
            .finish_non_exhaustive()
    }
}

impl TurnStream {
    /// Wrap `producer`; nothing runs until the stream is first read.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(producer: Producer) -> Self {
        let (cancel, _) = watch::channel(CancelMode::None);
        let (usage, _) = watch::channel(Usage::new());
        Self {
            inner: Arc::new(Inner {
                queue: EventQueue::new(),
                control: Arc::new(Control { cancel, usage }),
                producer: Mutex::new(Some(producer)),
                started: OnceCell::new(),
            }),
        }
    }

    /// Wrap a closure that builds an [`EventStream`] once started.
    ///
    /// The stream is forwarded with [`pump`].
    #[must_use]
    pub fn from_events<F>(open: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<EventStream>> + Send + 'static,
    {
        Self::new(Box::new(move |sink: TurnSink| {
            Ok(Box::pin(async move {
                let events = open().await?;
                pump(events, &sink).await.map(|_| ())
            }) as ProducerFuture)
        }))
    }

    /// Start the producer if it has not been started yet.
    ///
    /// # Errors
    ///
    /// Returns the producer's start failure; later calls return it again.
    pub async fn start(&self) -> Result<()> {
        let started = self
            .inner
            .started
            .get_or_init(|| self.spawn_producer())
            .await;
        match started {
            Ok(_) => Ok(()),
            Err(err) => Err(err.clone()),
        }
    }

    async fn spawn_producer(&self) -> std::result::Result<AbortOnDropHandle<()>, AppError> {
        // Runs inside the `OnceCell` initializer only.
        let producer = self
            .inner
            .producer
            .lock()
            .await
            .take()
            .ok_or_else(|| AppError::Config("turn stream producer already taken".into()))?;

        let sink = TurnSink {
            queue: self.inner.queue.clone(),
            control: Arc::clone(&self.inner.control),
        };

        let future = match producer(sink) {
            Ok(future) => future,
            Err(err) => {
                warn!(error = %err, "turn stream: producer failed to start");
                self.inner.queue.close(CloseReason::Error(err.clone()));
                return Err(err);
            }
        };

        let queue = self.inner.queue.clone();
        let handle = tokio::spawn(async move {
            match future.await {
                Ok(()) => {
                    debug!("turn stream: producer finished");
                    queue.close(CloseReason::Normal);
                }
                Err(err) => {
                    debug!(error = %err, "turn stream: producer failed");
                    queue.close(CloseReason::Error(err));
                }
            }
        });
        Ok(AbortOnDropHandle::new(handle))
    }

    /// Take the next event, starting the producer first if needed.
    ///
    /// # Errors
    ///
    /// Returns a start failure, or the terminal error once buffered events
    /// are drained.
    pub async fn pop(&self, timeout: Option<Duration>) -> Result<Pop<StreamEvent>> {
        self.start().await?;
        self.inner.queue.pop(timeout).await
    }

    /// All events until the end of the turn. An error ends the stream.
    ///
    /// # Errors
    ///
    /// Returns the producer's start failure.
    pub async fn events(&self) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.start().await?;
        let inner = Arc::clone(&self.inner);
        Ok(stream::unfold(Some(inner), |state| async move {
            let inner = state?;
            match inner.queue.pop(None).await {
                Ok(Pop::Item(event)) => Some((Ok(event), Some(inner))),
                Ok(Pop::Done | Pop::TimedOut) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed())
    }

    /// Backend events only, unwrapped from [`StreamEvent::Raw`].
    ///
    /// # Errors
    ///
    /// Returns the producer's start failure.
    pub async fn raw_events(&self) -> Result<BoxStream<'static, Result<ThreadEvent>>> {
        let events = self.events().await?;
        Ok(events
            .filter_map(|event| async move {
                match event {
                    Ok(StreamEvent::Raw(raw)) => Some(Ok(raw)),
                    Ok(_) => None,
                    Err(err) => Some(Err(err)),
                }
            })
            .boxed())
    }

    /// Request cancellation. Producers honor it at their own yield points.
    pub fn cancel(&self, mode: CancelMode) {
        debug!(?mode, "turn stream: cancellation requested");
        self.inner.control.cancel.send_replace(mode);
    }

    /// Current cancellation mode.
    #[must_use]
    pub fn cancel_mode(&self) -> CancelMode {
        *self.inner.control.cancel.borrow()
    }

    /// Latest cumulative usage; empty until the backend reports some.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.inner.control.usage.borrow().clone()
    }
}
