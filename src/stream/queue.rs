//! Blocking producer/consumer event queue.
//!
//! All queue state lives inside one actor task; [`EventQueue`] handles talk
//! to it over an unbounded command channel, so state is never touched from
//! two tasks at once.
//!
//! A blocked [`pop`](EventQueue::pop) registers a waiter carrying a
//! [`oneshot::Sender`]. The paired receiver is the waiter's liveness link:
//! when the popping task is dropped the receiver goes with it, the sender
//! reports [`is_closed`](oneshot::Sender::is_closed), and the actor purges
//! the entry instead of handing it a value.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::{AppError, Result};

/// Result of a successful [`EventQueue::pop`].
#[derive(Debug, Clone, PartialEq)]
pub enum Pop<T> {
    /// Next value in push order.
    Item(T),
    /// The queue was closed cleanly and fully drained.
    Done,
    /// No value arrived within the timeout.
    TimedOut,
}

/// How a queue is closed.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// Clean end of stream.
    Normal,
    /// Terminal failure handed to every later pop.
    Error(AppError),
}

/// What a waiter is finally told.
type Delivery<T> = Result<Pop<T>>;

struct Waiter<T> {
    id: u64,
    reply: oneshot::Sender<Delivery<T>>,
}

enum Command<T> {
    Push(T),
    Pop {
        id: u64,
        reply: oneshot::Sender<Delivery<T>>,
    },
    CancelWait {
        id: u64,
        ack: oneshot::Sender<bool>,
    },
    Close(CloseReason),
}

struct QueueState<T> {
    pending: VecDeque<T>,
    waiters: VecDeque<Waiter<T>>,
    closed: bool,
    terminal: Option<AppError>,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            waiters: VecDeque::new(),
            closed: false,
            terminal: None,
        }
    }

    fn purge_dead_waiters(&mut self) {
        let before = self.waiters.len();
        self.waiters.retain(|w| !w.reply.is_closed());
        let purged = before - self.waiters.len();
        if purged > 0 {
            debug!(purged, "event queue: dropped abandoned waiters");
        }
    }

    /// What a pop sees once nothing is pending on a closed queue.
    fn closed_reply(&self) -> Delivery<T> {
        match &self.terminal {
            Some(err) => Err(err.clone()),
            None => Ok(Pop::Done),
        }
    }

    fn push(&mut self, mut value: T) {
        if self.closed {
            trace!("event queue: push after close ignored");
            return;
        }
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.reply.send(Ok(Pop::Item(value))) {
                Ok(()) => return,
                // Waiter died after registering; try the next one.
                Err(Ok(Pop::Item(returned))) => value = returned,
                Err(_) => return,
            }
        }
        self.pending.push_back(value);
    }

    fn pop(&mut self, id: u64, reply: oneshot::Sender<Delivery<T>>) {
        if let Some(value) = self.pending.pop_front() {
            let _ = reply.send(Ok(Pop::Item(value)));
            return;
        }
        if self.closed {
            let _ = reply.send(self.closed_reply());
            return;
        }
        self.purge_dead_waiters();
        self.waiters.push_back(Waiter { id, reply });
    }

    fn cancel_wait(&mut self, id: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        before != self.waiters.len()
    }

    fn close(&mut self, reason: CloseReason) {
        if self.closed {
            trace!("event queue: repeated close ignored");
            return;
        }
        self.closed = true;
        if let CloseReason::Error(err) = reason {
            self.terminal = Some(err);
        }
        // Waiters only exist while nothing is pending.
        for waiter in std::mem::take(&mut self.waiters) {
            let _ = waiter.reply.send(self.closed_reply());
        }
    }
}

async fn run_actor<T>(mut commands: mpsc::UnboundedReceiver<Command<T>>) {
    let mut state = QueueState::new();
    while let Some(command) = commands.recv().await {
        match command {
            Command::Push(value) => state.push(value),
            Command::Pop { id, reply } => state.pop(id, reply),
            Command::CancelWait { id, ack } => {
                let _ = ack.send(state.cancel_wait(id));
            }
            Command::Close(reason) => state.close(reason),
        }
    }
    trace!("event queue: all handles dropped, actor exiting");
}

/// Cloneable handle to a queue actor.
///
/// The actor runs until every handle is dropped. Must be created inside a
/// Tokio runtime.
pub struct EventQueue<T> {
    commands: mpsc::UnboundedSender<Command<T>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> std::fmt::Debug for EventQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> EventQueue<T> {
    /// Spawn a new queue actor.
    #[must_use]
    pub fn new() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_actor(rx));
        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue `value`, handing it straight to the oldest blocked pop if
    /// there is one. Never blocks. Pushes after close are dropped.
    pub fn push(&self, value: T) {
        if self.commands.send(Command::Push(value)).is_err() {
            trace!("event queue: push on stopped actor");
        }
    }

    /// Close the queue. Only the first close takes effect.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.commands.send(Command::Close(reason));
    }

    /// Take the next value.
    ///
    /// Returns immediately when a value is pending or the queue is closed
    /// and drained; otherwise blocks up to `timeout` (`None` waits forever).
    ///
    /// # Errors
    ///
    /// Returns the terminal error once an error-closed queue is drained, or
    /// [`AppError::QueueClosed`] if the actor has stopped.
    pub async fn pop(&self, timeout: Option<Duration>) -> Result<Pop<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, mut rx) = oneshot::channel();
        self.commands
            .send(Command::Pop { id, reply })
            .map_err(|_| AppError::QueueClosed)?;

        let Some(timeout) = timeout else {
            return rx.await.map_err(|_| AppError::QueueClosed)?;
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(delivery) => delivery.map_err(|_| AppError::QueueClosed)?,
            Err(_elapsed) => self.abandon_wait(id, rx).await,
        }
    }

    /// Deregister a timed-out waiter without losing a racing delivery.
    async fn abandon_wait(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<Delivery<T>>,
    ) -> Result<Pop<T>> {
        let (ack, ack_rx) = oneshot::channel();
        if self.commands.send(Command::CancelWait { id, ack }).is_err() {
            return Err(AppError::QueueClosed);
        }
        let removed = ack_rx.await.map_err(|_| AppError::QueueClosed)?;
        if removed {
            return Ok(Pop::TimedOut);
        }
        // The actor answered before it saw the cancel; the reply is ready.
        match rx.try_recv() {
            Ok(delivery) => delivery,
            Err(_) => Err(AppError::QueueClosed),
        }
    }
}

impl<T: Send + 'static> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
