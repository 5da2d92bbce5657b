//! Event delivery from producers to turn consumers.
//!
//! - `queue`: actor-owned blocking FIFO with clean/error close.
//! - `result`: [`TurnStream`], the lazily started consumer handle, and the
//!   [`TurnSink`] its producer writes to.

pub mod queue;
pub mod result;

use futures_util::stream::BoxStream;

use crate::event::ThreadEvent;
use crate::Result;

pub use queue::{CloseReason, EventQueue, Pop};
pub use result::{
    pump, CancelMode, Producer, ProducerFuture, PumpEnd, StreamEvent, TurnSink, TurnStream,
};

/// Pull-driven sequence of decoded backend events.
pub type EventStream = BoxStream<'static, Result<ThreadEvent>>;
