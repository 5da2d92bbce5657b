#![forbid(unsafe_code)]

//! Client runtime for running codex agent turns.
//!
//! A turn runs either as a one-shot `codex exec` process
//! ([`subprocess::SubprocessTransport`]) or on a persistent app-server
//! connection shared by many turns ([`connection::ConnectionTransport`]).
//! Results come back as a collected batch or as a lazily started,
//! cancellable [`stream::TurnStream`]. Any operation can be wrapped with
//! [`retry::with_retry`] and [`retry::rate_limit::with_rate_limit_handling`].

pub mod config;
pub mod connection;
pub mod errors;
pub mod event;
pub mod logging;
pub mod retry;
pub mod stream;
pub mod subprocess;
pub mod turn;

pub use config::RuntimeConfig;
pub use errors::{AppError, Result};
pub use event::ThreadEvent;
pub use turn::{TurnRequest, TurnRunner};
