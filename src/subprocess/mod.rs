//! Subprocess transport: one `codex exec` process per turn.
//!
//! - `codec`: NDJSON line framing and event decoding.
//! - `spawner`: process launch, input hand-off, teardown, exit classification.
//! - `transport`: [`SubprocessTransport`], the turn runner over a process.

pub mod codec;
pub mod spawner;
pub mod transport;

pub use codec::{EventCodec, LineDecoder};
pub use transport::SubprocessTransport;
