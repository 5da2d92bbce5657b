//! Error types shared across the runtime.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared runtime result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// How a backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Process exited with a numeric status code.
    Code(i32),
    /// Process was terminated by the given signal number.
    Signal(i32),
    /// The platform reported neither a code nor a signal.
    Unknown,
}

impl Display for ExitKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// Failure of a backend transport (abnormal process exit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Exit classification.
    pub exit: ExitKind,
    /// Captured stderr, possibly truncated to its tail.
    pub stderr: String,
    /// `true` when `stderr` was cut to fit the capture limit.
    pub truncated: bool,
    /// Whether re-running the turn may succeed.
    pub retryable: bool,
}

/// Low-level network failure classes recognised by the retry predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Peer reset the connection.
    ConnectionReset,
    /// Peer refused the connection.
    ConnectionRefused,
    /// Name resolution failed.
    Dns,
    /// An HTTP/2 or SSE stream was reset mid-flight.
    StreamReset,
    /// Any other network failure.
    Other,
}

/// Explicit rate-limit information reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitError {
    /// Human-readable message.
    pub message: String,
    /// Server-provided cooldown hint.
    pub retry_after: Option<Duration>,
}

/// Runtime error enumeration covering all failure modes.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// A single line or message could not be decoded.
    Decode(String),
    /// Backend process ended abnormally.
    Transport(TransportError),
    /// A wall-clock or idle window elapsed.
    Timeout(String),
    /// Network-level failure.
    Network {
        /// Failure class.
        kind: NetworkErrorKind,
        /// Underlying message.
        message: String,
    },
    /// HTTP-shaped failure returned by a backend.
    Http {
        /// HTTP status code.
        status: u16,
        /// Response headers (name, value).
        headers: Vec<(String, String)>,
        /// Response body, possibly empty.
        body: String,
    },
    /// Structured API error returned by a backend call.
    Api {
        /// Status code reported alongside the error, if any.
        status: Option<u16>,
        /// Error payload as received.
        payload: serde_json::Value,
    },
    /// Credentials were rejected.
    Auth(String),
    /// The backend rejected the request as malformed.
    InvalidRequest(String),
    /// Explicit rate-limit signal.
    RateLimited(RateLimitError),
    /// Rate-limit handling gave up while still throttled.
    StillRateLimited {
        /// Number of attempts made.
        attempts: u32,
        /// Last cooldown hint seen, if any.
        retry_after: Option<Duration>,
        /// The last rate-limit failure.
        source: Box<AppError>,
    },
    /// An operation needs a thread id but none is known.
    MissingThread,
    /// Persistent connection failure (closed, JSON-RPC error, ...).
    Connection(String),
    /// Event queue actor is gone.
    QueueClosed,
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::Transport(err) => {
                write!(f, "transport: {}", err.exit)?;
                if !err.stderr.is_empty() {
                    write!(f, ": {}", err.stderr.trim_end())?;
                }
                Ok(())
            }
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Network { kind, message } => write!(f, "network ({kind:?}): {message}"),
            Self::Http { status, body, .. } => write!(f, "http {status}: {body}"),
            Self::Api { status, payload } => match status {
                Some(status) => write!(f, "api {status}: {payload}"),
                None => write!(f, "api: {payload}"),
            },
            Self::Auth(msg) => write!(f, "auth: {msg}"),
            Self::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Self::RateLimited(err) => write!(f, "rate limited: {}", err.message),
            Self::StillRateLimited {
                attempts, source, ..
            } => write!(f, "still rate limited after {attempts} attempts: {source}"),
            Self::MissingThread => write!(f, "missing thread: no thread id is known"),
            Self::Connection(msg) => write!(f, "connection: {msg}"),
            Self::QueueClosed => write!(f, "queue closed"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                NetworkErrorKind::ConnectionReset
            }
            ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            ErrorKind::TimedOut => return Self::Timeout(err.to_string()),
            _ => return Self::Io(err.to_string()),
        };
        Self::Network {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
