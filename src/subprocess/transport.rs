//! One-process-per-turn transport.
//!
//! Every turn spawns `codex exec --experimental-json`, writes the input to
//! stdin, and reads NDJSON events from stdout while collecting stderr. The
//! process is read through a [`ProcessReader`] owned by exactly one stream;
//! the reader is the only place the process state is mutated.
//!
//! Each read waits at most `event_timeout` for the next stdout line, stderr
//! chunk, or exit. When the window elapses the process is stopped and the
//! stream ends with [`AppError::Timeout`].

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info, warn};

use crate::config::SubprocessConfig;
use crate::event::ThreadEvent;
use crate::stream::{pump, EventStream, ProducerFuture, PumpEnd, TurnSink, TurnStream};
use crate::subprocess::codec::EventCodec;
use crate::subprocess::spawner::{
    exit_kind, spawn_backend, stop_process, transport_error, write_input,
};
use crate::turn::TurnOptions;
use crate::{AppError, Result};

/// Runs turns by spawning one backend process each.
#[derive(Debug, Clone)]
pub struct SubprocessTransport {
    config: Arc<SubprocessConfig>,
}

impl SubprocessTransport {
    /// Create a transport from its configuration.
    #[must_use]
    pub fn new(config: SubprocessConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Transport configuration.
    #[must_use]
    pub fn config(&self) -> &SubprocessConfig {
        &self.config
    }

    /// Run a turn and collect every event in order.
    ///
    /// # Errors
    ///
    /// - [`AppError::Io`] if the backend cannot be spawned or fed.
    /// - [`AppError::Transport`] on a non-zero or signal exit.
    /// - [`AppError::Timeout`] when the backend goes silent, or stops
    ///   reading its input, for longer than `event_timeout`.
    pub async fn run(&self, input: &str, opts: &TurnOptions) -> Result<Vec<ThreadEvent>> {
        let mut events = self.run_stream(input, opts).await?;
        let mut collected = Vec::new();
        while let Some(event) = events.next().await {
            collected.push(event?);
        }
        debug!(count = collected.len(), "subprocess turn collected");
        Ok(collected)
    }

    /// Run a turn and return its events as a pull-driven stream.
    ///
    /// The stream ends after a clean exit; on an abnormal exit or timeout
    /// its last item is the error. Dropping the stream kills the process.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the backend cannot be spawned or fed, or
    /// [`AppError::Timeout`] if it does not read its input in time.
    pub async fn run_stream(&self, input: &str, opts: &TurnOptions) -> Result<EventStream> {
        let mut child = spawn_backend(&self.config, opts)?;
        write_input(
            &mut child,
            input,
            self.config.event_timeout(),
            self.config.stop_grace(),
        )
        .await?;
        Ok(ProcessReader::new(child, Arc::clone(&self.config))?.into_stream())
    }

    /// Lazy [`TurnStream`] for a turn.
    ///
    /// The process is spawned when the stream is first read; a spawn
    /// failure is returned from that first read. A cancelled turn stops
    /// the process with `SIGTERM` and the configured grace period.
    #[must_use]
    pub fn run_turn_stream(&self, input: String, opts: TurnOptions) -> TurnStream {
        let config = Arc::clone(&self.config);
        TurnStream::new(Box::new(move |sink: TurnSink| {
            let mut child = spawn_backend(&config, &opts)?;
            Ok(Box::pin(async move {
                write_input(
                    &mut child,
                    &input,
                    config.event_timeout(),
                    config.stop_grace(),
                )
                .await?;
                let mut reader = ProcessReader::new(child, config)?;
                let end = pump(reader.events(), &sink).await?;
                if let PumpEnd::Cancelled(mode) = end {
                    debug!(pid = reader.pid, ?mode, "turn cancelled, stopping backend");
                    reader.stop().await;
                }
                Ok::<(), AppError>(())
            }) as ProducerFuture)
        }))
    }
}

enum Step {
    Stdout(Option<Result<ThreadEvent>>),
    Stderr(Option<std::io::Result<BytesMut>>),
}

/// Last `max` bytes of a process's stderr.
struct StderrTail {
    buf: BytesMut,
    max: usize,
    truncated: bool,
}

impl StderrTail {
    fn new(max: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max,
            truncated: false,
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max {
            let excess = self.buf.len() - self.max;
            self.buf.advance(excess);
            self.truncated = true;
        }
    }
}

/// Exclusive owner of one running backend process.
struct ProcessReader {
    child: Child,
    pid: Option<u32>,
    stdout: FramedRead<ChildStdout, EventCodec>,
    stderr: FramedRead<ChildStderr, BytesCodec>,
    stderr_tail: StderrTail,
    stdout_done: bool,
    stderr_done: bool,
    finished: bool,
    config: Arc<SubprocessConfig>,
}

impl ProcessReader {
    fn new(mut child: Child, config: Arc<SubprocessConfig>) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Io("failed to capture backend stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Io("failed to capture backend stderr".into()))?;

        Ok(Self {
            pid: child.id(),
            child,
            stdout: FramedRead::new(stdout, EventCodec::new()),
            stderr: FramedRead::new(stderr, BytesCodec::new()),
            stderr_tail: StderrTail::new(config.max_stderr_bytes),
            stdout_done: false,
            stderr_done: false,
            finished: false,
            config,
        })
    }

    fn into_stream(self) -> EventStream {
        stream::unfold(self, |mut reader| async move {
            reader.next_event().await.map(|item| (item, reader))
        })
        .boxed()
    }

    fn events(&mut self) -> BoxStream<'_, Result<ThreadEvent>> {
        stream::unfold(self, |reader| async move {
            let item = reader.next_event().await?;
            Some((item, reader))
        })
        .boxed()
    }

    async fn stop(&mut self) {
        self.finished = true;
        stop_process(&mut self.child, self.config.stop_grace()).await;
    }

    async fn next_event(&mut self) -> Option<Result<ThreadEvent>> {
        if self.finished {
            return None;
        }

        loop {
            if self.stdout_done && self.stderr_done {
                self.finished = true;
                return self.wait_exit().await.err().map(Err);
            }

            let timeout = self.config.event_timeout();
            let stdout_open = !self.stdout_done;
            let stderr_open = !self.stderr_done;
            let stdout = &mut self.stdout;
            let stderr = &mut self.stderr;

            let step = tokio::time::timeout(timeout, async {
                tokio::select! {
                    item = stdout.next(), if stdout_open => Step::Stdout(item),
                    chunk = stderr.next(), if stderr_open => Step::Stderr(chunk),
                }
            })
            .await;

            match step {
                Err(_elapsed) => {
                    self.finished = true;
                    return Some(Err(self.abort_on_timeout().await));
                }
                Ok(Step::Stdout(Some(Ok(event)))) => return Some(Ok(event)),
                Ok(Step::Stdout(Some(Err(err)))) => {
                    warn!(pid = self.pid, error = %err, "backend stdout read failed");
                    self.stdout_done = true;
                }
                Ok(Step::Stdout(None)) => {
                    debug!(pid = self.pid, "backend stdout closed");
                    self.stdout_done = true;
                }
                Ok(Step::Stderr(Some(Ok(chunk)))) => self.stderr_tail.extend(&chunk),
                Ok(Step::Stderr(Some(Err(err)))) => {
                    warn!(pid = self.pid, error = %err, "backend stderr read failed");
                    self.stderr_done = true;
                }
                Ok(Step::Stderr(None)) => self.stderr_done = true,
            }
        }
    }

    async fn wait_exit(&mut self) -> Result<()> {
        let status = match tokio::time::timeout(self.config.event_timeout(), self.child.wait()).await
        {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                return Err(AppError::Io(format!("failed to wait for backend: {err}")));
            }
            Err(_elapsed) => return Err(self.abort_on_timeout().await),
        };

        if status.success() {
            info!(pid = self.pid, "backend exited cleanly");
            return Ok(());
        }

        let exit = exit_kind(status);
        let tail = &self.stderr_tail;
        let mut err = transport_error(exit, &tail.buf, tail.max);
        err.truncated |= tail.truncated;
        warn!(
            pid = self.pid,
            %exit,
            retryable = err.retryable,
            "backend exited abnormally"
        );
        Err(AppError::Transport(err))
    }

    async fn abort_on_timeout(&mut self) -> AppError {
        warn!(
            pid = self.pid,
            timeout_ms = self.config.event_timeout_ms,
            "backend timed out, stopping process"
        );
        stop_process(&mut self.child, self.config.stop_grace()).await;
        AppError::Timeout(format!(
            "backend produced no output within {} ms",
            self.config.event_timeout_ms
        ))
    }
}
