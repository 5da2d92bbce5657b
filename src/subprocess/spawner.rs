//! Backend process spawning and teardown.
//!
//! Spawns `codex exec --experimental-json` with:
//! - `kill_on_drop(true)` so an abandoned turn never leaks its process.
//! - `env_clear()` + a safe variable allowlist, plus the API key under both
//!   names the backend accepts and the originator marker.
//! - The turn input written to stdin, followed by closing stdin
//!   ([`write_input`]).

use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::SubprocessConfig;
use crate::errors::{ExitKind, TransportError};
use crate::turn::TurnOptions;
use crate::{AppError, Result};

// ── Environment ──────────────────────────────────────────────────────────────

/// Environment variables inherited by the backend process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "CODEX_HOME",
    "RUST_LOG",
    "SSL_CERT_FILE",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
];

/// Variable names the API key is forwarded under.
pub const API_KEY_VARS: &[&str] = &["CODEX_API_KEY", "OPENAI_API_KEY"];

/// Originator marker variable and value.
pub const ORIGINATOR_VAR: (&str, &str) = ("CODEX_INTERNAL_ORIGINATOR_OVERRIDE", "codex_turn_rs");

/// Arguments for `codex exec` built from the turn options.
#[must_use]
pub fn build_args(opts: &TurnOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["exec".into(), "--experimental-json".into()];

    if let Some(model) = non_empty(opts.model.as_deref()) {
        args.push("--model".into());
        args.push(model.into());
    }
    if let Some(thread_id) = non_empty(opts.thread_id.as_deref()) {
        args.push("--thread-id".into());
        args.push(thread_id.into());
    }
    if let Some(token) = non_empty(opts.continuation_token.as_deref()) {
        args.push("--continuation-token".into());
        args.push(token.into());
    }
    for attachment in &opts.attachments {
        args.push("--attachment".into());
        args.push(attachment.path.clone().into_os_string());
        args.push("--attachment-name".into());
        args.push(attachment.name.clone().into());
        args.push("--attachment-checksum".into());
        args.push(attachment.checksum.clone().into());
    }

    args
}

/// Environment passed to the backend, excluding the inherited allowlist.
///
/// Empty values are omitted rather than passed as empty strings.
#[must_use]
pub fn build_env(api_key: Option<&str>) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    if let Some(key) = non_empty(api_key) {
        for name in API_KEY_VARS {
            vars.push(((*name).to_owned(), key.to_owned()));
        }
    }
    vars.push((ORIGINATOR_VAR.0.to_owned(), ORIGINATOR_VAR.1.to_owned()));
    vars
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn the backend for one turn.
///
/// stdin, stdout and stderr are piped; the caller hands over the input with
/// [`write_input`].
///
/// # Errors
///
/// Returns `AppError::Io("failed to spawn backend: …")` on OS spawn failure.
pub fn spawn_backend(config: &SubprocessConfig, opts: &TurnOptions) -> Result<Child> {
    let mut cmd = Command::new(&config.executable);
    cmd.args(build_args(opts));

    // Strip inherited environment, then inject only the safe allowlist.
    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.envs(build_env(config.api_key.as_deref()));

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|err| AppError::Io(format!("failed to spawn backend: {err}")))?;

    info!(
        pid = child.id(),
        executable = %config.executable.display(),
        "backend process spawned"
    );
    Ok(child)
}

/// Write `input` to the backend's stdin, then close stdin so the backend
/// sees end-of-input.
///
/// The write and close together get `timeout`; a backend that stops
/// draining its stdin is stopped once it elapses.
///
/// # Errors
///
/// - `AppError::Io("failed to capture backend stdin")`: stdin was already
///   taken.
/// - `AppError::Timeout`: the backend did not take its input within
///   `timeout`; the process is stopped first.
/// - `AppError::Io("failed to write input: …")`: writing failed for a
///   reason other than a closed pipe; the process is stopped first.
pub async fn write_input(
    child: &mut Child,
    input: &str,
    timeout: Duration,
    grace: Duration,
) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Io("failed to capture backend stdin".into()))?;

    let written = tokio::time::timeout(timeout, async {
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await
    })
    .await;
    drop(stdin);

    match written {
        Ok(Ok(())) => Ok(()),
        // Backend exited without reading its input; its exit status tells why.
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {
            warn!(%err, "backend closed stdin before reading input");
            Ok(())
        }
        Ok(Err(err)) => {
            stop_process(child, grace).await;
            Err(AppError::Io(format!("failed to write input: {err}")))
        }
        Err(_elapsed) => {
            warn!(
                pid = child.id(),
                input_bytes = input.len(),
                "backend did not read its input in time, stopping process"
            );
            stop_process(child, grace).await;
            Err(AppError::Timeout(format!(
                "backend did not read its input within {} ms",
                timeout.as_millis()
            )))
        }
    }
}

// ── Teardown ─────────────────────────────────────────────────────────────────

/// Stop `child`, tolerating a process that has already exited.
///
/// On unix a `SIGTERM` is sent first and the process gets `grace` to exit
/// before it is killed.
pub async fn stop_process(child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(?status, "stop_process: backend already exited");
            return;
        }
        Ok(None) => {}
        Err(err) => warn!(%err, "stop_process: try_wait failed"),
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(raw) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            if kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
                && tokio::time::timeout(grace, child.wait()).await.is_ok()
            {
                debug!(pid = raw, "stop_process: backend exited after SIGTERM");
                return;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
    }

    if let Err(err) = child.kill().await {
        // Exited between the checks above.
        debug!(%err, "stop_process: kill failed");
    }
}

// ── Exit classification ──────────────────────────────────────────────────────

/// Classify an exit status.
#[must_use]
pub fn exit_kind(status: ExitStatus) -> ExitKind {
    if let Some(code) = status.code() {
        return ExitKind::Code(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitKind::Signal(signal);
        }
    }

    ExitKind::Unknown
}

/// Whether a turn that ended with `exit` may succeed when re-run.
///
/// Signals, and shell-style `128 + signal` codes, point at the process
/// being stopped from outside rather than at the request itself.
#[must_use]
pub fn is_retryable_exit(exit: ExitKind) -> bool {
    match exit {
        ExitKind::Signal(_) => true,
        ExitKind::Code(code) => code > 128,
        ExitKind::Unknown => false,
    }
}

/// Build the transport failure for an abnormal exit.
///
/// `stderr` is cut to its last `max_bytes` bytes on a char boundary.
#[must_use]
pub fn transport_error(exit: ExitKind, stderr: &[u8], max_bytes: usize) -> TransportError {
    let text = String::from_utf8_lossy(stderr);
    let (stderr, truncated) = if text.len() > max_bytes {
        let mut start = text.len() - max_bytes;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        (text[start..].to_owned(), true)
    } else {
        (text.into_owned(), false)
    };

    TransportError {
        exit,
        stderr,
        truncated,
        retryable: is_retryable_exit(exit),
    }
}
