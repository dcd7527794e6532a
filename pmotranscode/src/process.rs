//! External encoder processes.
//!
//! The encoder's standard output is streamed to the caller as it is
//! produced. A watcher task owns the child process: it waits for the exit
//! status, or kills the child as soon as the caller's cancellation token
//! fires. Dropping the stream cancels too, so an abandoned request never
//! leaves an encoder running.

use std::{
    future::Future,
    io,
    path::Path,
    pin::Pin,
    process::{ExitStatus, Stdio},
    task::{Context, Poll, ready},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf},
    process::{ChildStdout, Command},
    sync::oneshot,
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    command::{ResolvedCommand, resolve},
    error::TranscodeError,
    profile::Profile,
    transcoder::{StreamOrigin, TranscodeStream, Transcoder},
};

/// Runs the profile's command and streams its standard output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTranscoder;

impl ProcessTranscoder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transcoder for ProcessTranscoder {
    async fn transcode(
        &self,
        profile: &Profile,
        input: &Path,
        cancel: CancellationToken,
    ) -> Result<TranscodeStream, TranscodeError> {
        let command = resolve(profile, input)?;
        let stream = spawn(&command, cancel)?;
        Ok(TranscodeStream::new(StreamOrigin::Encoded, stream))
    }
}

#[derive(Debug)]
enum ExitOutcome {
    Success,
    Failed(i32),
    Killed,
    Lost(io::Error),
}

impl ExitOutcome {
    fn from_status(status: io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) if status.success() => ExitOutcome::Success,
            Ok(status) => match status.code() {
                Some(code) => ExitOutcome::Failed(code),
                // terminated by a signal
                None => ExitOutcome::Killed,
            },
            Err(err) => ExitOutcome::Lost(err),
        }
    }

    fn into_result(self) -> io::Result<()> {
        match self {
            ExitOutcome::Success => Ok(()),
            ExitOutcome::Failed(code) => Err(TranscodeError::EncoderExit { code }.into_io()),
            ExitOutcome::Killed => Err(TranscodeError::EncoderKilled.into_io()),
            ExitOutcome::Lost(err) => Err(err),
        }
    }
}

/// Starts `command` with `cancel` bound to the process lifetime.
///
/// Nothing runs in the background if the program cannot be started.
pub fn spawn(command: &ResolvedCommand, cancel: CancellationToken) -> Result<ProcessStream, TranscodeError> {
    if cancel.is_cancelled() {
        return Err(TranscodeError::Cancelled);
    }

    let mut child = Command::new(command.program())
        .args(command.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TranscodeError::Spawn {
            program: command.program().to_path_buf(),
            source,
        })?;

    let pid = child.id();
    tracing::debug!(pid = ?pid, command = %command, "Started encoder");

    let stdout = child.stdout.take().ok_or_else(|| TranscodeError::Spawn {
        program: command.program().to_path_buf(),
        source: io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"),
    })?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "encoder", pid = ?pid, "{}", line);
            }
        });
    }

    let token = cancel.child_token();
    let watch = token.clone();
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = tokio::select! {
            status = child.wait() => ExitOutcome::from_status(status),
            _ = watch.cancelled() => {
                if let Err(err) = child.kill().await {
                    tracing::warn!(pid = ?pid, "Failed to kill encoder: {}", err);
                }
                tracing::debug!(pid = ?pid, "Encoder killed on cancellation");
                ExitOutcome::Killed
            }
        };
        if let ExitOutcome::Failed(code) = outcome {
            tracing::warn!(pid = ?pid, code, "Encoder exited with an error");
        }
        let _ = exit_tx.send(outcome);
    });

    Ok(ProcessStream {
        stdout,
        exit: exit_rx,
        stdout_done: false,
        finished: false,
        _cancel_on_drop: token.drop_guard(),
    })
}

/// Standard output of a running encoder.
///
/// The exit status is collected when stdout ends: a clean exit reads as EOF,
/// anything else as an error wrapping [`TranscodeError::EncoderExit`] or
/// [`TranscodeError::EncoderKilled`].
pub struct ProcessStream {
    stdout: ChildStdout,
    exit: oneshot::Receiver<ExitOutcome>,
    stdout_done: bool,
    finished: bool,
    _cancel_on_drop: DropGuard,
}

impl AsyncRead for ProcessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if !this.stdout_done {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
            if buf.filled().len() > before {
                return Poll::Ready(Ok(()));
            }
            this.stdout_done = true;
        }

        let outcome = ready!(Pin::new(&mut this.exit).poll(cx));
        this.finished = true;
        Poll::Ready(match outcome {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(io::Error::other("encoder watcher stopped")),
        })
    }
}
