use std::{
    fmt, io,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::{error::TranscodeError, profile::Profile};

/// Produces the bytes of `input` encoded according to `profile`.
///
/// Implementations return as soon as bytes can flow; the caller drains the
/// returned stream. Failures that happen after the stream was handed out
/// (encoder exit status, cancellation) are reported by the stream's final
/// read, never dropped.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        profile: &Profile,
        input: &Path,
        cancel: CancellationToken,
    ) -> Result<TranscodeStream, TranscodeError>;
}

/// Where the bytes of a [`TranscodeStream`] come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    /// The source file, unmodified.
    Passthrough,
    /// A live encoder process.
    Encoded,
    /// A previously completed cache entry.
    Cached,
}

impl fmt::Display for StreamOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamOrigin::Passthrough => "passthrough",
            StreamOrigin::Encoded => "encoded",
            StreamOrigin::Cached => "cached",
        })
    }
}

/// Byte stream returned by a [`Transcoder`].
pub struct TranscodeStream {
    origin: StreamOrigin,
    inner: Pin<Box<dyn AsyncRead + Send>>,
}

impl TranscodeStream {
    pub fn new<R>(origin: StreamOrigin, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            origin,
            inner: Box::pin(reader),
        }
    }

    pub fn origin(&self) -> StreamOrigin {
        self.origin
    }

    /// Drains the stream into `out` and returns the number of bytes copied.
    ///
    /// Errors raised by the producer are converted back into their
    /// [`TranscodeError`] variant.
    pub async fn copy_to<W>(mut self, out: &mut W) -> Result<u64, TranscodeError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let copied = tokio::io::copy(&mut self, out).await?;
        out.flush().await?;
        Ok(copied)
    }
}

impl fmt::Debug for TranscodeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeStream")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TranscodeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}
