use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Shared byte counter.
///
/// Cloning the handle shares the underlying counter, so a progress reporter
/// running in another task can observe (or reset) the count without
/// synchronising with the task doing the I/O.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    fn add(&self, n: usize) {
        self.0.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Async reader that counts the bytes read through it.
#[derive(Debug)]
pub struct CountReader<R> {
    inner: R,
    counter: ByteCounter,
}

impl<R> CountReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            counter: ByteCounter::new(),
        }
    }

    /// Returns a handle on the counter, usable from other tasks.
    pub fn counter(&self) -> ByteCounter {
        self.counter.clone()
    }

    pub fn count(&self) -> u64 {
        self.counter.count()
    }

    pub fn reset(&self) {
        self.counter.reset();
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.counter.add(buf.filled().len() - before);
        }
        poll
    }
}

/// Async writer that counts the bytes accepted by the wrapped writer.
#[derive(Debug)]
pub struct CountWriter<W> {
    inner: W,
    counter: ByteCounter,
}

impl<W> CountWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            counter: ByteCounter::new(),
        }
    }

    /// Returns a handle on the counter, usable from other tasks.
    pub fn counter(&self) -> ByteCounter {
        self.counter.clone()
    }

    pub fn count(&self) -> u64 {
        self.counter.count()
    }

    pub fn reset(&self) {
        self.counter.reset();
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.counter.add(n);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn reader_counts_across_calls() {
        let mut reader = CountReader::new(Cursor::new(vec![7u8; 100]));
        let mut buf = [0u8; 30];

        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }

        assert_eq!(total, 100);
        assert_eq!(reader.count(), 100);
    }

    #[tokio::test]
    async fn reset_starts_from_zero() {
        let mut reader = CountReader::new(Cursor::new(vec![1u8; 64]));
        let mut buf = [0u8; 40];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(reader.count(), 40);

        reader.reset();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(reader.count(), 24);
    }

    #[tokio::test]
    async fn writer_counter_is_shared_with_other_tasks() {
        let mut writer = CountWriter::new(Vec::new());
        let counter = writer.counter();

        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();

        let seen = tokio::spawn(async move { counter.count() }).await.unwrap();
        assert_eq!(seen, 11);
        assert_eq!(writer.into_inner(), b"hello world");
    }
}
