use std::{
    cmp, io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

const TEE_CHUNK: usize = 64 * 1024;

/// Async reader that duplicates everything it reads into a sink.
///
/// Each chunk pulled from the reader is fully written to the sink before any
/// of it is handed to the caller, so the sink always holds at least what the
/// caller has seen, in the same order. At end of input the sink is flushed
/// before EOF is reported.
///
/// A sink failure takes precedence over the data: it is returned as the read
/// error and every later read fails with the same error kind.
pub struct TeeReader<R, W> {
    reader: R,
    sink: W,
    buf: Box<[u8]>,
    filled: usize,
    mirrored: usize,
    delivered: usize,
    eof: bool,
    failed: Option<io::ErrorKind>,
}

impl<R, W> TeeReader<R, W> {
    pub fn new(reader: R, sink: W) -> Self {
        Self {
            reader,
            sink,
            buf: vec![0u8; TEE_CHUNK].into_boxed_slice(),
            filled: 0,
            mirrored: 0,
            delivered: 0,
            eof: false,
            failed: None,
        }
    }

    /// True once the reader reached its end and the sink was flushed.
    pub fn is_finished(&self) -> bool {
        self.eof
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.sink)
    }
}

impl<R, W: AsyncWrite + Unpin> TeeReader<R, W> {
    /// Shuts the sink down and releases the reader.
    pub async fn close(self) -> io::Result<()> {
        let (reader, mut sink) = self.into_inner();
        drop(reader);
        sink.shutdown().await
    }
}

impl<R, W> TeeReader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn fail(&mut self, err: io::Error) -> Poll<io::Result<()>> {
        self.failed = Some(err.kind());
        Poll::Ready(Err(err))
    }
}

impl<R, W> AsyncRead for TeeReader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(kind) = this.failed {
            return Poll::Ready(Err(io::Error::new(kind, "tee sink failed")));
        }
        if this.eof {
            return Poll::Ready(Ok(()));
        }

        loop {
            // mirror the pending chunk before exposing any of it
            while this.mirrored < this.filled {
                let chunk = &this.buf[this.mirrored..this.filled];
                match Pin::new(&mut this.sink).poll_write(cx, chunk) {
                    Poll::Ready(Ok(0)) => {
                        return this.fail(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "tee sink accepted no bytes",
                        ));
                    }
                    Poll::Ready(Ok(n)) => this.mirrored += n,
                    Poll::Ready(Err(err)) => return this.fail(err),
                    Poll::Pending => return Poll::Pending,
                }
            }

            if this.delivered < this.filled {
                let n = cmp::min(out.remaining(), this.filled - this.delivered);
                out.put_slice(&this.buf[this.delivered..this.delivered + n]);
                this.delivered += n;
                return Poll::Ready(Ok(()));
            }

            let mut chunk = ReadBuf::new(&mut this.buf);
            match Pin::new(&mut this.reader).poll_read(cx, &mut chunk) {
                Poll::Ready(Ok(())) => {
                    let n = chunk.filled().len();
                    this.filled = n;
                    this.mirrored = 0;
                    this.delivered = 0;
                    if n == 0 {
                        return match Pin::new(&mut this.sink).poll_flush(cx) {
                            Poll::Ready(Ok(())) => {
                                this.eof = true;
                                Poll::Ready(Ok(()))
                            }
                            Poll::Ready(Err(err)) => this.fail(err),
                            Poll::Pending => Poll::Pending,
                        };
                    }
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    /// Sink that accepts `budget` bytes and then fails.
    struct BrokenSink {
        budget: usize,
        written: Vec<u8>,
    }

    impl AsyncWrite for BrokenSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.budget == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::StorageFull, "disk full")));
            }
            let n = cmp::min(self.budget, buf.len());
            self.budget -= n;
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn mirrors_everything_in_order() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut tee = TeeReader::new(Cursor::new(data.clone()), Vec::new());

        let mut seen = Vec::new();
        tee.read_to_end(&mut seen).await.unwrap();
        assert!(tee.is_finished());

        let (_, mirrored) = tee.into_inner();
        assert_eq!(seen, data);
        assert_eq!(mirrored, data);
    }

    #[tokio::test]
    async fn small_reads_see_the_same_bytes() {
        let data = b"the quick brown fox".to_vec();
        let mut tee = TeeReader::new(Cursor::new(data.clone()), Vec::new());

        let mut seen = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = tee.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        assert_eq!(seen, data);
        assert_eq!(tee.into_inner().1, data);
    }

    #[tokio::test]
    async fn sink_error_short_circuits_reads() {
        let sink = BrokenSink {
            budget: 4,
            written: Vec::new(),
        };
        let mut tee = TeeReader::new(Cursor::new(vec![1u8; 16]), sink);

        let mut buf = [0u8; 16];
        let err = tee.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);

        let err = tee.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
        assert_eq!(tee.into_inner().1.written, vec![1u8; 4]);
    }

    #[tokio::test]
    async fn close_shuts_the_sink_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.bin");
        let file = tokio::fs::File::create(&path).await.unwrap();

        let mut tee = TeeReader::new(Cursor::new(b"abc".to_vec()), file);
        let mut seen = Vec::new();
        tee.read_to_end(&mut seen).await.unwrap();
        tee.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }
}
