use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copies a window of `input` into `out`.
///
/// Exactly `start` bytes are discarded first; an input shorter than `start`
/// is not an error. With `length == 0` the remainder of the input is copied
/// verbatim. With `length > 0` at most `length` bytes are read from the input
/// and, when it ends early, the output is padded with zero bytes so that
/// exactly `length` bytes are written.
///
/// Returns the number of bytes written to `out`.
pub async fn copy_range<W, R>(out: &mut W, input: &mut R, start: u64, length: u64) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = (&mut *input).take(start);
    tokio::io::copy(&mut head, &mut tokio::io::sink()).await?;

    let written = if length == 0 {
        tokio::io::copy(input, out).await?
    } else {
        let mut window = (&mut *input)
            .take(length)
            .chain(tokio::io::repeat(0))
            .take(length);
        tokio::io::copy(&mut window, out).await?
    };

    out.flush().await?;
    Ok(written)
}
