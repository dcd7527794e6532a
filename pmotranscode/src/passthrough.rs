use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    error::TranscodeError,
    profile::Profile,
    transcoder::{StreamOrigin, TranscodeStream, Transcoder},
};

/// Serves the source file unmodified.
///
/// Used when no encoding is requested, or when no encoder is configured.
/// Open failures (missing file, permissions) are returned as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranscoder;

impl PassthroughTranscoder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transcoder for PassthroughTranscoder {
    async fn transcode(
        &self,
        _profile: &Profile,
        input: &Path,
        _cancel: CancellationToken,
    ) -> Result<TranscodeStream, TranscodeError> {
        let file = tokio::fs::File::open(input).await?;
        tracing::debug!(input = %input.display(), "Serving source file unmodified");
        Ok(TranscodeStream::new(StreamOrigin::Passthrough, file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn returns_the_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.flac");
        std::fs::write(&path, b"fLaC not really").unwrap();

        let profile = crate::profile::pcm16le();
        let mut stream = PassthroughTranscoder::new()
            .transcode(&profile, &path, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.origin(), StreamOrigin::Passthrough);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"fLaC not really");
    }

    #[tokio::test]
    async fn missing_file_is_surfaced_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let profile = crate::profile::pcm16le();
        let err = PassthroughTranscoder::new()
            .transcode(&profile, &dir.path().join("nope.flac"), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            TranscodeError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }
}
