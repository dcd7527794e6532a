use std::{io, path::PathBuf};

/// Errors produced by the transcoding stack.
///
/// Configuration errors (`SplitCommand`, `NoProfileParts`,
/// `ExecutableNotFound`, `MissingFilePlaceholder`) are raised before any I/O.
/// Encoder errors are only reported once the process has terminated.
#[derive(thiserror::Error, Debug)]
pub enum TranscodeError {
    #[error("split command: unbalanced quoting in {template:?}")]
    SplitCommand { template: String },
    #[error("not enough profile parts")]
    NoProfileParts,
    #[error("find {program:?}: {source}")]
    ExecutableNotFound {
        program: String,
        #[source]
        source: which::Error,
    },
    #[error("profile command {template:?} has no <file> placeholder")]
    MissingFilePlaceholder { template: String },
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("starting {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoder exited with non 0 status code {code}")]
    EncoderExit { code: i32 },
    #[error("encoder was killed early")]
    EncoderKilled,
    #[error("transcode cancelled")]
    Cancelled,
    #[error("cache entry {path:?}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TranscodeError {
    pub(crate) fn cache(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TranscodeError::Cache {
            path: path.into(),
            source,
        }
    }

    /// True for failures of the external encoder process itself.
    pub fn is_encoder_error(&self) -> bool {
        matches!(
            self,
            TranscodeError::EncoderExit { .. } | TranscodeError::EncoderKilled
        )
    }

    /// True when the request stopped because the caller went away.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TranscodeError::EncoderKilled | TranscodeError::Cancelled
        )
    }

    /// Wraps the error so it can travel through an `AsyncRead`.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            TranscodeError::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}

impl From<io::Error> for TranscodeError {
    /// Recovers a `TranscodeError` previously wrapped by a stream, otherwise
    /// keeps the I/O error untouched.
    fn from(err: io::Error) -> Self {
        let wrapped = err
            .get_ref()
            .is_some_and(|inner| inner.is::<TranscodeError>());
        if !wrapped {
            return TranscodeError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<TranscodeError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => TranscodeError::Io(io::Error::other(other)),
            None => TranscodeError::Io(io::Error::other("empty transcode error")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_roundtrip_keeps_the_variant() {
        let err: TranscodeError = TranscodeError::EncoderExit { code: 3 }.into_io().into();
        assert!(matches!(err, TranscodeError::EncoderExit { code: 3 }));
        assert!(err.is_encoder_error());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn plain_io_errors_stay_untouched() {
        let err: TranscodeError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        match err {
            TranscodeError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }
}
