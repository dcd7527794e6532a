//! # pmotranscode
//!
//! On-the-fly audio transcoding for PMOMusic, with an on-disk cache of
//! completed encodes.
//!
//! A request names a [`Profile`] (output MIME type, file suffix, bitrate and
//! an encoder command template) and a source file. Three [`Transcoder`]s
//! share one interface:
//!
//! - [`PassthroughTranscoder`] serves the source file unmodified
//! - [`ProcessTranscoder`] runs the profile's command (usually ffmpeg) and
//!   streams its standard output
//! - [`CachingTranscoder`] wraps another transcoder and stores each complete
//!   result under a key derived from the exact command line
//!
//! Every request carries a `CancellationToken`. Cancelling it, or dropping
//! the returned stream, stops the encoder and discards any partial cache
//! entry.
//!
//! ## Example
//!
//! ```no_run
//! use std::{path::Path, sync::Arc};
//!
//! use pmotranscode::{CacheStore, CachingTranscoder, ProcessTranscoder, ProfileRegistry, Transcoder};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), pmotranscode::TranscodeError> {
//! let registry = ProfileRegistry::builtin();
//! let profile = registry.lookup("opus").expect("builtin profile").with_bitrate(128);
//!
//! let cache = CachingTranscoder::new(
//!     Arc::new(ProcessTranscoder::new()),
//!     CacheStore::new("/var/cache/pmomusic/transcode", 1024),
//! );
//!
//! let stream = cache
//!     .transcode(&profile, Path::new("/music/track.flac"), CancellationToken::new())
//!     .await?;
//! let mut out = tokio::fs::File::create("/tmp/track.ogg").await?;
//! stream.copy_to(&mut out).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `pmoconfig`: adds [`TranscodeConfigExt`] to build the profile registry
//!   and the cache from the PMOMusic configuration.

mod caching;
mod command;
mod error;
mod locks;
mod passthrough;
mod process;
mod profile;
mod size;
mod store;
mod transcoder;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

pub use caching::{CachingTranscoder, EjectReport};
pub use command::{CacheKey, ResolvedCommand, resolve};
pub use error::TranscodeError;
pub use passthrough::PassthroughTranscoder;
pub use process::{ProcessStream, ProcessTranscoder, spawn};
pub use profile::{
    BITRATE_PLACEHOLDER, BitRate, FILE_PLACEHOLDER, PCM16LE, Profile, ProfileRegistry,
    SEEK_PLACEHOLDER, pcm16le,
};
pub use size::expected_output_size;
pub use store::{CacheEntry, CacheStore};
pub use transcoder::{StreamOrigin, TranscodeStream, Transcoder};

#[cfg(feature = "pmoconfig")]
pub use config_ext::TranscodeConfigExt;
