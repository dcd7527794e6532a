//! Disk cache in front of another [`Transcoder`].
//!
//! A request is identified by the [`CacheKey`] of its resolved command line.
//! On a hit the stored file is streamed back and the encoder never runs. On
//! a miss the wrapped transcoder runs and its output is mirrored into a
//! staging file while the caller reads it. The staging file only becomes
//! the entry, by rename, when the encoder reached a clean end of stream;
//! every other outcome (encoder failure, cancellation, the caller dropping
//! the stream early, a full disk, the process dying) leaves no entry, so a
//! later request never reads a truncated encode.
//!
//! Requests with a seek offset bypass the cache unless partial caching is
//! enabled: every offset would otherwise produce its own entry.

use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use pmostream::TeeReader;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWrite, ReadBuf},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    command::{CacheKey, resolve},
    error::TranscodeError,
    locks::{KeyGuard, KeyLocks},
    profile::Profile,
    store::{CacheStore, remove_file},
    transcoder::{StreamOrigin, TranscodeStream, Transcoder},
};

/// Staging files untouched for this long belong to no live fill.
const STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EjectReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

pub struct CachingTranscoder {
    inner: Arc<dyn Transcoder>,
    store: CacheStore,
    locks: KeyLocks,
    cache_partial: bool,
}

impl CachingTranscoder {
    pub fn new(inner: Arc<dyn Transcoder>, store: CacheStore) -> Self {
        Self {
            inner,
            store,
            locks: KeyLocks::new(),
            cache_partial: false,
        }
    }

    /// Also caches requests that start at a non-zero seek offset.
    pub fn with_partial_caching(mut self, enabled: bool) -> Self {
        self.cache_partial = enabled;
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Deletes least recently used entries until the store fits its limit.
    ///
    /// Entries that are being written or waited on are left alone. A limit
    /// of zero disables eviction. Staging files abandoned by a dead fill are
    /// removed on every pass, whatever the limit.
    pub async fn eject(&self) -> Result<EjectReport, TranscodeError> {
        let (staging, mut entries): (Vec<_>, Vec<_>) =
            self.store.entries().await?.into_iter().partition(|entry| entry.staging);
        let mut report = EjectReport {
            remaining_bytes: staging.iter().chain(&entries).map(|entry| entry.len).sum(),
            ..EjectReport::default()
        };

        let now = SystemTime::now();
        for entry in staging {
            let age = now.duration_since(entry.modified).unwrap_or_default();
            if age < STALE_STAGING_AGE || entry.key.as_ref().is_some_and(|key| self.locks.is_held(key)) {
                continue;
            }
            tracing::debug!(path = %entry.path.display(), "Removing abandoned staging file");
            remove_file(&entry.path).await?;
            report.removed += 1;
            report.freed_bytes += entry.len;
            report.remaining_bytes -= entry.len;
        }

        let limit = self.store.limit_bytes();
        if limit == 0 || report.remaining_bytes <= limit {
            return Ok(report);
        }

        entries.sort_by_key(|entry| entry.modified);
        for entry in entries {
            if report.remaining_bytes <= limit {
                break;
            }
            if entry.key.as_ref().is_some_and(|key| self.locks.is_held(key)) {
                tracing::debug!(path = %entry.path.display(), "Skipping in-flight cache entry");
                continue;
            }
            remove_file(&entry.path).await?;
            report.removed += 1;
            report.freed_bytes += entry.len;
            report.remaining_bytes -= entry.len;
        }

        tracing::info!(
            removed = report.removed,
            freed_bytes = report.freed_bytes,
            remaining_bytes = report.remaining_bytes,
            "Transcode cache eviction done"
        );
        Ok(report)
    }

    /// Runs [`eject`](Self::eject) every `interval` until `cancel` fires.
    pub fn spawn_eject_task(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.eject().await {
                            tracing::warn!("Transcode cache eviction failed: {}", err);
                        }
                    }
                }
            }
            tracing::debug!("Transcode cache eviction task stopped");
        })
    }

    async fn fill(
        &self,
        profile: &Profile,
        input: &Path,
        cancel: CancellationToken,
        key: CacheKey,
    ) -> Result<TranscodeStream, TranscodeError> {
        let guard = tokio::select! {
            guard = self.locks.lock(&key) => guard,
            _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
        };

        if let Some(entry) = self.store.open_entry(&key).await? {
            drop(guard);
            if let Err(err) = self.store.touch(entry.path()).await {
                tracing::warn!("Could not refresh cache entry: {}", err);
            }
            tracing::debug!(key = %key, size = entry.size(), "Transcode cache hit");
            let (file, _) = entry.into_parts();
            return Ok(TranscodeStream::new(StreamOrigin::Cached, file));
        }

        tracing::debug!(key = %key, input = %input.display(), "Transcode cache miss");
        let (file, staging) = self.store.create_staging(&key).await?;
        let stream = match self.inner.transcode(profile, input, cancel).await {
            Ok(stream) => stream,
            Err(err) => {
                drop(file);
                if let Err(cleanup) = remove_file(&staging).await {
                    tracing::error!("Failed to remove unused staging file: {}", cleanup);
                }
                return Err(err);
            }
        };

        let origin = stream.origin();
        let sink = EntryWriter {
            file,
            path: staging.clone(),
        };
        let filling = FillingEntry {
            tee: Some(TeeReader::new(stream, sink)),
            settling: None,
            failed: None,
            entry: self.store.entry_path(&key),
            staging,
            key,
            guard: Some(guard),
        };
        Ok(TranscodeStream::new(origin, filling))
    }
}

#[async_trait]
impl Transcoder for CachingTranscoder {
    async fn transcode(
        &self,
        profile: &Profile,
        input: &Path,
        cancel: CancellationToken,
    ) -> Result<TranscodeStream, TranscodeError> {
        if !profile.seek().is_zero() && !self.cache_partial {
            tracing::debug!(seek = ?profile.seek(), "Seeking request bypasses the transcode cache");
            return self.inner.transcode(profile, input, cancel).await;
        }

        self.store.ensure_dir().await?;
        let key = resolve(profile, input)?.cache_key();
        self.fill(profile, input, cancel, key).await
    }
}

/// Staging file receiving the mirrored bytes.
struct EntryWriter {
    file: File,
    path: PathBuf,
}

impl EntryWriter {
    fn wrap(&self, err: io::Error) -> io::Error {
        TranscodeError::cache(&self.path, err).into_io()
    }

    /// Makes the staging file durable and moves it to `entry`.
    async fn publish(self, entry: PathBuf) -> io::Result<()> {
        let EntryWriter { file, path } = self;
        let synced = file.sync_all().await;
        drop(file);
        let published = match synced {
            Ok(()) => tokio::fs::rename(&path, &entry).await,
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            if let Err(cleanup) = remove_file(&path).await {
                tracing::error!("Failed to remove staging file: {}", cleanup);
            }
            return Err(TranscodeError::cache(&entry, err).into_io());
        }
        Ok(())
    }
}

impl AsyncWrite for EntryWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.file).poll_write(cx, buf) {
            Poll::Ready(Err(err)) => Poll::Ready(Err(self.wrap(err))),
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.file).poll_flush(cx) {
            Poll::Ready(Err(err)) => Poll::Ready(Err(self.wrap(err))),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.file).poll_shutdown(cx) {
            Poll::Ready(Err(err)) => Poll::Ready(Err(self.wrap(err))),
            other => other,
        }
    }
}

/// File work finishing a fill, run before the final read returns.
struct Settle {
    op: Pin<Box<dyn Future<Output = io::Result<()>> + Send>>,
    /// Stream error to report once the staging file is gone.
    error: Option<io::Error>,
}

/// Stream handed out on a miss. Owns the key until the entry is settled.
struct FillingEntry {
    tee: Option<TeeReader<TranscodeStream, EntryWriter>>,
    settling: Option<Settle>,
    failed: Option<(io::ErrorKind, String)>,
    entry: PathBuf,
    staging: PathBuf,
    key: CacheKey,
    guard: Option<KeyGuard>,
}

impl FillingEntry {
    fn begin_commit(&mut self) {
        if let Some(tee) = self.tee.take() {
            let (_, writer) = tee.into_inner();
            self.settling = Some(Settle {
                op: Box::pin(writer.publish(self.entry.clone())),
                error: None,
            });
        }
    }

    fn begin_discard(&mut self, err: io::Error) {
        self.tee = None;
        let staging = self.staging.clone();
        self.settling = Some(Settle {
            op: Box::pin(async move {
                if let Err(cleanup) = remove_file(&staging).await {
                    tracing::error!("Failed to remove staging file: {}", cleanup);
                }
                Ok(())
            }),
            error: Some(err),
        });
    }

    /// Releases the key once the file work is done.
    fn finish(&mut self, result: io::Result<()>, error: Option<io::Error>) -> io::Result<()> {
        self.settling = None;
        self.guard = None;
        match error.or(result.err()) {
            None => {
                tracing::debug!(key = %self.key, "Transcode cache entry complete");
                Ok(())
            }
            Some(err) => {
                tracing::debug!(key = %self.key, "Discarded partial transcode cache entry");
                self.failed = Some((err.kind(), err.to_string()));
                Err(err)
            }
        }
    }
}

impl AsyncRead for FillingEntry {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(settle) = this.settling.as_mut() {
                let result = ready!(settle.op.as_mut().poll(cx));
                let error = settle.error.take();
                return Poll::Ready(this.finish(result, error));
            }
            if let Some((kind, message)) = &this.failed {
                return Poll::Ready(Err(io::Error::new(*kind, message.clone())));
            }
            let Some(tee) = this.tee.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            match Pin::new(&mut *tee).poll_read(cx, buf) {
                Poll::Ready(Ok(())) if tee.is_finished() => this.begin_commit(),
                Poll::Ready(Ok(())) => return Poll::Ready(Ok(())),
                Poll::Ready(Err(err)) => this.begin_discard(err),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for FillingEntry {
    fn drop(&mut self) {
        if self.guard.is_none() {
            return;
        }
        self.tee = None;
        self.settling = None;
        // an interrupted rename can only move this fill's own staging file
        match std::fs::remove_file(&self.staging) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::error!(path = %self.staging.display(), "Failed to remove staging file: {}", err);
            }
        }
        tracing::debug!(key = %self.key, "Discarded partial transcode cache entry");
        self.guard = None;
    }
}
