#![cfg(unix)]

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use pmotranscode::{
    CacheStore, CachingTranscoder, ProcessTranscoder, Profile, StreamOrigin, TranscodeError,
    TranscodeStream, Transcoder,
};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Process transcoder that remembers how many times it ran.
#[derive(Default)]
struct CountingTranscoder {
    runs: AtomicUsize,
}

impl CountingTranscoder {
    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for CountingTranscoder {
    async fn transcode(
        &self,
        profile: &Profile,
        input: &Path,
        cancel: CancellationToken,
    ) -> Result<TranscodeStream, TranscodeError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ProcessTranscoder::new().transcode(profile, input, cancel).await
    }
}

fn cat() -> Profile {
    Profile::new("audio/test", "test", 0, "cat <file>")
}

fn setup(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf, Arc<CountingTranscoder>, CachingTranscoder) {
    let root = tempfile::tempdir().unwrap();
    let input = root.path().join("track.flac");
    std::fs::write(&input, content).unwrap();
    let inner = Arc::new(CountingTranscoder::default());
    let caching = CachingTranscoder::new(inner.clone(), CacheStore::new(root.path().join("cache"), 0));
    (root, input, inner, caching)
}

async fn read_all(mut stream: TranscodeStream) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    Ok(out)
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let (_root, input, inner, caching) = setup(b"pcm samples");

    let first = caching.transcode(&cat(), &input, CancellationToken::new()).await.unwrap();
    assert_eq!(first.origin(), StreamOrigin::Encoded);
    assert_eq!(read_all(first).await.unwrap(), b"pcm samples");

    let second = caching.transcode(&cat(), &input, CancellationToken::new()).await.unwrap();
    assert_eq!(second.origin(), StreamOrigin::Cached);
    assert_eq!(read_all(second).await.unwrap(), b"pcm samples");

    assert_eq!(inner.runs(), 1);
    assert_eq!(caching.store().usage().await.unwrap(), 11);
}

#[tokio::test]
async fn failed_encode_leaves_nothing_behind() {
    let (_root, input, inner, caching) = setup(b"unused");
    let failing = Profile::new("audio/test", "test", 0, r#"sh -c "printf partial; exit 1" <file>"#);

    let mut stream = caching.transcode(&failing, &input, CancellationToken::new()).await.unwrap();
    let mut out = Vec::new();
    let err = TranscodeError::from(stream.read_to_end(&mut out).await.unwrap_err());
    assert!(matches!(err, TranscodeError::EncoderExit { code: 1 }));
    assert_eq!(caching.store().usage().await.unwrap(), 0);

    // the failure sticks instead of turning into a clean end of stream
    let mut buf = [0u8; 16];
    assert!(stream.read(&mut buf).await.is_err());
    drop(stream);

    // the next identical request encodes again instead of reading a truncated entry
    let stream = caching.transcode(&failing, &input, CancellationToken::new()).await.unwrap();
    assert_eq!(stream.origin(), StreamOrigin::Encoded);
    assert!(read_all(stream).await.is_err());
    assert_eq!(inner.runs(), 2);
}

#[tokio::test]
async fn cancelled_encode_is_discarded() {
    let (_root, input, _inner, caching) = setup(b"y");
    let endless = Profile::new("audio/test", "test", 0, "yes <file>");
    let cancel = CancellationToken::new();

    let mut stream = caching.transcode(&endless, &input, cancel.clone()).await.unwrap();
    let mut buf = vec![0u8; 4096];
    stream.read_exact(&mut buf).await.unwrap();
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(10), read_all(stream))
        .await
        .expect("encoder should stop once cancelled")
        .unwrap_err();
    assert!(TranscodeError::from(err).is_cancellation());
    assert_eq!(caching.store().usage().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_requests_encode_once() {
    let content = vec![42u8; 512 * 1024];
    let (_root, input, inner, caching) = setup(&content);
    let caching = Arc::new(caching);

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let caching = caching.clone();
        let input = input.clone();
        tasks.push(tokio::spawn(async move {
            let stream = caching.transcode(&cat(), &input, CancellationToken::new()).await?;
            let origin = stream.origin();
            let bytes = read_all(stream).await?;
            Ok::<_, TranscodeError>((origin, bytes))
        }));
    }

    let mut encoded = 0;
    for task in tasks {
        let (origin, bytes) = task.await.unwrap().unwrap();
        assert_eq!(bytes.len(), content.len());
        if origin == StreamOrigin::Encoded {
            encoded += 1;
        }
    }

    assert_eq!(encoded, 1);
    assert_eq!(inner.runs(), 1);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn latin1_file_names_reach_the_encoder() {
    use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

    let (root, _input, inner, caching) = setup(b"");
    let input = root.path().join(OsStr::from_bytes(b"caf\xe9.raw"));
    std::fs::write(&input, b"accented").unwrap();

    let stream = caching.transcode(&cat(), &input, CancellationToken::new()).await.unwrap();
    assert_eq!(stream.origin(), StreamOrigin::Encoded);
    assert_eq!(read_all(stream).await.unwrap(), b"accented");

    let stream = caching.transcode(&cat(), &input, CancellationToken::new()).await.unwrap();
    assert_eq!(stream.origin(), StreamOrigin::Cached);
    assert_eq!(inner.runs(), 1);
}

#[tokio::test]
async fn seeking_requests_bypass_the_cache() {
    let (_root, input, inner, caching) = setup(b"abc");
    let seeking = cat().with_seek(Duration::from_secs(30));

    for _ in 0..2 {
        let stream = caching.transcode(&seeking, &input, CancellationToken::new()).await.unwrap();
        assert_eq!(stream.origin(), StreamOrigin::Encoded);
        read_all(stream).await.unwrap();
    }
    assert_eq!(inner.runs(), 2);
    assert_eq!(caching.store().usage().await.unwrap(), 0);
}

#[tokio::test]
async fn partial_caching_keys_on_the_offset() {
    let (root, input, inner, _) = setup(b"abc");
    let caching = CachingTranscoder::new(inner.clone(), CacheStore::new(root.path().join("cache"), 0))
        .with_partial_caching(true);
    let seeking = Profile::new("audio/test", "test", 0, "sh -c \"cat \\\"$0\\\"\" <file> <seek>")
        .with_seek(Duration::from_secs(30));

    for _ in 0..2 {
        let stream = caching.transcode(&seeking, &input, CancellationToken::new()).await.unwrap();
        read_all(stream).await.unwrap();
    }
    assert_eq!(inner.runs(), 1);

    let elsewhere = seeking.clone().with_seek(Duration::from_secs(60));
    let stream = caching.transcode(&elsewhere, &input, CancellationToken::new()).await.unwrap();
    assert_eq!(stream.origin(), StreamOrigin::Encoded);
    read_all(stream).await.unwrap();
    assert_eq!(inner.runs(), 2);
}

#[tokio::test]
async fn eject_task_stops_on_cancel() {
    let (_root, _input, _inner, caching) = setup(b"");
    let cancel = CancellationToken::new();
    let handle = Arc::new(caching).spawn_eject_task(Duration::from_millis(10), cancel.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("eject task should stop")
        .unwrap();
}
