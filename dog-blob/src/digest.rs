use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine;
use bytes::Bytes;
use futures_core::Stream;
use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::ByteStream;

#[derive(Default)]
struct Observation {
    hasher: Md5,
    size: u64,
}

/// Single-pass tee over a content stream.
///
/// Every chunk handed downstream is also fed to an MD5 hasher and counted.
/// At most `size_maximum + 1` bytes are read from the source, so oversized
/// content is detected without draining an unbounded body.
pub struct DigestingStream {
    inner: ByteStream,
    remaining: u64,
    observation: Arc<Mutex<Observation>>,
}

/// Read side of a `DigestingStream`, consulted after the store has consumed it.
#[derive(Clone)]
pub struct ContentObserver {
    size_maximum: u64,
    observation: Arc<Mutex<Observation>>,
}

impl DigestingStream {
    pub fn new(inner: ByteStream, size_maximum: u64) -> (Self, ContentObserver) {
        let observation = Arc::new(Mutex::new(Observation::default()));
        let stream = Self {
            inner,
            remaining: size_maximum.saturating_add(1),
            observation: observation.clone(),
        };
        let observer = ContentObserver {
            size_maximum,
            observation,
        };
        (stream, observer)
    }

    pub fn into_byte_stream(self) -> ByteStream {
        Box::pin(self)
    }
}

impl Stream for DigestingStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.remaining == 0 {
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(mut chunk))) => {
                if chunk.len() as u64 > this.remaining {
                    chunk.truncate(this.remaining as usize);
                }
                this.remaining -= chunk.len() as u64;
                let mut observation = this.observation.lock();
                observation.hasher.update(&chunk);
                observation.size += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

impl ContentObserver {
    /// Bytes read so far (capped at `size_maximum + 1`).
    pub fn size(&self) -> u64 {
        self.observation.lock().size
    }

    pub fn exceeds_maximum(&self) -> bool {
        self.size() > self.size_maximum
    }

    pub fn size_maximum(&self) -> u64 {
        self.size_maximum
    }

    /// Base64 MD5 of the bytes read so far.
    pub fn digest_md5(&self) -> String {
        let digest = self.observation.lock().hasher.clone().finalize();
        base64::engine::general_purpose::STANDARD.encode(digest.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt, TryStreamExt};

    fn chunked(chunks: &[&'static str]) -> ByteStream {
        let items: Vec<Result<Bytes, std::io::Error>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn observes_digest_and_size_across_chunks() {
        let (stream, observer) = DigestingStream::new(chunked(&["hel", "lo"]), 100);
        let collected: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(collected.concat(), b"hello".to_vec());
        assert_eq!(observer.size(), 5);
        assert_eq!(observer.digest_md5(), "XUFAKrxLKna5cZ2REBfFkg==");
        assert!(!observer.exceeds_maximum());
    }

    #[tokio::test]
    async fn empty_stream_has_empty_digest() {
        let (stream, observer) = DigestingStream::new(chunked(&[]), 0);
        assert_eq!(stream.count().await, 0);
        assert_eq!(observer.size(), 0);
        assert_eq!(observer.digest_md5(), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[tokio::test]
    async fn stops_one_byte_past_the_maximum() {
        let (stream, observer) = DigestingStream::new(chunked(&["0123", "4567", "89"]), 5);
        let collected: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(collected.concat(), b"012345".to_vec());
        assert_eq!(observer.size(), 6);
        assert!(observer.exceeds_maximum());
    }

    #[tokio::test]
    async fn exactly_the_maximum_is_accepted() {
        let (stream, observer) = DigestingStream::new(chunked(&["01234", "56789"]), 10);
        let _: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(observer.size(), 10);
        assert!(!observer.exceeds_maximum());
        assert_eq!(observer.digest_md5(), "eB5eJF1ptWaXm4bijSPyxw==");
    }

    #[tokio::test]
    async fn source_errors_pass_through() {
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")),
        ];
        let (stream, observer) = DigestingStream::new(Box::pin(stream::iter(items)), 10);
        let result: Result<Vec<Bytes>, _> = stream.try_collect().await;
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(observer.size(), 2);
    }
}
