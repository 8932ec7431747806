//! Request bodies.
//!
//! A [`Body`] is a byte source with a known or unknown length. Buffered
//! bodies are cheap to clone and can be replayed when a request is retried
//! on a fresh connection; a streaming body yields its bytes exactly once
//! and makes the request non-retryable.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;

use crate::error::BoxError;

type BoxStream = Pin<Box<dyn futures_core::Stream<Item = Result<Bytes, BoxError>> + Send + Sync>>;

/// The body of a `Request`.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Bytes(Bytes),
    Streaming(Option<BoxStream>),
}

impl Body {
    /// Wraps a stream of byte chunks as a one-shot body with unknown
    /// length.
    pub fn wrap_stream<S>(stream: S) -> Body
    where
        S: futures_core::Stream<Item = Result<Bytes, BoxError>> + Send + Sync + 'static,
    {
        Body {
            inner: Inner::Streaming(Some(Box::pin(stream))),
        }
    }

    /// The declared length: `Some` for buffered bodies, `None` for
    /// streaming ones.
    pub(crate) fn len(&self) -> Option<u64> {
        match &self.inner {
            Inner::Bytes(bytes) => Some(bytes.len() as u64),
            Inner::Streaming(_) => None,
        }
    }

    /// A replayable copy, when this body supports retries.
    pub(crate) fn try_clone(&self) -> Option<Body> {
        match &self.inner {
            Inner::Bytes(bytes) => Some(Body {
                inner: Inner::Bytes(bytes.clone()),
            }),
            Inner::Streaming(_) => None,
        }
    }

    /// Converts into the chunk source consumed by a transport. A streaming
    /// body can be taken exactly once; afterwards the source fails.
    pub(crate) fn into_data_stream(self) -> DataStream {
        match self.inner {
            Inner::Bytes(bytes) if bytes.is_empty() => DataStream::Empty,
            Inner::Bytes(bytes) => DataStream::Once(Some(bytes)),
            Inner::Streaming(Some(stream)) => DataStream::Boxed(stream),
            Inner::Streaming(None) => DataStream::Spent,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Bytes(bytes) => f.debug_struct("Body").field("len", &bytes.len()).finish(),
            Inner::Streaming(_) => f.debug_struct("Body").field("streaming", &true).finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body {
            inner: Inner::Bytes(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body {
            inner: Inner::Bytes(Bytes::from(vec)),
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body {
            inner: Inner::Bytes(Bytes::from(s)),
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body {
            inner: Inner::Bytes(Bytes::from_static(s.as_bytes())),
        }
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Body {
        Body {
            inner: Inner::Bytes(Bytes::from_static(bytes)),
        }
    }
}

/// The chunk source a transport drains while writing a request.
pub(crate) enum DataStream {
    Empty,
    Once(Option<Bytes>),
    Boxed(BoxStream),
    /// A streaming body that was already consumed by an earlier attempt.
    Spent,
}

impl futures_core::Stream for DataStream {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            DataStream::Empty => Poll::Ready(None),
            DataStream::Once(chunk) => Poll::Ready(chunk.take().map(Ok)),
            DataStream::Boxed(stream) => {
                futures_core::Stream::poll_next(stream.as_mut(), cx)
            }
            DataStream::Spent => Poll::Ready(Some(Err(
                "request body was already consumed and cannot be replayed".into(),
            ))),
        }
    }
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            DataStream::Empty => "Empty",
            DataStream::Once(_) => "Once",
            DataStream::Boxed(_) => "Boxed",
            DataStream::Spent => "Spent",
        };
        f.write_str(kind)
    }
}

/// Marker error: a body produced more bytes than its declared
/// content-length.
#[derive(Debug)]
pub(crate) struct BodyTooLong;

impl fmt::Display for BodyTooLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("request body longer than its declared content-length")
    }
}

impl std::error::Error for BodyTooLong {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn buffered_bodies_are_replayable() {
        let body = Body::from("hello");
        assert_eq!(body.len(), Some(5));
        assert!(body.try_clone().is_some());
    }

    #[test]
    fn streaming_bodies_are_one_shot() {
        let body = Body::wrap_stream(futures_util::stream::iter(vec![Ok(Bytes::from("x"))]));
        assert_eq!(body.len(), None);
        assert!(body.try_clone().is_none());
    }

    #[tokio::test]
    async fn data_stream_yields_buffered_bytes_once() {
        let mut data = Body::from("abc").into_data_stream();
        assert_eq!(data.next().await.unwrap().unwrap(), Bytes::from("abc"));
        assert!(data.next().await.is_none());
    }
}
