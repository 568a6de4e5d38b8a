//! Request bodies.
//!
//! A [`Body`] is either already buffered in memory or a single-read
//! [`AsyncRead`] stream. Streams can be drained exactly once with
//! [`Body::collect`]; callers that need to read a body and still forward it
//! put a buffered copy back with `Body::from(bytes)`.

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

enum Kind {
    Full(Bytes),
    Stream(Pin<Box<dyn AsyncRead + Send + Sync>>),
}

/// An HTTP message body.
///
/// # Examples
///
/// ```
/// use cacheproxy::http::Body;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// let body = Body::from_reader(&b"streamed"[..]);
/// assert!(!body.is_buffered());
/// assert_eq!(&body.collect().await?[..], b"streamed");
/// # Ok(())
/// # }
/// ```
pub struct Body {
    kind: Kind,
}

impl Body {
    /// An empty, buffered body.
    pub fn empty() -> Self {
        Self::from(Bytes::new())
    }

    /// Wraps a reader that will be drained on first [`collect`](Self::collect).
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        Self {
            kind: Kind::Stream(Box::pin(reader)),
        }
    }

    /// Returns `true` when the body is held in memory.
    pub fn is_buffered(&self) -> bool {
        matches!(self.kind, Kind::Full(_))
    }

    /// Returns the buffered bytes without consuming the body, or `None` for
    /// a body that is still a stream.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.kind {
            Kind::Full(bytes) => Some(bytes),
            Kind::Stream(_) => None,
        }
    }

    /// Reads the whole body into memory.
    ///
    /// # Errors
    ///
    /// Propagates any I/O error raised by the underlying reader.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self.kind {
            Kind::Full(bytes) => Ok(bytes),
            Kind::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Full(bytes) => f.debug_tuple("Body::Full").field(&bytes.len()).finish(),
            Kind::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            kind: Kind::Full(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from(Bytes::from(bytes))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::from(Bytes::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_body_is_returned_as_is() {
        let body = Body::from("hello");
        assert_eq!(body.as_bytes().map(|b| &b[..]), Some(&b"hello"[..]));
        assert_eq!(&body.collect().await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn stream_is_drained() {
        let body = Body::from_reader(std::io::Cursor::new(b"abc".to_vec()));
        assert!(body.as_bytes().is_none());
        assert_eq!(&body.collect().await.unwrap()[..], b"abc");
    }

    #[test]
    fn default_is_empty() {
        let body = Body::default();
        assert!(body.is_buffered());
        assert!(body.as_bytes().is_some_and(Bytes::is_empty));
    }
}
