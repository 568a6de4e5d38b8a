//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Supports HTTP/1.1 persistent connections (keep-alive) and request bodies
//! framed by `Content-Length` or `Transfer-Encoding: chunked`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode, chunked,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// An HTTP/1.1 listener.
///
/// Binds to a TCP address and dispatches incoming requests, body included,
/// to a handler function.
///
/// # Examples
///
/// ```rust,no_run
/// use cacheproxy::server::Server;
/// use cacheproxy::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req| async {
///         Response::new(StatusCode::OK).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind<A>(addr: A) -> Result<Self, ServerError>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler receives a [`Request`] with a fully buffered body and must
    /// return a [`Future`] that resolves to a [`Response`]. The handler is
    /// wrapped in an [`Arc`] and shared across all spawned Tokio tasks, so it
    /// must be `Send + Sync + 'static`.
    ///
    /// This method runs until the process is terminated or an unrecoverable
    /// listener error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "cacheproxy listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Outcome of trying to frame one request out of the connection buffer.
enum Framed {
    /// A complete request occupying this many buffered bytes.
    Ready(Request, usize),
    /// More bytes are needed. `expects_continue` is set once the head is
    /// complete and the client asked for `100 Continue`.
    Partial { expects_continue: bool },
}

/// How the body of the request being framed is delimited.
enum BodyFraming {
    Length(usize),
    Chunked(chunked::Decoder),
}

/// A parsed request head waiting for its body.
struct PendingHead {
    request: Request,
    body_offset: usize,
    expects_continue: bool,
    body: BodyFraming,
}

/// Frames requests one at a time out of a connection buffer.
///
/// The head is parsed once and the body decoder keeps its progress, so
/// re-framing after each read only looks at the new bytes. The caller must
/// drop the bytes of a [`Framed::Ready`] request before framing the next.
#[derive(Default)]
struct Framer {
    pending: Option<PendingHead>,
}

impl Framer {
    fn frame(&mut self, buf: &[u8]) -> Result<Framed, RequestError> {
        let mut head = match self.pending.take() {
            Some(head) => head,
            None => match Request::parse(buf) {
                Ok((request, body_offset)) => {
                    let body = if request.is_chunked() {
                        BodyFraming::Chunked(chunked::Decoder::new())
                    } else {
                        BodyFraming::Length(request.content_length()?.unwrap_or(0))
                    };
                    PendingHead {
                        expects_continue: request.headers().has_token("expect", "100-continue"),
                        request,
                        body_offset,
                        body,
                    }
                }
                Err(RequestError::Incomplete) => {
                    return Ok(Framed::Partial {
                        expects_continue: false,
                    });
                }
                Err(e) => return Err(e),
            },
        };

        let available = &buf[head.body_offset..];
        let complete = match &mut head.body {
            BodyFraming::Length(len) => (available.len() >= *len)
                .then(|| (Bytes::copy_from_slice(&available[..*len]), *len)),
            BodyFraming::Chunked(decoder) => decoder
                .decode(available)?
                .map(|decoded| (decoded.body, decoded.consumed)),
        };

        let Some((body, consumed)) = complete else {
            let expects_continue = head.expects_continue;
            self.pending = Some(head);
            return Ok(Framed::Partial { expects_continue });
        };

        let mut request = head.request;
        if matches!(head.body, BodyFraming::Chunked(_)) {
            let headers = request.headers_mut();
            headers.remove("transfer-encoding");
            headers.set("Content-Length", body.len().to_string());
        }
        request.set_body(body);
        Ok(Framed::Ready(request, head.body_offset + consumed))
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut framer = Framer::default();
    let mut sent_continue = false;

    loop {
        // Pipelined requests may already be buffered; only read when needed.
        let framed = match framer.frame(&buf) {
            Ok(framed) => framed,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::text(StatusCode::BAD_REQUEST, format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        let (mut request, consumed) = match framed {
            Framed::Ready(request, consumed) => (request, consumed),
            Framed::Partial { expects_continue } => {
                if expects_continue && !sent_continue {
                    stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
                    sent_continue = true;
                }

                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request too large, sending 413");
                    let response = Response::text(StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large")
                        .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    break;
                }

                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
        };

        let _ = buf.split_to(consumed);
        sent_continue = false;
        request.headers_mut().remove("expect");
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = handler(request).await.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(raw: &[u8]) -> Result<Framed, RequestError> {
        Framer::default().frame(raw)
    }

    fn ready(raw: &[u8]) -> (Request, usize) {
        match frame(raw).unwrap() {
            Framed::Ready(request, consumed) => (request, consumed),
            Framed::Partial { .. } => panic!("request should be complete"),
        }
    }

    #[test]
    fn frames_content_length_body() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /b HTTP/1.1\r\n\r\n";
        let (request, consumed) = ready(raw);
        assert_eq!(request.body().as_bytes().map(|b| &b[..]), Some(&b"hello"[..]));
        assert_eq!(&raw[consumed..consumed + 3], b"GET");
    }

    #[test]
    fn waits_for_full_body() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 10\r\nExpect: 100-continue\r\n\r\nhel";
        assert!(matches!(
            frame(raw).unwrap(),
            Framed::Partial {
                expects_continue: true
            }
        ));
        assert!(matches!(
            frame(b"GET / HTTP/1.1\r\nHost").unwrap(),
            Framed::Partial {
                expects_continue: false
            }
        ));
    }

    #[test]
    fn decodes_chunked_body_and_relabels_length() {
        let raw = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (request, consumed) = ready(raw);
        assert_eq!(consumed, raw.len());
        assert_eq!(request.body().as_bytes().map(|b| &b[..]), Some(&b"Wikipedia"[..]));
        assert!(!request.is_chunked());
        assert_eq!(request.content_length().unwrap(), Some(9));
    }

    #[test]
    fn chunked_body_resumes_across_reads() {
        let raw = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
        let mut framer = Framer::default();
        for end in 0..raw.len() {
            assert!(matches!(framer.frame(&raw[..end]).unwrap(), Framed::Partial { .. }));
        }
        match framer.frame(raw).unwrap() {
            Framed::Ready(request, consumed) => {
                assert_eq!(consumed, raw.len());
                assert_eq!(request.body().as_bytes().map(|b| &b[..]), Some(&b"abcde"[..]));
            }
            Framed::Partial { .. } => panic!("request should be complete"),
        }
        assert!(framer.pending.is_none());
    }

    #[test]
    fn huge_chunk_size_does_not_panic() {
        let raw = b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffed\r\nab";
        assert!(matches!(
            frame(raw),
            Ok(Framed::Partial { .. }) | Err(RequestError::Chunked(_))
        ));
    }

    #[test]
    fn rejects_malformed_chunked_body() {
        let raw = b"POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert!(matches!(frame(raw), Err(RequestError::Chunked(_))));
    }

    #[test]
    fn rejects_bad_content_length() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
        assert!(matches!(frame(raw), Err(RequestError::InvalidContentLength(_))));
    }

    #[tokio::test]
    async fn serves_keep_alive_connection() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|req: Request| async move {
            let body = req.body().as_bytes().cloned().unwrap_or_default();
            Response::new(StatusCode::OK).body(body)
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcPOST /y HTTP/1.1\r\nConnection: close\r\nContent-Length: 2\r\n\r\nde")
            .await
            .unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(text.contains("Connection: keep-alive\r\n\r\nabc"));
        assert!(text.ends_with("Connection: close\r\n\r\nde"));
    }

    #[tokio::test]
    async fn answers_malformed_request_with_400() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|_req: Request| async { Response::new(StatusCode::OK) }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"NOT AN HTTP REQUEST\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }
}
