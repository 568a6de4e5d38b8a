//! `Transfer-Encoding: chunked` decoding (RFC 9112 §7.1).
//!
//! [`Decoder`] works on a growing buffer and remembers how far it got, so
//! feeding it the same buffer after every read costs time proportional to
//! the new bytes only. Trailer fields are validated and dropped.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors raised while decoding a chunked body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("invalid chunk size line")]
    InvalidChunkSize,

    #[error("chunk of {size} bytes is not followed by CRLF")]
    MissingChunkTerminator { size: usize },

    #[error("chunk size {0} does not fit in memory")]
    ChunkTooLarge(u64),

    #[error("invalid trailer section: {0}")]
    Trailers(#[from] httparse::Error),
}

/// A fully decoded chunked body.
#[derive(Debug)]
pub struct Decoded {
    /// The concatenated chunk payloads.
    pub body: Bytes,
    /// Number of input bytes the chunked encoding occupied, trailers included.
    pub consumed: usize,
}

/// Maximum trailer fields accepted after the last chunk.
const MAX_TRAILERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting a chunk size line.
    Size,
    /// Inside a chunk with this many payload bytes still to come.
    Data { size: usize, remaining: usize },
    /// Expecting the CRLF that closes a chunk of `size` bytes.
    DataEnd { size: usize },
    /// After the zero-size chunk, expecting the trailer section.
    Trailers,
}

/// Incremental chunked decoder.
///
/// Every call to [`decode`](Self::decode) must pass the same buffer as the
/// previous call, possibly extended at the end.
#[derive(Debug)]
pub struct Decoder {
    state: State,
    /// Input bytes already consumed.
    pos: usize,
    body: BytesMut,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            pos: 0,
            body: BytesMut::new(),
        }
    }

    /// Continues decoding `buf`.
    ///
    /// Returns `Ok(None)` while the terminating zero-size chunk or its
    /// trailer section is still missing.
    ///
    /// # Errors
    ///
    /// Returns a [`ChunkedError`] when the framing is malformed.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<Decoded>, ChunkedError> {
        loop {
            let rest = buf.get(self.pos..).unwrap_or_default();
            match self.state {
                State::Size => {
                    let (line_len, size) = match httparse::parse_chunk_size(rest) {
                        Ok(httparse::Status::Complete(pair)) => pair,
                        Ok(httparse::Status::Partial) => return Ok(None),
                        Err(_) => return Err(ChunkedError::InvalidChunkSize),
                    };
                    self.pos += line_len;
                    self.state = match size {
                        0 => State::Trailers,
                        size => {
                            let size = usize::try_from(size)
                                .map_err(|_| ChunkedError::ChunkTooLarge(size))?;
                            State::Data {
                                size,
                                remaining: size,
                            }
                        }
                    };
                }
                State::Data { size, remaining } => {
                    if rest.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(rest.len());
                    self.body.put_slice(&rest[..take]);
                    self.pos += take;
                    self.state = match remaining - take {
                        0 => State::DataEnd { size },
                        remaining => State::Data { size, remaining },
                    };
                }
                State::DataEnd { size } => {
                    if rest.len() < 2 {
                        return Ok(None);
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(ChunkedError::MissingChunkTerminator { size });
                    }
                    self.pos += 2;
                    self.state = State::Size;
                }
                State::Trailers => {
                    let mut trailers = [httparse::EMPTY_HEADER; MAX_TRAILERS];
                    return match httparse::parse_headers(rest, &mut trailers)? {
                        httparse::Status::Complete((trailer_len, _)) => {
                            self.pos += trailer_len;
                            Ok(Some(Decoded {
                                body: self.body.split().freeze(),
                                consumed: self.pos,
                            }))
                        }
                        httparse::Status::Partial => Ok(None),
                    };
                }
            }
        }
    }
}

/// Decodes a chunked message body from the start of `buf` in one pass.
///
/// Returns `Ok(None)` if `buf` ends before the terminating zero-size chunk
/// and its trailer section.
///
/// # Errors
///
/// Returns a [`ChunkedError`] when the framing is malformed.
pub fn decode(buf: &[u8]) -> Result<Option<Decoded>, ChunkedError> {
    Decoder::new().decode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chunks_and_reports_consumed() {
        let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\nNEXT";
        let decoded = decode(raw).unwrap().unwrap();
        assert_eq!(&decoded.body[..], b"hello world");
        assert_eq!(&raw[decoded.consumed..], b"NEXT");
    }

    #[test]
    fn chunk_extensions_and_trailers() {
        let raw = b"3;name=val\r\nabc\r\n0\r\nX-Checksum: 1\r\n\r\n";
        let decoded = decode(raw).unwrap().unwrap();
        assert_eq!(&decoded.body[..], b"abc");
        assert_eq!(decoded.consumed, raw.len());
    }

    #[test]
    fn partial_input_needs_more() {
        assert!(decode(b"5\r\nhel").unwrap().is_none());
        assert!(decode(b"5\r\nhello\r\n0\r\n").unwrap().is_none());
        assert!(decode(b"").unwrap().is_none());
    }

    #[test]
    fn resumes_across_reads() {
        let raw = b"4\r\nWiki\r\n5;x=y\r\npedia\r\n0\r\nTrailer: t\r\n\r\n";
        let mut decoder = Decoder::new();
        for end in 0..raw.len() {
            assert!(decoder.decode(&raw[..end]).unwrap().is_none(), "{end}");
        }
        let decoded = decoder.decode(raw).unwrap().unwrap();
        assert_eq!(&decoded.body[..], b"Wikipedia");
        assert_eq!(decoded.consumed, raw.len());
    }

    #[test]
    fn huge_chunk_size_waits_without_overflow() {
        for raw in [&b"ffffffffffffffed\r\nab"[..], &b"ffffffffffffffff\r\nab\r\n0\r\n\r\n"[..]] {
            assert!(matches!(
                decode(raw),
                Ok(None) | Err(ChunkedError::ChunkTooLarge(_))
            ));
        }
    }

    #[test]
    fn missing_terminator() {
        let err = decode(b"2\r\nabX\r\n0\r\n\r\n").unwrap_err();
        assert_eq!(err, ChunkedError::MissingChunkTerminator { size: 2 });
    }

    #[test]
    fn bad_size_line() {
        assert_eq!(decode(b"zz\r\n").unwrap_err(), ChunkedError::InvalidChunkSize);
    }
}
