//! Request fingerprints: the cache key for a request.
//!
//! A fingerprint is the request target followed by the body content. For
//! `multipart/*` bodies the content is the concatenation of every part's
//! payload in encounter order; boundaries and part headers do not
//! contribute. Two fields with the same bytes under different names
//! therefore contribute identically.
//!
//! Fingerprinting drains the request body and puts a buffered copy of the
//! exact original bytes back before returning, on success and on failure
//! alike, so the request can still be forwarded upstream unchanged.

use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::http::Request;
use crate::http::multipart::{self, MultipartError};

/// Errors that prevent a request from being fingerprinted.
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to read request body: {0}")]
    BodyRead(#[source] io::Error),

    #[error("malformed multipart body: {0}")]
    MalformedMultipart(#[from] MultipartError),
}

/// Opaque cache key identifying a cacheable request.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Bytes);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Computes the fingerprint of `request` and restores its body.
///
/// # Errors
///
/// - [`FingerprintError::BodyRead`] if the body stream fails before it is
///   fully drained.
/// - [`FingerprintError::MalformedMultipart`] if the content type is
///   `multipart/*` but the body cannot be split into parts. The body has
///   already been restored when this is returned.
pub async fn fingerprint(request: &mut Request) -> Result<Fingerprint, FingerprintError> {
    let original = std::mem::take(request.body_mut())
        .collect()
        .await
        .map_err(FingerprintError::BodyRead)?;
    request.set_body(original.clone());

    let target = request.target().as_bytes();
    let content_type = request.headers().get("content-type").unwrap_or_default();

    if !multipart::is_multipart(content_type) {
        let mut key = BytesMut::with_capacity(target.len() + original.len());
        key.put_slice(target);
        key.put_slice(&original);
        return Ok(Fingerprint(key.freeze()));
    }

    let boundary = multipart::boundary(content_type).ok_or(MultipartError::MissingBoundary)?;
    let payloads = multipart::part_payloads(original.clone(), boundary).await?;
    let mut key = BytesMut::with_capacity(target.len() + original.len());
    key.put_slice(target);
    for payload in &payloads {
        key.put_slice(payload);
    }

    Ok(Fingerprint(key.freeze()))
}
