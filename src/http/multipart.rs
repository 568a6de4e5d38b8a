//! `multipart/*` body parsing (RFC 2046 §5.1).
//!
//! Part splitting is delegated to [`multer`]. The buffered body is handed to
//! it as a single-item stream and each field is read to completion in
//! encounter order.

use std::convert::Infallible;

use bytes::Bytes;
use thiserror::Error;

/// Errors raised while reading a multipart body.
#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("content type has no boundary parameter")]
    MissingBoundary,

    #[error("{0}")]
    Malformed(#[from] multer::Error),
}

/// Returns `true` if `content_type` names a `multipart/*` media type.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .get(..10)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("multipart/"))
}

/// Extracts the `boundary` parameter from a `Content-Type` value.
///
/// [`multer::parse_boundary`] only accepts `multipart/form-data`; this
/// accepts the parameter on any `multipart/*` subtype.
///
/// ```
/// use cacheproxy::http::multipart::boundary;
///
/// assert_eq!(boundary("multipart/form-data; boundary=XyZ"), Some("XyZ"));
/// assert_eq!(boundary(r#"multipart/mixed; Boundary="a b""#), Some("a b"));
/// assert_eq!(boundary("multipart/form-data"), None);
/// ```
pub fn boundary(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| {
            let value = value.trim();
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
        })
        .filter(|value| !value.is_empty())
}

/// Reads every part of the multipart `body` and returns the part payloads
/// in encounter order. Part headers and delimiters are not included.
///
/// # Errors
///
/// Returns [`MultipartError::Malformed`] if the body is not a complete
/// multipart entity delimited by `boundary`.
pub async fn part_payloads(body: Bytes, boundary: &str) -> Result<Vec<Bytes>, MultipartError> {
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut payloads = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        payloads.push(field.bytes().await?);
    }
    Ok(payloads)
}
