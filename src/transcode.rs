use std::io::{self, Read};

use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, Method, StatusCode};

#[derive(Debug)]
pub(crate) enum DecodeContentEncodingError {
    Decode { encoding: String, message: String },
    TooLarge { actual_bytes: usize },
}

fn read_to_end_limited<R: Read>(
    reader: &mut R,
    encoding: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, DecodeContentEncodingError> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 8 * 1024];

    loop {
        let read = reader.read(&mut chunk).map_err(|error: io::Error| {
            DecodeContentEncodingError::Decode {
                encoding: encoding.to_owned(),
                message: error.to_string(),
            }
        })?;
        if read == 0 {
            break;
        }
        let next_size = decoded.len().saturating_add(read);
        if next_size > max_bytes {
            return Err(DecodeContentEncodingError::TooLarge {
                actual_bytes: next_size,
            });
        }
        decoded.extend_from_slice(&chunk[..read]);
    }

    Ok(decoded)
}

/// Responses that never carry a decodable payload are passed through
/// untouched even when a Content-Encoding header is present.
pub(crate) fn should_decode_content_encoded_body(
    method: &Method,
    status: StatusCode,
    body_len: usize,
) -> bool {
    if body_len == 0 {
        return false;
    }
    if *method == Method::HEAD {
        return false;
    }
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return false;
    }
    true
}

/// Decodes a gzip (or identity) content-encoded body in place. Returns
/// the decoded bytes plus whether any decoding happened, so the caller
/// knows to drop the now-stale Content-Encoding/Content-Length headers.
/// Unknown encodings are left untouched rather than rejected; a caller
/// that asked for them gets the raw bytes back.
pub(crate) fn decode_content_encoded_body_limited(
    body: Bytes,
    headers: &HeaderMap,
    max_bytes: usize,
) -> Result<(Bytes, bool), DecodeContentEncodingError> {
    let max_bytes = max_bytes.max(1);
    let Some(content_encoding) = headers.get(CONTENT_ENCODING) else {
        return Ok((body, false));
    };
    let Ok(content_encoding) = content_encoding.to_str() else {
        return Ok((body, false));
    };

    match content_encoding.trim().to_ascii_lowercase().as_str() {
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
            let decoded = read_to_end_limited(&mut decoder, "gzip", max_bytes)?;
            Ok((Bytes::from(decoded), true))
        }
        "identity" | "" => Ok((body, false)),
        _ => Ok((body, false)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::Bytes;
    use http::header::{CONTENT_ENCODING, HeaderMap, HeaderValue};
    use http::{Method, StatusCode};

    use super::{
        DecodeContentEncodingError, decode_content_encoded_body_limited,
        should_decode_content_encoded_body,
    };

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    fn gzip_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers
    }

    #[test]
    fn skips_empty_head_and_bodyless_statuses() {
        assert!(!should_decode_content_encoded_body(&Method::GET, StatusCode::OK, 0));
        assert!(!should_decode_content_encoded_body(&Method::HEAD, StatusCode::OK, 10));
        assert!(!should_decode_content_encoded_body(
            &Method::GET,
            StatusCode::NO_CONTENT,
            10
        ));
        assert!(should_decode_content_encoded_body(&Method::GET, StatusCode::OK, 10));
    }

    #[test]
    fn decodes_gzip_bodies() {
        let (decoded, changed) =
            decode_content_encoded_body_limited(gzip(b"payload"), &gzip_headers(), 1024).unwrap();
        assert!(changed);
        assert_eq!(decoded.as_ref(), b"payload");
    }

    #[test]
    fn passes_unencoded_bodies_through() {
        let (decoded, changed) =
            decode_content_encoded_body_limited(Bytes::from_static(b"plain"), &HeaderMap::new(), 1024)
                .unwrap();
        assert!(!changed);
        assert_eq!(decoded.as_ref(), b"plain");
    }

    #[test]
    fn corrupt_gzip_is_a_decode_error() {
        let result = decode_content_encoded_body_limited(
            Bytes::from_static(b"definitely not gzip"),
            &gzip_headers(),
            1024,
        );
        assert!(matches!(
            result,
            Err(DecodeContentEncodingError::Decode { ref encoding, .. }) if encoding == "gzip"
        ));
    }

    #[test]
    fn decoded_body_over_the_limit_is_rejected() {
        let result =
            decode_content_encoded_body_limited(gzip(&vec![0_u8; 4096]), &gzip_headers(), 128);
        assert!(matches!(
            result,
            Err(DecodeContentEncodingError::TooLarge { .. })
        ));
    }
}
