//! Reader and writer for `multipart/related` message bodies.
//!
//! The reader tolerates CRLF and bare-LF line endings, a preamble before the
//! first boundary, and parts with or without their own headers. The writer
//! always emits CRLF.

use bytes::{BufMut, Bytes, BytesMut};

#[derive(thiserror::Error, Debug)]
pub enum MultipartError {
    #[error("multipart body does not contain the opening boundary")]
    MissingOpeningBoundary,

    #[error("multipart body is not terminated by the closing boundary")]
    MissingClosingBoundary,

    #[error("part headers are not terminated by an empty line")]
    MalformedPartHeaders,
}

#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl MultipartPart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Extract the `boundary` parameter of a `multipart/related` content type.
pub fn boundary_param(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Split a `multipart/related` body into its parts.
pub fn parse_related(body: &[u8], boundary: &str) -> Result<Vec<MultipartPart>, MultipartError> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut offset = find_subslice(body, &delimiter).ok_or(MultipartError::MissingOpeningBoundary)?;
    let mut parts = Vec::new();
    loop {
        let after = offset + delimiter.len();
        if body[after..].starts_with(b"--") {
            return Ok(parts);
        }
        let section_start = skip_line_break(&body[after..])
            .map(|n| after + n)
            .ok_or(MultipartError::MalformedPartHeaders)?;
        let next = find_subslice(&body[section_start..], &delimiter)
            .map(|n| section_start + n)
            .ok_or(MultipartError::MissingClosingBoundary)?;
        parts.push(parse_part(&body[section_start..next])?);
        offset = next;
    }
}

fn parse_part(section: &[u8]) -> Result<MultipartPart, MultipartError> {
    let (header_bytes, body) = split_headers(section)?;
    let headers = std::str::from_utf8(header_bytes)
        .map_err(|_| MultipartError::MalformedPartHeaders)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect();
    // the final line break belongs to the boundary, not to the part body
    let body = trim_trailing_line_break(body);
    Ok(MultipartPart {
        headers,
        body: Bytes::copy_from_slice(body),
    })
}

fn split_headers(section: &[u8]) -> Result<(&[u8], &[u8]), MultipartError> {
    // a part may have no headers at all, beginning directly with its body
    if let Some(n) = skip_line_break(section) {
        if n > 0 && looks_like_body(section) {
            return Ok((&[], &section[n..]));
        }
    }
    if let Some(i) = find_subslice(section, b"\r\n\r\n") {
        return Ok((&section[..i], &section[i + 4..]));
    }
    if let Some(i) = find_subslice(section, b"\n\n") {
        return Ok((&section[..i], &section[i + 2..]));
    }
    Err(MultipartError::MalformedPartHeaders)
}

fn looks_like_body(section: &[u8]) -> bool {
    section.starts_with(b"\r\n") || section.starts_with(b"\n")
}

fn skip_line_break(bytes: &[u8]) -> Option<usize> {
    if bytes.starts_with(b"\r\n") {
        Some(2)
    } else if bytes.starts_with(b"\n") {
        Some(1)
    } else if bytes.is_empty() {
        None
    } else {
        Some(0)
    }
}

fn trim_trailing_line_break(body: &[u8]) -> &[u8] {
    if body.ends_with(b"\r\n") {
        &body[..body.len() - 2]
    } else if body.ends_with(b"\n") {
        &body[..body.len() - 1]
    } else {
        body
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Assemble a `multipart/related` body out of `(content type, payload)` parts.
pub fn build_related(parts: &[(String, Bytes)], boundary: &str) -> Bytes {
    let mut out = BytesMut::new();
    for (content_type, body) in parts {
        out.put_slice(format!("--{boundary}\r\n").as_bytes());
        out.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(body);
        out.put_slice(b"\r\n");
    }
    out.put_slice(format!("--{boundary}--\r\n").as_bytes());
    out.freeze()
}

/// A fresh boundary token unlikely to collide with part content.
pub fn make_boundary() -> String {
    format!("Boundary.{}", ulid::Ulid::new())
}

/// The outgoing content type for a `multipart/related` response.
pub fn related_content_type(inner: &str, boundary: &str) -> String {
    format!("multipart/related; type=\"{inner}\"; boundary={boundary}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_two_parts_crlf() {
        let body = b"preamble\r\n--b42\r\nContent-Type: application/dicom\r\n\r\nAAAA\r\n--b42\r\nContent-Type: application/dicom\r\nContent-Length: 4\r\n\r\nBBBB\r\n--b42--\r\n";
        let parts = parse_related(body, "b42").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].content_type(), Some("application/dicom"));
        assert_eq!(&parts[0].body[..], b"AAAA");
        assert_eq!(parts[1].header("content-length"), Some("4"));
        assert_eq!(&parts[1].body[..], b"BBBB");
    }

    #[test]
    fn test_parse_bare_lf() {
        let body = b"--x\nContent-Type: text/plain\n\nhello\n--x--\n";
        let parts = parse_related(body, "x").unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(&parts[0].body[..], b"hello");
    }

    #[test]
    fn test_part_without_headers() {
        let body = b"--x\r\n\r\nraw\r\n--x--\r\n";
        let parts = parse_related(body, "x").unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].headers.is_empty());
        assert_eq!(&parts[0].body[..], b"raw");
    }

    #[test]
    fn test_missing_opening_boundary() {
        let result = parse_related(b"no boundaries here", "x");
        assert!(matches!(result, Err(MultipartError::MissingOpeningBoundary)));
    }

    #[test]
    fn test_missing_closing_boundary() {
        let body = b"--x\r\nContent-Type: a/b\r\n\r\ndata";
        let result = parse_related(body, "x");
        assert!(matches!(result, Err(MultipartError::MissingClosingBoundary)));
    }

    #[test]
    fn test_build_then_parse_roundtrip() {
        let parts = vec![
            (
                "application/dicom".to_string(),
                Bytes::from_static(b"\x00\x01\x02\x03"),
            ),
            ("application/octet-stream".to_string(), Bytes::from_static(b"frame")),
        ];
        let boundary = make_boundary();
        let body = build_related(&parts, &boundary);
        let parsed = parse_related(&body, &boundary).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].content_type(), Some("application/dicom"));
        assert_eq!(&parsed[0].body[..], b"\x00\x01\x02\x03");
        assert_eq!(&parsed[1].body[..], b"frame");
    }

    #[test]
    fn test_boundary_param() {
        assert_eq!(
            boundary_param("multipart/related; type=\"application/dicom\"; boundary=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            boundary_param("multipart/related; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(boundary_param("multipart/related"), None);
        assert_eq!(boundary_param("multipart/related; boundary="), None);
    }
}
