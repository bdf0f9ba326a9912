use std::io;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};

const READ_CHUNK_SIZE: usize = 4096;
/// Request heads larger than this are rejected rather than buffered further.
const MAX_HEAD_SIZE: usize = 8192;

pub const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug)]
pub enum HttpError {
    Io(io::Error),
    NoHostHeader,
    RequestTooLarge,
    Timeout,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Io(e) => write!(f, "IO error: {}", e),
            HttpError::NoHostHeader => write!(f, "No Host header found"),
            HttpError::RequestTooLarge => write!(f, "HTTP request head too large"),
            HttpError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        HttpError::Io(err)
    }
}

impl From<tokio::time::error::Elapsed> for HttpError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        HttpError::Timeout
    }
}

/// Reads the client's request head (through the terminating blank line) into
/// a buffer that is later replayed to the upstream byte for byte.
///
/// Returns the bytes consumed so far; the buffer may extend past the blank
/// line if the client pipelined body bytes into the same segments.
pub async fn read_request_head(
    stream: &mut TcpStream,
    deadline: Instant,
) -> Result<Vec<u8>, HttpError> {
    let mut buffer = Vec::with_capacity(READ_CHUNK_SIZE);
    loop {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = timeout_at(deadline, stream.read(&mut chunk)).await??;
        if n == 0 {
            // EOF before the head completed; hand back what arrived so the
            // caller can decide (an empty buffer means a silent close).
            return Ok(buffer);
        }

        buffer.extend_from_slice(&chunk[..n]);

        if find_headers_end(&buffer).is_some() {
            return Ok(buffer);
        }

        if buffer.len() > MAX_HEAD_SIZE {
            return Err(HttpError::RequestTooLarge);
        }
    }
}

/// Extracts `(host, port)` from an HTTP/1.x request head.
///
/// Scans header lines for `Host:` (case-insensitive), splitting the value on
/// its last colon: left becomes the host, and the right-hand side becomes
/// the port when it parses as a decimal u16, else the port stays 80. No
/// Host header yields `("", 80)`.
pub fn host_from_request_head(head: &[u8]) -> (String, u16) {
    let end = find_headers_end(head).unwrap_or(head.len());
    let Ok(head_str) = std::str::from_utf8(&head[..end]) else {
        return (String::new(), DEFAULT_HTTP_PORT);
    };

    for line in head_str.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        if line.len() > 5 && line[..5].eq_ignore_ascii_case("host:") {
            let value = line[5..].trim();
            return split_host_header(value);
        }
    }

    (String::new(), DEFAULT_HTTP_PORT)
}

fn split_host_header(value: &str) -> (String, u16) {
    match value.rfind(':') {
        Some(colon) => {
            let port = value[colon + 1..]
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .unwrap_or(DEFAULT_HTTP_PORT);
            (value[..colon].to_string(), port)
        }
        None => (value.to_string(), DEFAULT_HTTP_PORT),
    }
}

#[inline]
pub fn find_headers_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_headers_end_simple() {
        let buffer = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(find_headers_end(buffer), Some(buffer.len()));
    }

    #[test]
    fn test_find_headers_end_with_body() {
        let buffer = b"POST / HTTP/1.1\r\nHost: example.com\r\n\r\nBody data here";
        let headers_end = find_headers_end(buffer).unwrap();
        assert_eq!(
            &buffer[..headers_end],
            b"POST / HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn test_find_headers_end_incomplete() {
        let buffer = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
        assert_eq!(find_headers_end(buffer), None);
    }

    #[test]
    fn test_host_simple() {
        let head = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(host_from_request_head(head), ("example.com".to_string(), 80));
    }

    #[test]
    fn test_host_with_port() {
        let head = b"GET / HTTP/1.1\r\nHost: service.local:8081\r\n\r\n";
        assert_eq!(
            host_from_request_head(head),
            ("service.local".to_string(), 8081)
        );
    }

    #[test]
    fn test_host_case_insensitive() {
        let head = b"GET / HTTP/1.1\r\nHOST: example.com\r\n\r\n";
        assert_eq!(host_from_request_head(head), ("example.com".to_string(), 80));

        let head2 = b"GET / HTTP/1.1\r\nhOsT: example.com\r\n\r\n";
        assert_eq!(
            host_from_request_head(head2),
            ("example.com".to_string(), 80)
        );
    }

    #[test]
    fn test_host_whitespace_trimmed() {
        let head = b"GET / HTTP/1.1\r\nHost:   example.com   \r\n\r\n";
        assert_eq!(host_from_request_head(head), ("example.com".to_string(), 80));
    }

    #[test]
    fn test_host_invalid_port_falls_back() {
        let head = b"GET / HTTP/1.1\r\nHost: example.com:notaport\r\n\r\n";
        assert_eq!(
            host_from_request_head(head),
            ("example.com".to_string(), 80)
        );
    }

    #[test]
    fn test_host_out_of_range_port_falls_back() {
        let head = b"GET / HTTP/1.1\r\nHost: example.com:99999\r\n\r\n";
        assert_eq!(
            host_from_request_head(head),
            ("example.com".to_string(), 80)
        );
    }

    #[test]
    fn test_host_missing() {
        let head = b"GET / HTTP/1.1\r\nUser-Agent: curl\r\n\r\n";
        assert_eq!(host_from_request_head(head), (String::new(), 80));
    }

    #[test]
    fn test_host_among_other_headers() {
        let head =
            b"GET / HTTP/1.1\r\nUser-Agent: Test\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        assert_eq!(host_from_request_head(head), ("example.com".to_string(), 80));
    }

    #[test]
    fn test_request_line_host_lookalike_skipped() {
        // The request line itself is never treated as a header.
        let head = b"HOST:X / HTTP/1.1\r\nHost: real.example\r\n\r\n";
        assert_eq!(
            host_from_request_head(head),
            ("real.example".to_string(), 80)
        );
    }

    #[test]
    fn test_host_invalid_utf8_head() {
        let head = b"GET / HTTP/1.1\r\nHost: \xFF\xFE\r\n\r\n";
        assert_eq!(host_from_request_head(head), (String::new(), 80));
    }

    #[test]
    fn test_headers_after_blank_line_ignored() {
        let head = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\nHost: smuggled.example\r\n\r\n";
        assert_eq!(host_from_request_head(head), (String::new(), 80));
    }
}
