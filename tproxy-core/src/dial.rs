use std::io;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::{Duration, timeout};
use tracing::debug;

/// Status-line prefix that establishes a CONNECT tunnel. A trailing space is
/// usual but not required.
const CONNECT_ESTABLISHED: &str = "HTTP/1.1 200";

const MAX_HEADER_LINE: usize = 8192;

#[derive(Debug)]
pub enum DialError {
    Io(io::Error),
    Timeout,
    Resolve(String),
    UpstreamRefused(String),
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialError::Io(e) => write!(f, "IO error: {}", e),
            DialError::Timeout => write!(f, "Connect timed out"),
            DialError::Resolve(target) => write!(f, "Failed to resolve {}", target),
            DialError::UpstreamRefused(status) => {
                write!(f, "Upstream refused CONNECT: {}", status)
            }
        }
    }
}

impl std::error::Error for DialError {}

impl From<io::Error> for DialError {
    fn from(err: io::Error) -> Self {
        DialError::Io(err)
    }
}

impl From<tokio::time::error::Elapsed> for DialError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DialError::Timeout
    }
}

/// Opens a TCP connection to `host:port`, resolving and connecting under
/// `io_timeout`.
pub async fn dial_direct(
    host: &str,
    port: u16,
    io_timeout: Duration,
) -> Result<TcpStream, DialError> {
    let target = format!("{}:{}", host, port);
    debug!("Resolving target address: {}", target);
    let addr = timeout(io_timeout, lookup_host(target.as_str()))
        .await??
        .next()
        .ok_or_else(|| DialError::Resolve(target.clone()))?;

    debug!("Connecting to target: {}", addr);
    let stream = timeout(io_timeout, TcpStream::connect(addr)).await??;
    Ok(stream)
}

/// Establishes a tunnel to `target_host:target_port` through an upstream
/// HTTP CONNECT proxy.
///
/// The CONNECT preamble advertises the logical host name (the SNI or Host
/// value), never the original destination IP, so the upstream does its own
/// DNS. The client address travels in `X-Forwarded-For` and `Forwarded`.
/// The tunnel is established iff the status line starts with `HTTP/1.1 200`;
/// remaining response headers are drained so the returned stream sits
/// exactly at the start of the tunneled byte stream.
pub async fn dial_via_proxy(
    proxy_host: &str,
    proxy_port: u16,
    target_host: &str,
    target_port: u16,
    client_ip: IpAddr,
    io_timeout: Duration,
) -> Result<TcpStream, DialError> {
    let mut stream = dial_direct(proxy_host, proxy_port, io_timeout).await?;

    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         X-Forwarded-For: {ip}\r\n\
         Forwarded: for={ip}\r\n\
         \r\n",
        host = target_host,
        port = target_port,
        ip = client_ip,
    );
    timeout(io_timeout, stream.write_all(request.as_bytes())).await??;

    let status_line = timeout(io_timeout, read_header_line(&mut stream)).await??;
    if !status_line.starts_with(CONNECT_ESTABLISHED) {
        debug!(
            proxy = %format_args!("{}:{}", proxy_host, proxy_port),
            status = %status_line.trim_end(),
            "CONNECT rejected"
        );
        return Err(DialError::UpstreamRefused(
            status_line.trim_end().to_string(),
        ));
    }

    // Drain response headers up to the blank line; the tunnel begins right
    // after it.
    loop {
        let line = timeout(io_timeout, read_header_line(&mut stream)).await??;
        if line.is_empty() {
            return Err(DialError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed during CONNECT response",
            )));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    Ok(stream)
}

/// Reads a single CRLF-terminated line byte by byte.
///
/// Deliberately unbuffered: a BufReader would read past the blank line and
/// swallow the first tunneled bytes.
async fn read_header_line(stream: &mut TcpStream) -> io::Result<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if line.len() > MAX_HEADER_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "header line too long",
            ));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
