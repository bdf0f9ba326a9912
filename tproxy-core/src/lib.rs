pub mod connection;
pub mod dial;
mod http;
mod metrics_cache;
pub mod relay;
pub mod rules;

use connection::{ConnectionHandler, ListenerClass};
use prometheus::Registry;
use rules::RuleSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tproxy_config::Config;
use tracing::{error, info};

/// Binds the two listeners and runs their accept loops until ctrl-c.
///
/// The HTTPS-class listener expects redirected TLS flows and extracts the
/// host name from the ClientHello SNI; the HTTP-class listener expects plain
/// HTTP/1.x and reads the `Host:` header. A bind failure is fatal and
/// propagates; accept errors are logged and the loops continue.
pub async fn run_proxy(
    config: Config,
    registry: Option<Registry>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);
    let rules = Arc::new(RuleSet::compile(&config.rules));
    for line in rules.describe() {
        info!("{}", line);
    }

    let handler = ConnectionHandler::new(config.clone(), rules, registry.as_ref());

    let tls_listener =
        TcpListener::bind((config.listen.host.as_str(), config.listen.https_port)).await?;
    info!("TLS listener on {}", tls_listener.local_addr()?);

    let http_listener =
        TcpListener::bind((config.listen.host.as_str(), config.listen.http_port)).await?;
    info!("HTTP listener on {}", http_listener.local_addr()?);

    info!("Proxy started, waiting for connections...");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            result = tls_listener.accept() => {
                spawn_handler(&handler, result, ListenerClass::Tls);
            }
            result = http_listener.accept() => {
                spawn_handler(&handler, result, ListenerClass::Http);
            }
        }
    }

    info!("Shutting down proxy");
    Ok(())
}

fn spawn_handler(
    handler: &ConnectionHandler,
    result: std::io::Result<(TcpStream, SocketAddr)>,
    class: ListenerClass,
) {
    match result {
        Ok((socket, addr)) => {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.handle_connection(socket, addr, class).await;
            });
        }
        Err(e) => {
            error!("Accept error on {} listener: {}", class.as_str(), e);
        }
    }
}

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;

/// Upper bound on any advertised variable length inside the hello; anything
/// larger is treated as garbage rather than a handshake we failed to read.
const MAX_SANE_LENGTH: usize = 65536;

#[derive(Debug)]
pub enum SniError {
    NotTls,
    NotClientHello,
    Truncated,
    Malformed,
    NoServerName,
}

impl std::fmt::Display for SniError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SniError::NotTls => write!(f, "No TLS handshake record found"),
            SniError::NotClientHello => write!(f, "Handshake is not a ClientHello"),
            SniError::Truncated => write!(f, "ClientHello truncated"),
            SniError::Malformed => write!(f, "Malformed ClientHello"),
            SniError::NoServerName => write!(f, "No server_name extension"),
        }
    }
}

impl std::error::Error for SniError {}

#[inline]
fn be16(buf: &[u8], pos: usize) -> usize {
    ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize)
}

/// Locates the first plausible TLS Handshake record header in the buffer.
///
/// Tolerates unrelated leading bytes (legacy capture framing): scans for
/// `0x16 0x03 0x01..=0x03` rather than requiring the record at offset zero.
fn find_handshake_record(buffer: &[u8]) -> Option<usize> {
    buffer.windows(3).position(|w| {
        w[0] == TLS_HANDSHAKE && w[1] == TLS_VERSION_MAJOR && (0x01..=0x03).contains(&w[2])
    })
}

/// Extracts the server_name host from a buffer containing a TLS ClientHello.
///
/// The buffer may be a truncated peek: advertised record/handshake lengths
/// longer than the bytes available are clamped, so extraction still succeeds
/// whenever the server_name entry itself lies within the received bytes.
/// Never panics and never reads out of bounds, whatever the input.
pub fn extract_sni(buffer: &[u8]) -> Result<String, SniError> {
    let start = find_handshake_record(buffer).ok_or(SniError::NotTls)?;
    let record = &buffer[start..];

    if record.len() < 9 {
        return Err(SniError::Truncated);
    }
    let record_len = be16(record, 3);

    if record[5] != CLIENT_HELLO {
        return Err(SniError::NotClientHello);
    }
    let handshake_len =
        ((record[6] as usize) << 16) | ((record[7] as usize) << 8) | (record[8] as usize);
    if handshake_len > MAX_SANE_LENGTH {
        return Err(SniError::Malformed);
    }

    // Parse no further than the record and handshake claim to extend, and no
    // further than the bytes actually received.
    let end = record.len().min(5 + record_len).min(9 + handshake_len);

    // client_version + random
    let mut pos = 9 + 2 + 32;

    // session_id
    if pos + 1 > end {
        return Err(SniError::Truncated);
    }
    let session_id_len = record[pos] as usize;
    pos += 1 + session_id_len;

    // cipher_suites
    if pos + 2 > end {
        return Err(SniError::Truncated);
    }
    let cipher_suites_len = be16(record, pos);
    pos += 2 + cipher_suites_len;

    // compression_methods
    if pos + 1 > end {
        return Err(SniError::Truncated);
    }
    let compression_len = record[pos] as usize;
    pos += 1 + compression_len;

    // extensions
    if pos + 2 > end {
        return Err(SniError::Truncated);
    }
    let extensions_len = be16(record, pos);
    pos += 2;
    let extensions_end = end.min(pos + extensions_len);

    while pos + 4 <= extensions_end {
        let extension_type = ((record[pos] as u16) << 8) | (record[pos + 1] as u16);
        let extension_len = be16(record, pos + 2);
        pos += 4;

        if extension_type != SNI_EXTENSION {
            pos += extension_len;
            continue;
        }

        // ServerNameList
        if pos + 2 > extensions_end {
            return Err(SniError::Truncated);
        }
        let list_len = be16(record, pos);
        pos += 2;
        let list_end = extensions_end.min(pos + list_len);

        while pos + 3 <= list_end {
            let name_type = record[pos];
            let name_len = be16(record, pos + 1);
            pos += 3;

            if pos + name_len > list_end {
                return Err(SniError::Truncated);
            }

            if name_type == 0x00 {
                // host_name
                return match std::str::from_utf8(&record[pos..pos + name_len]) {
                    Ok(s) => Ok(s.to_string()),
                    Err(_) => Err(SniError::Malformed),
                };
            }

            pos += name_len;
        }

        return Err(SniError::NoServerName);
    }

    Err(SniError::NoServerName)
}
