use crate::dial::{self, DialError};
use crate::http;
use crate::metrics_cache::MetricLabelCache;
use crate::relay::bridge;
use crate::rules::{Action, RuleSet};
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant, timeout_at};
use tproxy_config::Config;
use tracing::{debug, info, warn};

/// Cap on the bytes buffered while waiting for a complete ClientHello
/// record (16 KiB record body + 5 byte header).
const TLS_PEEK_CAP: usize = 16384 + 5;
const PEEK_CHUNK_SIZE: usize = 4096;

const TLS_NOMINAL_PORT: u16 = 443;
const HTTP_NOMINAL_PORT: u16 = 80;

/// Which listener a connection arrived on; decides how the peek buffer is
/// classified and which nominal port backs the original-destination
/// fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerClass {
    Tls,
    Http,
}

impl ListenerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerClass::Tls => "tls",
            ListenerClass::Http => "http",
        }
    }

    fn nominal_port(&self) -> u16 {
        match self {
            ListenerClass::Tls => TLS_NOMINAL_PORT,
            ListenerClass::Http => HTTP_NOMINAL_PORT,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionHandler {
    config: Arc<Config>,
    rules: Arc<RuleSet>,
    metrics: Option<Arc<ConnectionMetrics>>,
}

struct ConnectionMetrics {
    bytes_transferred: IntCounterVec,
    connections_total: IntCounterVec,
    connections_active: IntGauge,
    errors_total: IntCounterVec,
    label_cache: MetricLabelCache,
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Self {
        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "tproxy_bytes_transferred_total",
                "Total bytes transferred per host and direction",
            ),
            &["host", "direction"],
        )
        .unwrap();
        registry
            .register(Box::new(bytes_transferred.clone()))
            .unwrap();

        let connections_total = IntCounterVec::new(
            Opts::new(
                "tproxy_connections_total",
                "Total number of connections handled per listener class and outcome",
            ),
            &["class", "outcome"],
        )
        .unwrap();
        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();

        let connections_active = IntGauge::new(
            "tproxy_connections_active",
            "Number of currently active connections",
        )
        .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();

        let errors_total = IntCounterVec::new(
            Opts::new("tproxy_errors_total", "Total number of errors by kind"),
            &["kind"],
        )
        .unwrap();
        registry.register(Box::new(errors_total.clone())).unwrap();

        Self {
            bytes_transferred,
            connections_total,
            connections_active,
            errors_total,
            label_cache: MetricLabelCache::new(),
        }
    }

    fn record_outcome(&self, class: ListenerClass, outcome: &str) {
        self.connections_total
            .with_label_values(&[class.as_str(), outcome])
            .inc();
    }

    fn record_error(&self, kind: &str) {
        self.errors_total.with_label_values(&[kind]).inc();
    }
}

/// How a finished connection is accounted for and logged.
enum Disposition {
    Relayed { up: u64, down: u64 },
    Dropped,
    ClosedEarly(&'static str),
}

impl ConnectionHandler {
    pub fn new(config: Arc<Config>, rules: Arc<RuleSet>, registry: Option<&Registry>) -> Self {
        let metrics = registry.map(|r| Arc::new(ConnectionMetrics::new(r)));
        Self {
            config,
            rules,
            metrics,
        }
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.config.listen.timeout)
    }

    pub async fn handle_connection(
        &self,
        client: TcpStream,
        client_addr: SocketAddr,
        class: ListenerClass,
    ) {
        let peer = client_addr.to_string();

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.inc();
        }

        debug!(peer, class = class.as_str(), "New connection");

        let result = self.process_connection(client, client_addr, class).await;

        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
        }

        match result {
            Ok(Disposition::Relayed { up, down }) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_outcome(class, "relayed");
                }
                debug!(peer, up, down, "Connection completed");
            }
            Ok(Disposition::Dropped) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_outcome(class, "dropped");
                }
            }
            Ok(Disposition::ClosedEarly(reason)) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_outcome(class, "closed");
                }
                debug!(peer, reason, "Connection closed before dispatch");
            }
            Err(e) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_outcome(class, "error");
                    metrics.record_error(error_kind(&e));
                }
                warn!(peer, error = %e, "Connection error");
            }
        }
    }

    async fn process_connection(
        &self,
        mut client: TcpStream,
        client_addr: SocketAddr,
        class: ListenerClass,
    ) -> Result<Disposition, Box<dyn std::error::Error + Send + Sync>> {
        // One absolute deadline for the whole connection, installed now and
        // never refreshed; a tunnel still alive when it passes is torn down.
        let deadline = Instant::now() + self.io_timeout();

        // Recover where the client was actually headed before the packet
        // filter redirected it here.
        let original_dst = original_destination(&client)
            .unwrap_or_else(|| SocketAddr::new(client_addr.ip(), class.nominal_port()));

        let peek_result = match class {
            ListenerClass::Tls => self.read_client_hello(&mut client, deadline).await,
            ListenerClass::Http => http::read_request_head(&mut client, deadline)
                .await
                .map_err(Into::into),
        };
        let peek_buf = match peek_result {
            Ok(buf) => buf,
            // A client that never sends its hello is noise, not an error.
            Err(e) if is_timeout(&e) => {
                return Ok(Disposition::ClosedEarly("peek timeout"));
            }
            Err(e) => return Err(e),
        };
        if peek_buf.is_empty() {
            return Ok(Disposition::ClosedEarly("empty peek"));
        }

        // The logical destination: SNI or Host header, with the original
        // destination IP standing in for SNI-less TLS flows so operators can
        // write IP-prefix rules for them.
        let (host_name, target_port) = match class {
            ListenerClass::Tls => {
                let host = match crate::extract_sni(&peek_buf) {
                    Ok(sni) => sni,
                    Err(e) => {
                        debug!(
                            peer = %client_addr,
                            error = %e,
                            fallback = %original_dst.ip(),
                            "No SNI, using original destination IP"
                        );
                        original_dst.ip().to_string()
                    }
                };
                (host, original_dst.port())
            }
            ListenerClass::Http => {
                let (host, port) = http::host_from_request_head(&peek_buf);
                if host.is_empty() {
                    warn!(peer = %client_addr, "No Host header in HTTP request");
                    return Ok(Disposition::ClosedEarly("no host header"));
                }
                (host, port)
            }
        };

        let action = self.rules.resolve(&host_name);
        match &action {
            Action::Direct => info!(
                "{} => {}:{}: Direct to {}",
                client_addr,
                original_dst.ip(),
                target_port,
                host_name
            ),
            Action::Drop => info!(
                "{} => {}:{}: Drop {}",
                client_addr,
                original_dst.ip(),
                target_port,
                host_name
            ),
            Action::Proxy { host, port } => info!(
                "{} => {}:{}: Proxying {}:{} via {}:{}",
                client_addr,
                original_dst.ip(),
                target_port,
                host_name,
                target_port,
                host,
                port
            ),
        }

        let mut upstream = match action {
            Action::Drop => return Ok(Disposition::Dropped),
            Action::Direct => {
                dial::dial_direct(&host_name, target_port, self.io_timeout()).await?
            }
            Action::Proxy { host, port } => {
                dial::dial_via_proxy(
                    &host,
                    port,
                    &host_name,
                    target_port,
                    client_addr.ip(),
                    self.io_timeout(),
                )
                .await?
            }
        };

        // Replay the peeked bytes before relaying; the upstream must see the
        // stream exactly as the client sent it.
        timeout_at(deadline, upstream.write_all(&peek_buf)).await??;

        let metrics = self.metrics.as_ref().map(|m| {
            let label = m.label_cache.get_or_insert(&host_name);
            const TX: &str = "tx";
            const RX: &str = "rx";
            (
                m.bytes_transferred.with_label_values(&[label.as_ref(), TX]),
                m.bytes_transferred.with_label_values(&[label.as_ref(), RX]),
            )
        });

        let (up, down) = bridge(client, upstream, deadline, metrics).await?;
        Ok(Disposition::Relayed { up, down })
    }

    /// Reads the client's opening bytes on the TLS listener.
    ///
    /// If they begin like a TLS Handshake record, keeps reading until the
    /// record is complete (or the cap is hit) so SNI extraction sees the
    /// whole hello; otherwise returns the first chunk as-is and lets the
    /// caller fall back to IP-based resolution.
    async fn read_client_hello(
        &self,
        client: &mut TcpStream,
        deadline: Instant,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let mut peek_buf = Vec::with_capacity(PEEK_CHUNK_SIZE);
        let mut chunk = [0u8; PEEK_CHUNK_SIZE];

        let n = timeout_at(deadline, client.read(&mut chunk)).await??;
        if n == 0 {
            return Ok(peek_buf);
        }
        peek_buf.extend_from_slice(&chunk[..n]);

        while let Some(missing) = tls_record_remaining(&peek_buf) {
            if missing == 0 || peek_buf.len() >= TLS_PEEK_CAP {
                break;
            }
            let n = timeout_at(deadline, client.read(&mut chunk)).await??;
            if n == 0 {
                break;
            }
            peek_buf.extend_from_slice(&chunk[..n]);
        }

        Ok(peek_buf)
    }
}

/// For a buffer starting with a TLS record header, how many bytes of the
/// record are still outstanding. `None` when the buffer is not a TLS record
/// (nothing more to wait for).
fn tls_record_remaining(buf: &[u8]) -> Option<usize> {
    if buf.is_empty() || buf[0] != 0x16 {
        return None;
    }
    if buf.len() < 5 {
        return Some(5 - buf.len());
    }
    if buf[1] != 0x03 {
        return None;
    }
    let record_len = ((buf[3] as usize) << 8) | (buf[4] as usize);
    let want = 5 + record_len;
    Some(want.saturating_sub(buf.len()))
}

fn is_timeout(e: &Box<dyn std::error::Error + Send + Sync>) -> bool {
    if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return true;
    }
    matches!(e.downcast_ref::<http::HttpError>(), Some(http::HttpError::Timeout))
}

fn error_kind(e: &Box<dyn std::error::Error + Send + Sync>) -> &'static str {
    if let Some(dial_err) = e.downcast_ref::<DialError>() {
        return match dial_err {
            DialError::UpstreamRefused(_) => "upstream_refused",
            DialError::Timeout => "dial_timeout",
            DialError::Resolve(_) => "resolve",
            DialError::Io(_) => "dial",
        };
    }
    if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
        if io_err.kind() == std::io::ErrorKind::TimedOut {
            return "deadline";
        }
        return "io";
    }
    if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return "deadline";
    }
    "other"
}

/// Recovers the pre-redirect destination of an accepted IPv4 socket.
///
/// Only meaningful behind an iptables REDIRECT/DNAT rule; without one the
/// option fails and callers use the peer-address fallback.
///
/// ```bash
/// iptables -t nat -A PREROUTING -p tcp --dport 443 -j REDIRECT --to-ports 3130
/// ```
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> Option<SocketAddr> {
    use std::os::fd::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut addr_len: libc::socklen_t = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut addr_len as *mut libc::socklen_t,
        )
    };

    if result != 0 {
        debug!("Failed to get SO_ORIGINAL_DST");
        return None;
    }

    if addr.sin_family as libc::c_int != libc::AF_INET {
        return None;
    }

    let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

#[cfg(not(target_os = "linux"))]
pub fn original_destination(_stream: &TcpStream) -> Option<SocketAddr> {
    None
}
