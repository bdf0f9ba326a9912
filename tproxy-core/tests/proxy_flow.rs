use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tproxy_config::{Config, ListenConfig, Metrics, Rule};
use tproxy_core::run_proxy;

fn rule(pattern: &str, proxy: &str) -> Rule {
    Rule {
        pattern: pattern.to_string(),
        proxy: proxy.to_string(),
    }
}

fn config(https_port: u16, http_port: u16, rules: Vec<Rule>) -> Config {
    Config {
        listen: ListenConfig {
            host: "127.0.0.1".to_string(),
            https_port,
            http_port,
            timeout: 5,
        },
        rules,
        metrics: Metrics::default(),
    }
}

/// Grabs two distinct ephemeral ports. The listeners are dropped before the
/// proxy binds, so a tiny reuse race exists; fine for tests.
async fn two_free_ports() -> (u16, u16) {
    let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ports = (a.local_addr().unwrap().port(), b.local_addr().unwrap().port());
    drop(a);
    drop(b);
    ports
}

async fn start_proxy(cfg: Config) {
    let https_port = cfg.listen.https_port;
    tokio::spawn(async move {
        let _ = run_proxy(cfg, None).await;
    });

    // Wait until the listener accepts connections.
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", https_port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("proxy did not come up on port {}", https_port);
}

/// Builds a well-formed TLS 1.2 ClientHello record carrying the given SNI.
fn build_client_hello(domain: &str) -> Vec<u8> {
    let domain_bytes = domain.as_bytes();
    let domain_len = domain_bytes.len() as u16;

    let sni_list_len = 3 + domain_len;
    let sni_ext_len = 2 + sni_list_len;
    let extensions_len = 4 + sni_ext_len;
    let handshake_len = 2 + 32 + 1 + 2 + 2 + 2 + 2 + extensions_len;
    let record_len = 4 + handshake_len;

    let mut record = vec![
        0x16,
        0x03,
        0x03,
        (record_len >> 8) as u8,
        (record_len & 0xff) as u8,
        0x01,
        ((handshake_len as u32) >> 16) as u8,
        (handshake_len >> 8) as u8,
        (handshake_len & 0xff) as u8,
        0x03,
        0x03,
    ];
    record.extend_from_slice(&[0; 32]);
    record.extend_from_slice(&[
        0x00,
        0x00,
        0x02,
        0x00,
        0x00,
        0x01,
        0x00,
        (extensions_len >> 8) as u8,
        (extensions_len & 0xff) as u8,
        0x00,
        0x00,
        (sni_ext_len >> 8) as u8,
        (sni_ext_len & 0xff) as u8,
        (sni_list_len >> 8) as u8,
        (sni_list_len & 0xff) as u8,
        0x00,
        (domain_len >> 8) as u8,
        (domain_len & 0xff) as u8,
    ]);
    record.extend_from_slice(domain_bytes);
    record
}

async fn read_until_double_crlf(socket: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peer closed before finishing headers");
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

#[tokio::test]
async fn test_tls_flow_via_connect_proxy() {
    // Mock CONNECT upstream that validates the handshake, accepts the
    // tunnel, and then checks the replayed ClientHello plus live relaying.
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream_listener.local_addr().unwrap().port();

    let hello = build_client_hello("www.foo.com");
    let expected_hello = hello.clone();

    let upstream = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();

        let request = read_until_double_crlf(&mut socket).await;
        let request = String::from_utf8(request).unwrap();
        assert!(
            request.starts_with("CONNECT www.foo.com:"),
            "unexpected CONNECT line: {}",
            request
        );
        assert!(request.contains("\r\nHost: www.foo.com:"));
        assert!(request.contains("\r\nX-Forwarded-For: 127.0.0.1\r\n"));
        assert!(request.contains("\r\nForwarded: for=127.0.0.1\r\n"));

        socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();

        // The peeked ClientHello must arrive first, byte for byte.
        let mut replayed = vec![0u8; expected_hello.len()];
        socket.read_exact(&mut replayed).await.unwrap();
        assert_eq!(replayed, expected_hello);

        // Then fresh client bytes, in order.
        let mut more = [0u8; 4];
        socket.read_exact(&mut more).await.unwrap();
        assert_eq!(&more, b"MORE");

        socket.write_all(b"SERVER").await.unwrap();

        // Half-close: once the client shuts its write side we must see EOF.
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    });

    let (https_port, http_port) = two_free_ports().await;
    start_proxy(config(
        https_port,
        http_port,
        vec![rule(".*", &format!("127.0.0.1:{}", upstream_port))],
    ))
    .await;

    let mut client = TcpStream::connect(("127.0.0.1", https_port)).await.unwrap();
    client.write_all(&hello).await.unwrap();
    client.write_all(b"MORE").await.unwrap();

    let mut response = [0u8; 6];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"SERVER");

    client.shutdown().await.unwrap();
    upstream.await.unwrap();
}

#[tokio::test]
async fn test_tls_flow_upstream_refuses_connect() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream_listener.local_addr().unwrap().port();

    let upstream = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let _ = read_until_double_crlf(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
            .await
            .unwrap();
        // No tunnel bytes may follow the refusal; the proxy may tear the
        // socket down hard, so a reset counts as closed too.
        let mut rest = Vec::new();
        if socket.read_to_end(&mut rest).await.is_ok() {
            assert!(rest.is_empty());
        }
    });

    let (https_port, http_port) = two_free_ports().await;
    start_proxy(config(
        https_port,
        http_port,
        vec![rule(".*", &format!("127.0.0.1:{}", upstream_port))],
    ))
    .await;

    let mut client = TcpStream::connect(("127.0.0.1", https_port)).await.unwrap();
    client
        .write_all(&build_client_hello("www.foo.com"))
        .await
        .unwrap();

    // The proxy closes the client flow without forwarding anything back.
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());

    upstream.await.unwrap();
}

#[tokio::test]
async fn test_http_drop_rule_closes_client() {
    let (https_port, http_port) = two_free_ports().await;
    start_proxy(config(
        https_port,
        http_port,
        vec![rule(r"^block\.me$", "DROP"), rule(".*", "DIRECT")],
    ))
    .await;

    let mut client = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: block.me\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_http_direct_uses_host_header_port() {
    // Backend standing in for service.local:<port>; the Host header carries
    // the backend's real port and the rule says DIRECT, so the proxy dials
    // it straight and replays the request head.
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend_listener.local_addr().unwrap().port();

    let backend = tokio::spawn(async move {
        let (mut socket, _) = backend_listener.accept().await.unwrap();
        let head = read_until_double_crlf(&mut socket).await;
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("GET /probe HTTP/1.1\r\n"));
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let (https_port, http_port) = two_free_ports().await;
    start_proxy(config(https_port, http_port, vec![rule(".*", "DIRECT")])).await;

    let mut client = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    client
        .write_all(
            format!(
                "GET /probe HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
                backend_port
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // The backend closes after responding; that ends the upstream-to-client
    // relay and, through the shared token, the whole connection.
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("ok"));

    backend.await.unwrap();
}

#[tokio::test]
async fn test_http_request_without_host_is_closed() {
    let (https_port, http_port) = two_free_ports().await;
    start_proxy(config(https_port, http_port, vec![rule(".*", "DIRECT")])).await;

    let mut client = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_tls_sni_less_flow_falls_back_to_ip() {
    // The client opens the TLS-class port with bytes that are not a
    // ClientHello. The handler then matches rules against the original
    // destination IP (here the loopback fallback), which the IP-prefix rule
    // sends through the CONNECT upstream; the garbage bytes are replayed.
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream_listener.local_addr().unwrap().port();

    let upstream = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let request = read_until_double_crlf(&mut socket).await;
        let request = String::from_utf8(request).unwrap();
        assert!(
            request.starts_with("CONNECT 127.0.0.1:"),
            "fallback host should be the original destination IP: {}",
            request
        );
        socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();

        let mut replayed = [0u8; 6];
        socket.read_exact(&mut replayed).await.unwrap();
        assert_eq!(&replayed, b"NOTTLS");
    });

    let (https_port, http_port) = two_free_ports().await;
    start_proxy(config(
        https_port,
        http_port,
        vec![
            rule(r"^127\.0\.0\.1$", &format!("127.0.0.1:{}", upstream_port)),
            rule(".*", "DROP"),
        ],
    ))
    .await;

    let mut client = TcpStream::connect(("127.0.0.1", https_port)).await.unwrap();
    client.write_all(b"NOTTLS").await.unwrap();

    upstream.await.unwrap();
    drop(client);
}

#[tokio::test]
async fn test_tls_drop_by_sni() {
    let (https_port, http_port) = two_free_ports().await;
    start_proxy(config(
        https_port,
        http_port,
        vec![rule(r"^spy\.example$", "DROP"), rule(".*", "DROP")],
    ))
    .await;

    let mut client = TcpStream::connect(("127.0.0.1", https_port)).await.unwrap();
    client
        .write_all(&build_client_hello("spy.example"))
        .await
        .unwrap();

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}
