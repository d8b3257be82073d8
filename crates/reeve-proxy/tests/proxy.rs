//! End-to-end tests for the TCP dataplane.
//!
//! Each test runs the real proxy against an in-process mock DNS backend
//! and talks to it over a real socket, exercising framing, pipelining,
//! pooling, PROXY protocol, and the per-connection limits.

use reeve_config::{BackendConfig, Config};
use reeve_proxy::proxy_protocol::{parse_header, ProxyParse, ProxyTlv};
use reeve_proxy::ProxyServer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const CLASS_IN: u16 = 1;
const TYPE_A: u16 = 1;
const TYPE_AXFR: u16 = 252;

// ============================================================================
// Wire helpers
// ============================================================================

fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    msg.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    msg.extend_from_slice(&[0; 6]); // an/ns/ar counts
    for label in name.split('.').filter(|l| !l.is_empty()) {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&qtype.to_be_bytes());
    msg.extend_from_slice(&CLASS_IN.to_be_bytes());
    msg
}

fn frame(msg: &[u8]) -> Vec<u8> {
    let mut out = (msg.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(msg);
    out
}

fn message_id(msg: &[u8]) -> u16 {
    u16::from_be_bytes([msg[0], msg[1]])
}

fn an_count(msg: &[u8]) -> u16 {
    u16::from_be_bytes([msg[6], msg[7]])
}

async fn read_message(stream: &mut (impl AsyncReadExt + Unpin)) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut msg = vec![0u8; len];
    stream.read_exact(&mut msg).await?;
    Ok(msg)
}

async fn expect_eof(stream: &mut (impl AsyncReadExt + Unpin)) {
    let mut byte = [0u8; 1];
    let read = timeout(Duration::from_secs(5), stream.read(&mut byte)).await;
    match read {
        Ok(Ok(0)) => {}
        Ok(Ok(n)) => panic!("expected close, read {n} bytes"),
        Ok(Err(_)) => {}
        Err(_) => panic!("expected close, connection still open"),
    }
}

// ============================================================================
// Mock backend
// ============================================================================

#[derive(Clone)]
enum MockMode {
    /// Echo each query with QR set.
    Echo,

    /// Echo, delayed.
    EchoDelay(Duration),

    /// Read two queries, answer the second first.
    ReversePairs,

    /// Answer one query with N messages (an_count = chunk index), then
    /// close.
    Axfr(u16),

    /// Consume a PROXY v2 header first, then echo.
    ProxyEcho,
}

#[derive(Clone)]
struct MockBackend {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    tlvs_seen: Arc<Mutex<Vec<Vec<ProxyTlv>>>>,
}

async fn spawn_mock(mode: MockMode) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = MockBackend {
        addr: listener.local_addr().unwrap(),
        connections: Arc::new(AtomicUsize::new(0)),
        tlvs_seen: Arc::new(Mutex::new(Vec::new())),
    };

    let state = backend.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            state.connections.fetch_add(1, Ordering::SeqCst);
            let mode = mode.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let _ = serve_mock(stream, mode, state).await;
            });
        }
    });

    backend
}

async fn serve_mock(
    mut stream: TcpStream,
    mode: MockMode,
    state: MockBackend,
) -> std::io::Result<()> {
    if let MockMode::ProxyEcho = mode {
        // Accumulate until the PROXY header parses, then keep the rest.
        let mut buf = Vec::new();
        let consumed = loop {
            match parse_header(&buf) {
                ProxyParse::Complete { header, consumed } => {
                    state.tlvs_seen.lock().unwrap().push(header.tlvs);
                    break consumed;
                }
                ProxyParse::Incomplete { .. } => {
                    let mut chunk = [0u8; 256];
                    let n = stream.read(&mut chunk).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                ProxyParse::Invalid => panic!("mock received invalid PROXY header"),
            }
        };
        let mut leftover = buf.split_off(consumed);

        loop {
            // Frames may straddle the leftover bytes and the socket.
            while leftover.len() < 2
                || leftover.len() < 2 + u16::from_be_bytes([leftover[0], leftover[1]]) as usize
            {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                leftover.extend_from_slice(&chunk[..n]);
            }
            let len = u16::from_be_bytes([leftover[0], leftover[1]]) as usize;
            let mut msg: Vec<u8> = leftover.drain(..2 + len).skip(2).collect();
            msg[2] |= 0x80; // QR
            stream.write_all(&frame(&msg)).await?;
        }
    }

    loop {
        let mut msg = match read_message(&mut stream).await {
            Ok(msg) => msg,
            Err(_) => return Ok(()),
        };

        match &mode {
            MockMode::Echo => {
                msg[2] |= 0x80;
                stream.write_all(&frame(&msg)).await?;
            }
            MockMode::EchoDelay(delay) => {
                tokio::time::sleep(*delay).await;
                msg[2] |= 0x80;
                stream.write_all(&frame(&msg)).await?;
            }
            MockMode::ReversePairs => {
                let mut second = read_message(&mut stream).await?;
                second[2] |= 0x80;
                msg[2] |= 0x80;
                stream.write_all(&frame(&second)).await?;
                stream.write_all(&frame(&msg)).await?;
            }
            MockMode::Axfr(chunks) => {
                msg[2] |= 0x80;
                for i in 1..=*chunks {
                    let mut chunk = msg.clone();
                    chunk[6..8].copy_from_slice(&i.to_be_bytes());
                    stream.write_all(&frame(&chunk)).await?;
                }
                return Ok(());
            }
            MockMode::ProxyEcho => unreachable!("handled above"),
        }
    }
}

// ============================================================================
// Proxy harness
// ============================================================================

fn test_config(backend: SocketAddr) -> Config {
    let mut config = Config::default();
    config.frontends[0].address = "127.0.0.1:0".parse().unwrap();
    config.frontends[0].max_in_flight_queries_per_conn = 8;
    config.backends = vec![BackendConfig {
        name: "mock".into(),
        address: backend,
        ..Default::default()
    }];
    config.tcp.worker_threads = 1;
    config
}

async fn start_proxy(config: Config) -> (Arc<ProxyServer>, SocketAddr) {
    let server = Arc::new(ProxyServer::forwarding(&config).await.unwrap());
    let addr = server.frontends()[0].local_addr();
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (server, addr)
}

async fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn single_query_fresh_backend() {
    let mock = spawn_mock(MockMode::Echo).await;
    let (server, addr) = start_proxy(test_config(mock.addr)).await;

    let mut client = connect(addr).await;
    let query = build_query(0x1D1D, "example.com", TYPE_A);
    client.write_all(&frame(&query)).await.unwrap();

    let response = timeout(Duration::from_secs(5), read_message(&mut client))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_id(&response), 0x1D1D);
    assert_eq!(response[2] & 0x80, 0x80);
    // Byte-identical relay, modulo the QR bit the mock flips.
    assert_eq!(&response[..2], &query[..2]);
    assert_eq!(&response[4..], &query[4..]);

    // The connection stays open for the next query.
    let query2 = build_query(0x1E1E, "example.org", TYPE_A);
    client.write_all(&frame(&query2)).await.unwrap();
    let response2 = timeout(Duration::from_secs(5), read_message(&mut client))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_id(&response2), 0x1E1E);

    let stats = &server.frontends()[0].stats;
    assert_eq!(stats.queries.load(Ordering::Relaxed), 2);
    assert_eq!(stats.responses.load(Ordering::Relaxed), 2);
    assert_eq!(stats.tcp_died_reading_query.load(Ordering::Relaxed), 0);
    assert_eq!(mock.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pipelined_responses_relay_in_arrival_order() {
    let mock = spawn_mock(MockMode::ReversePairs).await;
    let (_server, addr) = start_proxy(test_config(mock.addr)).await;

    let mut client = connect(addr).await;
    let query_a = build_query(0x0001, "a.example.com", TYPE_A);
    let query_b = build_query(0x0002, "b.example.com", TYPE_A);

    let mut both = frame(&query_a);
    both.extend_from_slice(&frame(&query_b));
    client.write_all(&both).await.unwrap();

    // The backend answers B first; the client must see B first, ids
    // untouched.
    let first = timeout(Duration::from_secs(5), read_message(&mut client))
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(5), read_message(&mut client))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_id(&first), 0x0002);
    assert_eq!(message_id(&second), 0x0001);
    assert_eq!(mock.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn axfr_streams_all_chunks_in_order() {
    let mock = spawn_mock(MockMode::Axfr(3)).await;
    let (server, addr) = start_proxy(test_config(mock.addr)).await;

    let mut client = connect(addr).await;
    let query = build_query(0x0AAA, "zone.example", TYPE_AXFR);
    client.write_all(&frame(&query)).await.unwrap();

    for expected in 1..=3u16 {
        let chunk = timeout(Duration::from_secs(5), read_message(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message_id(&chunk), 0x0AAA);
        assert_eq!(an_count(&chunk), expected);
    }

    // The backend closed after the transfer; the proxy closes the client
    // connection without reading further queries.
    expect_eof(&mut client).await;

    let stats = &server.frontends()[0].stats;
    assert_eq!(stats.queries.load(Ordering::Relaxed), 1);
    // A transfer counts as a single response however many messages it
    // spans.
    assert_eq!(stats.responses.load(Ordering::Relaxed), 1);

    // A completed transfer is a success: the backend closing its socket
    // after the last chunk must not read as a failure anywhere.
    assert_eq!(stats.tcp_gave_up.load(Ordering::Relaxed), 0);
    let backend_stats = &server.backends()[0].stats;
    assert_eq!(
        backend_stats.tcp_died_reading_response.load(Ordering::Relaxed),
        0
    );
    assert_eq!(backend_stats.tcp_gave_up.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn tlv_tainted_connections_are_not_shared() {
    let mock = spawn_mock(MockMode::ProxyEcho).await;
    let mut config = test_config(mock.addr);
    config.frontends[0].proxy_protocol_from = vec!["127.0.0.0/8".parse().unwrap()];
    config.backends[0].use_proxy_protocol = true;
    let (_server, addr) = start_proxy(config).await;

    let client_src: SocketAddr = "203.0.113.5:4444".parse().unwrap();
    let client_dst: SocketAddr = "192.0.2.10:53".parse().unwrap();

    for (id, tlv_value) in [(0x0101u16, b"x"), (0x0202u16, b"y")] {
        let tlvs = vec![ProxyTlv {
            kind: 0xE5,
            value: tlv_value.to_vec(),
        }];
        let header = reeve_proxy::proxy_protocol::encode_v2(client_src, client_dst, &tlvs);

        let mut client = connect(addr).await;
        client.write_all(&header).await.unwrap();
        client
            .write_all(&frame(&build_query(id, "tlv.example.com", TYPE_A)))
            .await
            .unwrap();

        let response = timeout(Duration::from_secs(5), read_message(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message_id(&response), id);
        drop(client);

        // Give the proxy a moment to notice the disconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Each TLV set got its own backend connection: the first one is
    // tainted by {x} and may not serve the client offering {y}.
    assert_eq!(mock.connections.load(Ordering::SeqCst), 2);
    let seen = mock.tlvs_seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0][0].value, b"x");
    assert_eq!(seen[1][0].value, b"y");
}

#[tokio::test]
async fn idle_backend_connection_is_pooled_and_reused() {
    let mock = spawn_mock(MockMode::Echo).await;
    let (_server, addr) = start_proxy(test_config(mock.addr)).await;

    for id in [0x0301u16, 0x0302] {
        let mut client = connect(addr).await;
        client
            .write_all(&frame(&build_query(id, "pool.example.com", TYPE_A)))
            .await
            .unwrap();
        let response = timeout(Duration::from_secs(5), read_message(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message_id(&response), id);
        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Both clients rode the same backend connection.
    assert_eq!(mock.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn per_client_cap_closes_surplus_connections() {
    let mock = spawn_mock(MockMode::Echo).await;
    let mut config = test_config(mock.addr);
    config.tcp.max_connections_per_client = 2;
    let (_server, addr) = start_proxy(config).await;

    let mut c1 = connect(addr).await;
    let mut c2 = connect(addr).await;

    // Prove both survivors are live before and after the surplus attempt.
    for (id, client) in [(0x0401u16, &mut c1), (0x0402, &mut c2)] {
        client
            .write_all(&frame(&build_query(id, "cap.example.com", TYPE_A)))
            .await
            .unwrap();
        let response = timeout(Duration::from_secs(5), read_message(client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message_id(&response), id);
    }

    let mut c3 = connect(addr).await;
    expect_eof(&mut c3).await;

    for (id, client) in [(0x0403u16, &mut c1), (0x0404, &mut c2)] {
        client
            .write_all(&frame(&build_query(id, "cap.example.com", TYPE_A)))
            .await
            .unwrap();
        let response = timeout(Duration::from_secs(5), read_message(client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message_id(&response), id);
    }
}

#[tokio::test]
async fn max_queries_per_connection_closes_after_last_response() {
    let mock = spawn_mock(MockMode::Echo).await;
    let mut config = test_config(mock.addr);
    config.tcp.max_queries_per_conn = 2;
    let (_server, addr) = start_proxy(config).await;

    let mut client = connect(addr).await;
    for id in [0x0501u16, 0x0502] {
        client
            .write_all(&frame(&build_query(id, "limit.example.com", TYPE_A)))
            .await
            .unwrap();
        let response = timeout(Duration::from_secs(5), read_message(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message_id(&response), id);
    }

    // The second response arrived in full; only then does the proxy close.
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn questionless_query_gets_notimp_and_connection_survives() {
    let mock = spawn_mock(MockMode::Echo).await;
    let (_server, addr) = start_proxy(test_config(mock.addr)).await;

    let mut client = connect(addr).await;
    let mut headeronly = vec![0u8; 12];
    headeronly[0] = 0x06;
    headeronly[1] = 0x06;
    client.write_all(&frame(&headeronly)).await.unwrap();

    let response = timeout(Duration::from_secs(5), read_message(&mut client))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_id(&response), 0x0606);
    assert_eq!(response[2] & 0x80, 0x80, "QR must be set");
    assert_eq!(response[3] & 0x0F, 4, "rcode must be NotImp");

    // The connection keeps serving.
    client
        .write_all(&frame(&build_query(0x0607, "after.example.com", TYPE_A)))
        .await
        .unwrap();
    let response = timeout(Duration::from_secs(5), read_message(&mut client))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_id(&response), 0x0607);
}

#[tokio::test]
async fn undersized_frame_closes_connection() {
    let mock = spawn_mock(MockMode::Echo).await;
    let (_server, addr) = start_proxy(test_config(mock.addr)).await;

    let mut client = connect(addr).await;
    // Declared length one byte below the DNS header size.
    client.write_all(&frame(&vec![0u8; 11])).await.unwrap();
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn read_timeout_with_in_flight_query_still_delivers_response() {
    let mock = spawn_mock(MockMode::EchoDelay(Duration::from_millis(1500))).await;
    let mut config = test_config(mock.addr);
    config.tcp.read_timeout = 1;
    let (server, addr) = start_proxy(config).await;

    let mut client = connect(addr).await;
    client
        .write_all(&frame(&build_query(0x0701, "slow.example.com", TYPE_A)))
        .await
        .unwrap();

    // The client-side read deadline fires at 1s with the query still in
    // flight; the connection goes idle instead of dying and relays the
    // response when it lands at 1.5s.
    let response = timeout(Duration::from_secs(5), read_message(&mut client))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message_id(&response), 0x0701);

    // With nothing left in flight the next read timeout closes for real.
    expect_eof(&mut client).await;
    assert!(
        server.frontends()[0]
            .stats
            .tcp_client_timeouts
            .load(Ordering::Relaxed)
            >= 1
    );
}

// ============================================================================
// TLS
// ============================================================================

mod tls {
    use super::*;
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use std::io::Write as _;

    #[derive(Debug)]
    struct NoVerify;

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    fn write_test_cert() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        use rcgen::{generate_simple_self_signed, CertifiedKey};

        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(key_pair.serialize_pem().as_bytes())
            .unwrap();
        (cert_file, key_file)
    }

    #[tokio::test]
    async fn tls_frontend_serves_queries_and_tallies_handshakes() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mock = spawn_mock(MockMode::Echo).await;
        let (cert_file, key_file) = write_test_cert();

        let mut config = test_config(mock.addr);
        config.frontends[0].tls = Some(reeve_config::TlsConfig {
            cert: cert_file.path().to_path_buf(),
            key: key_file.path().to_path_buf(),
        });
        let (server, addr) = start_proxy(config).await;

        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

        let tcp = connect(addr).await;
        let server_name = ServerName::try_from("localhost").unwrap();
        let mut stream = connector.connect(server_name, tcp).await.unwrap();

        stream
            .write_all(&frame(&build_query(0x0801, "tls.example.com", TYPE_A)))
            .await
            .unwrap();
        stream.flush().await.unwrap();

        let response = timeout(Duration::from_secs(5), read_message(&mut stream))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message_id(&response), 0x0801);

        let stats = &server.frontends()[0].stats;
        assert_eq!(stats.tls_new_sessions.load(Ordering::Relaxed), 1);
        assert_eq!(
            stats.tls13_connections.load(Ordering::Relaxed)
                + stats.tls12_connections.load(Ordering::Relaxed),
            1
        );
    }
}
