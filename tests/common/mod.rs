//! Shared helpers for the integration tests: a minimal byte-level LDAP
//! client built on the crate's own BER primitives.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use ldapserve::ber::{read_packet, BerWriter, Packet};
use ldapserve::message::{APP_BIND_REQUEST, APP_EXTENDED_REQUEST, APP_MODIFY_REQUEST, APP_SEARCH_REQUEST, APP_UNBIND_REQUEST};
use ldapserve::{Config, Mux, Server};
use tokio::io::AsyncRead;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ldapserve=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Spawn `server.run` on an ephemeral port and wait until it is ready.
pub async fn start_server(config: Config, mux: Mux) -> (Arc<Server>, SocketAddr) {
    init_tracing();
    let server = Arc::new(Server::new(config));
    server.router(mux);
    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(err) = runner.run("127.0.0.1:0").await {
            panic!("server run failed: {}", err);
        }
    });
    let addr = wait_ready(&server).await;
    (server, addr)
}

/// Same, but LDAPS with the fixture certificate.
pub async fn start_tls_server(config: Config, mux: Mux) -> (Arc<Server>, SocketAddr) {
    init_tracing();
    let tls = ldapserve::tls::server_config(&ldapserve::TlsConfig {
        cert_file: "tests/fixtures/cert.pem".to_string(),
        key_file: "tests/fixtures/key.pem".to_string(),
    })
    .expect("fixture TLS config");
    let server = Arc::new(Server::new(config));
    server.router(mux);
    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(err) = runner.run_tls("127.0.0.1:0", tls).await {
            panic!("server run_tls failed: {}", err);
        }
    });
    let addr = wait_ready(&server).await;
    (server, addr)
}

pub async fn wait_ready(server: &Server) -> SocketAddr {
    for _ in 0..500 {
        if server.ready().await {
            if let Some(addr) = server.local_addr().await {
                return addr;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("server did not become ready");
}

/// rustls client config trusting the test CA.
pub fn client_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in ldapserve::tls::load_certs("tests/fixtures/ca.pem").expect("fixture CA") {
        roots.add(cert).expect("add CA to root store");
    }
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Read one PDU with a test deadline; panics on EOF.
pub async fn recv_pdu<R: AsyncRead + Unpin>(stream: &mut R, buffer: &mut BytesMut) -> Packet {
    read_packet(stream, buffer, Some(Duration::from_secs(5)))
        .await
        .expect("read PDU")
        .expect("connection closed while a PDU was expected")
}

/// Read one PDU or observe a clean close.
pub async fn recv_pdu_or_eof<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut BytesMut,
) -> Option<Packet> {
    read_packet(stream, buffer, Some(Duration::from_secs(5)))
        .await
        .ok()
        .flatten()
}

pub fn bind_request(message_id: i32, dn: &str, password: &str) -> Vec<u8> {
    let mut body = BerWriter::new();
    let envelope = body.start_sequence();
    body.write_integer(message_id);
    body.write_tag(APP_BIND_REQUEST);
    let op = body.reserve_length();
    body.write_integer(3);
    body.write_string(dn);
    body.write_context_string(0x80, password.as_bytes());
    body.end(op);
    body.end(envelope);
    body.into_vec()
}

pub fn search_request(
    message_id: i32,
    base_dn: &str,
    scope: u8,
    filter_attr: &str,
    filter_value: &str,
) -> Vec<u8> {
    let mut body = BerWriter::new();
    let envelope = body.start_sequence();
    body.write_integer(message_id);
    body.write_tag(APP_SEARCH_REQUEST);
    let op = body.reserve_length();
    body.write_string(base_dn);
    body.write_enumerated(scope);
    body.write_enumerated(0);
    body.write_integer(0);
    body.write_integer(0);
    body.write_boolean(false);
    body.write_tag(0xA3);
    let filter = body.reserve_length();
    body.write_string(filter_attr);
    body.write_string(filter_value);
    body.end(filter);
    let attrs = body.start_sequence();
    body.end(attrs);
    body.end(op);
    body.end(envelope);
    body.into_vec()
}

pub fn modify_request(message_id: i32, dn: &str) -> Vec<u8> {
    let mut body = BerWriter::new();
    let envelope = body.start_sequence();
    body.write_integer(message_id);
    body.write_tag(APP_MODIFY_REQUEST);
    let op = body.reserve_length();
    body.write_string(dn);
    let changes = body.start_sequence();
    let change = body.start_sequence();
    body.write_enumerated(2);
    let modification = body.start_sequence();
    body.write_string("mail");
    body.write_tag(0x31);
    let values = body.reserve_length();
    body.write_string("a@example.org");
    body.end(values);
    body.end(modification);
    body.end(change);
    body.end(changes);
    body.end(op);
    body.end(envelope);
    body.into_vec()
}

pub fn extended_request(message_id: i32, oid: &str) -> Vec<u8> {
    let mut body = BerWriter::new();
    let envelope = body.start_sequence();
    body.write_integer(message_id);
    body.write_tag(APP_EXTENDED_REQUEST);
    let op = body.reserve_length();
    body.write_context_string(0x80, oid.as_bytes());
    body.end(op);
    body.end(envelope);
    body.into_vec()
}

pub fn unbind_request(message_id: i32) -> Vec<u8> {
    let mut body = BerWriter::new();
    let envelope = body.start_sequence();
    body.write_integer(message_id);
    body.write_tag(APP_UNBIND_REQUEST);
    let op = body.reserve_length();
    body.end(op);
    body.end(envelope);
    body.into_vec()
}
