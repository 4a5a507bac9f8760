//! End-to-end tests: real sockets against a running server, with a
//! byte-level LDAP client built on the crate's own codec.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use ldapserve::ber::write_packet;
use ldapserve::message::{
    parse_result, parse_search_entry, APP_BIND_RESPONSE, APP_EXTENDED_RESPONSE,
    APP_MODIFY_RESPONSE, APP_SEARCH_RESULT_DONE,
};
use ldapserve::{
    codes, AuthChoice, Config, Mux, Scope, SearchRouteOpts, EXTENDED_OPERATION_START_TLS,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use common::*;

#[tokio::test]
async fn simple_bind_success() -> anyhow::Result<()> {
    let mut mux = Mux::new();
    mux.bind(AuthChoice::Simple, |mut writer, request| async move {
        let bind = request.simple_bind_message().expect("bind message");
        let code = if bind.user_name == "cn=admin" && bind.password == "x" {
            codes::SUCCESS
        } else {
            codes::INVALID_CREDENTIALS
        };
        let _ = writer
            .write(request.new_bind_response().with_response_code(code))
            .await;
    });
    let (server, addr) = start_server(Config::default(), mux).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(&mut stream, &bind_request(1, "cn=admin", "x")).await?;
    let result = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(result.message_id, 1);
    assert_eq!(result.application_tag, APP_BIND_RESPONSE);
    assert_eq!(result.code, codes::SUCCESS);

    // wrong password takes the other branch, proving the handler sees the fields
    write_packet(&mut stream, &bind_request(2, "cn=admin", "wrong")).await?;
    let result = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(result.code, codes::INVALID_CREDENTIALS);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn search_base_dn_matches_case_insensitively() -> anyhow::Result<()> {
    let mut mux = Mux::new();
    mux.search(
        SearchRouteOpts::default().with_base_dn("dc=example,dc=org"),
        |mut writer, request| async move {
            let entry = request
                .new_search_response_entry("cn=a,dc=example,dc=org")
                .with_attribute("cn", &["a"]);
            let _ = writer.write(entry).await;
            let _ = writer.write(request.new_search_done_response()).await;
        },
    );
    let (server, addr) = start_server(Config::default(), mux).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(
        &mut stream,
        &search_request(1, "DC=Example,DC=Org", 2, "cn", "a"),
    )
    .await?;

    let entry = parse_search_entry(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(entry.message_id, 1);
    assert_eq!(entry.dn, "cn=a,dc=example,dc=org");
    let attrs = ldapserve::message::attributes_to_map(&entry.attributes);
    assert_eq!(attrs.get("cn"), Some(&vec!["a".to_string()]));

    let done = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(done.message_id, 1);
    assert_eq!(done.application_tag, APP_SEARCH_RESULT_DONE);
    assert_eq!(done.code, codes::SUCCESS);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn search_scope_predicate_falls_through() -> anyhow::Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let base_hits = Arc::clone(&hits);
    let any_hits = Arc::clone(&hits);
    let mut mux = Mux::new();
    mux.search(
        SearchRouteOpts::default().with_scope(Scope::BaseObject),
        move |mut writer, request| {
            base_hits.store(1, Ordering::SeqCst);
            async move {
                let _ = writer.write(request.new_search_done_response()).await;
            }
        },
    );
    mux.search(SearchRouteOpts::default(), move |mut writer, request| {
        any_hits.store(2, Ordering::SeqCst);
        async move {
            let _ = writer.write(request.new_search_done_response()).await;
        }
    });
    let (server, addr) = start_server(Config::default(), mux).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(&mut stream, &search_request(4, "dc=x", 2, "cn", "a")).await?;
    let _ = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    write_packet(&mut stream, &search_request(5, "dc=x", 0, "cn", "a")).await?;
    let _ = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unrouted_operation_gets_unwilling_to_perform() -> anyhow::Result<()> {
    let (server, addr) = start_server(Config::default(), Mux::new()).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(&mut stream, &modify_request(3, "cn=a,dc=x")).await?;
    let result = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(result.message_id, 3);
    assert_eq!(result.application_tag, APP_MODIFY_RESPONSE);
    assert_eq!(result.code, codes::UNWILLING_TO_PERFORM);
    assert_eq!(result.diagnostic_message, "no route for operation");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn default_route_catches_unmatched_operations() -> anyhow::Result<()> {
    let mut mux = Mux::new();
    mux.default_route(|mut writer, request| async move {
        let reply = request
            .new_response()
            .with_application_code(7) // ModifyResponse
            .with_response_code(codes::INSUFFICIENT_ACCESS_RIGHTS)
            .with_diagnostic_message("read-only directory");
        let _ = writer.write(reply).await;
    });
    let (server, addr) = start_server(Config::default(), mux).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(&mut stream, &modify_request(6, "cn=a,dc=x")).await?;
    let result = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(result.code, codes::INSUFFICIENT_ACCESS_RIGHTS);
    assert_eq!(result.diagnostic_message, "read-only directory");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn starttls_upgrades_mid_session() -> anyhow::Result<()> {
    let tls_config = ldapserve::tls::server_config_from_files(
        "tests/fixtures/cert.pem",
        "tests/fixtures/key.pem",
    )?;

    let mut mux = Mux::new();
    let handler_tls = Arc::clone(&tls_config);
    mux.extended_operation(EXTENDED_OPERATION_START_TLS, move |mut writer, request| {
        let tls = Arc::clone(&handler_tls);
        async move {
            let _ = writer
                .write(
                    request
                        .new_extended_response()
                        .with_response_name(EXTENDED_OPERATION_START_TLS),
                )
                .await;
            request.start_tls(tls).expect("schedule TLS upgrade");
        }
    });
    mux.bind(AuthChoice::Simple, |mut writer, request| async move {
        assert!(request.tls_active(), "bind should arrive over TLS");
        let _ = writer.write(request.new_bind_response()).await;
    });
    let (server, addr) = start_server(Config::default(), mux).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(&mut stream, &extended_request(1, EXTENDED_OPERATION_START_TLS)).await?;
    let result = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(result.application_tag, APP_EXTENDED_RESPONSE);
    assert_eq!(result.code, codes::SUCCESS);

    let connector = tokio_rustls::TlsConnector::from(client_tls_config());
    let server_name = rustls::pki_types::ServerName::try_from("localhost".to_string())?;
    let mut tls_stream = connector.connect(server_name, stream).await?;

    let mut buffer = BytesMut::new();
    write_packet(&mut tls_stream, &bind_request(2, "cn=admin", "x")).await?;
    let result = parse_result(&recv_pdu(&mut tls_stream, &mut buffer).await)?;
    assert_eq!(result.message_id, 2);
    assert_eq!(result.code, codes::SUCCESS);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn ldaps_negotiates_tls_at_accept() -> anyhow::Result<()> {
    let mut mux = Mux::new();
    mux.bind(AuthChoice::Simple, |mut writer, request| async move {
        assert!(request.tls_active());
        let _ = writer.write(request.new_bind_response()).await;
    });
    let (server, addr) = start_tls_server(Config::default(), mux).await;

    let stream = TcpStream::connect(addr).await?;
    let connector = tokio_rustls::TlsConnector::from(client_tls_config());
    let server_name = rustls::pki_types::ServerName::try_from("localhost".to_string())?;
    let mut tls_stream = connector.connect(server_name, stream).await?;

    let mut buffer = BytesMut::new();
    write_packet(&mut tls_stream, &bind_request(1, "cn=admin", "x")).await?;
    let result = parse_result(&recv_pdu(&mut tls_stream, &mut buffer).await)?;
    assert_eq!(result.code, codes::SUCCESS);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stop_drains_in_flight_handlers() -> anyhow::Result<()> {
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut mux = Mux::new();
    mux.bind(AuthChoice::Simple, move |mut writer, request| {
        let started = started_tx.clone();
        async move {
            let _ = started.send(());
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = writer.write(request.new_bind_response()).await;
        }
    });
    let (server, addr) = start_server(Config::default(), mux).await;

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    server
        .on_close(move |_id| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    let begin = Instant::now();
    let mut streams = Vec::new();
    for i in 0..3 {
        let mut stream = TcpStream::connect(addr).await?;
        write_packet(&mut stream, &bind_request(i + 1, "cn=admin", "x")).await?;
        streams.push(stream);
    }
    for _ in 0..3 {
        started_rx.recv().await.expect("handler start signal");
    }

    server.stop().await?;
    assert!(
        begin.elapsed() >= Duration::from_millis(50),
        "stop returned before in-flight handlers completed"
    );
    assert_eq!(closed.load(Ordering::SeqCst), 3, "on_close once per connection");
    Ok(())
}

#[tokio::test]
async fn handler_panic_terminates_connection_not_server() -> anyhow::Result<()> {
    let mut mux = Mux::new();
    mux.bind(AuthChoice::Simple, |mut writer, request| async move {
        let bind = request.simple_bind_message().expect("bind message");
        if bind.user_name == "cn=boom" {
            panic!("handler exploded");
        }
        let _ = writer.write(request.new_bind_response()).await;
    });
    let (server, addr) = start_server(Config::default(), mux).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(&mut stream, &bind_request(1, "cn=boom", "x")).await?;
    assert!(
        recv_pdu_or_eof(&mut stream, &mut buffer).await.is_none(),
        "panicking handler should close the connection without a reply"
    );

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(&mut stream, &bind_request(1, "cn=admin", "x")).await?;
    let result = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(result.code, codes::SUCCESS, "server must keep serving");

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn connection_ids_are_monotonic_and_close_once() -> anyhow::Result<()> {
    let mut mux = Mux::new();
    mux.bind(AuthChoice::Simple, |mut writer, request| async move {
        let _ = writer.write(request.new_bind_response()).await;
    });
    let (server, addr) = start_server(Config::default(), mux).await;

    let closed: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&closed);
    server
        .on_close(move |id| {
            sink.lock().unwrap().push(id);
        })
        .await;

    for round in 0..2 {
        let mut stream = TcpStream::connect(addr).await?;
        let mut buffer = BytesMut::new();
        write_packet(&mut stream, &bind_request(1, "cn=admin", "x")).await?;
        let _ = recv_pdu(&mut stream, &mut buffer).await;
        write_packet(&mut stream, &unbind_request(2)).await?;
        drop(stream);
        for _ in 0..500 {
            if closed.lock().unwrap().len() > round {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    let ids = closed.lock().unwrap().clone();
    assert_eq!(ids, vec![1, 2]);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn pipelined_requests_answered_in_order() -> anyhow::Result<()> {
    let mut mux = Mux::new();
    mux.bind(AuthChoice::Simple, |mut writer, request| async move {
        let _ = writer.write(request.new_bind_response()).await;
    });
    let (server, addr) = start_server(Config::default(), mux).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut both = bind_request(1, "cn=admin", "x");
    both.extend_from_slice(&bind_request(2, "cn=admin", "x"));
    write_packet(&mut stream, &both).await?;

    let mut buffer = BytesMut::new();
    let first = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    let second = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(first.message_id, 1);
    assert_eq!(second.message_id, 2);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn router_hot_swap_applies_to_subsequent_requests() -> anyhow::Result<()> {
    let (server, addr) = start_server(Config::default(), Mux::new()).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(&mut stream, &modify_request(1, "cn=a,dc=x")).await?;
    let result = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(result.code, codes::UNWILLING_TO_PERFORM);

    let mut replacement = Mux::new();
    replacement.modify(|mut writer, request| async move {
        let _ = writer.write(request.new_modify_response()).await;
    });
    server.router(replacement);

    write_packet(&mut stream, &modify_request(2, "cn=a,dc=x")).await?;
    let result = parse_result(&recv_pdu(&mut stream, &mut buffer).await)?;
    assert_eq!(result.code, codes::SUCCESS);
    assert_eq!(result.application_tag, APP_MODIFY_RESPONSE);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unbind_closes_the_connection() -> anyhow::Result<()> {
    let (server, addr) = start_server(Config::default(), Mux::new()).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    write_packet(&mut stream, &unbind_request(1)).await?;
    assert!(recv_pdu_or_eof(&mut stream, &mut buffer).await.is_none());

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn read_deadline_expiry_closes_the_connection() -> anyhow::Result<()> {
    let config = Config {
        read_timeout_ms: Some(100),
        ..Config::default()
    };
    let (server, addr) = start_server(config, Mux::new()).await;

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    server
        .on_close(move |_id| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut scratch = [0u8; 16];
    let begin = Instant::now();
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut scratch))
        .await
        .expect("server should close the idle connection")?;
    assert_eq!(n, 0, "expected EOF from deadline expiry");
    assert!(begin.elapsed() >= Duration::from_millis(90));

    for _ in 0..500 {
        if closed.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_pdu_closes_connection_without_reply() -> anyhow::Result<()> {
    let (server, addr) = start_server(Config::default(), Mux::new()).await;

    let mut stream = TcpStream::connect(addr).await?;
    let mut buffer = BytesMut::new();
    // OCTET STRING where the LDAPMessage SEQUENCE belongs
    write_packet(&mut stream, &[0x04, 0x03, 0x01, 0x02, 0x03]).await?;
    assert!(recv_pdu_or_eof(&mut stream, &mut buffer).await.is_none());

    server.stop().await?;
    Ok(())
}
