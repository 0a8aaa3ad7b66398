//! Server integration tests over in-memory connections.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use fastwire::config::ServerConfig;
use fastwire::server::{handler_fn, timeout_handler, RequestCtx, Server, ServerError};

use common::{exchange, read_to_close, read_until, spawn_server, PathEcho, SlowEcho};

fn peer(last_octet: u8, port: u16) -> Option<SocketAddr> {
    Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port))
}

#[tokio::test]
async fn request_ceiling_closes_after_first_response() {
    let config = ServerConfig {
        max_requests_per_conn: 1,
        ..ServerConfig::default()
    };
    let (_server, listener) = spawn_server(config, PathEcho);

    let out = exchange(&listener, b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\n\r\n").await;

    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1);
    assert!(out.contains("connection: close"));
    assert!(out.ends_with("/first"));
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests() {
    let (server, listener) = spawn_server(ServerConfig::default(), PathEcho);
    let mut conn = listener.dial().unwrap();

    conn.write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let first = read_until(&mut conn, "\r\n\r\n/a").await;
    assert!(!first.contains("connection: close"));
    assert_eq!(server.concurrency(), 1);

    conn.write_all(b"GET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await.unwrap();
    let second = read_to_close(&mut conn).await;
    assert!(second.contains("connection: close"));
    assert!(second.ends_with("/b"));
}

#[tokio::test]
async fn pipelined_requests_answered_in_order() {
    let (_server, listener) = spawn_server(ServerConfig::default(), PathEcho);
    let out = exchange(
        &listener,
        b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;

    let first = out.find("\r\n\r\n/1").unwrap();
    let second = out.find("\r\n\r\n/2").unwrap();
    let third = out.find("\r\n\r\n/3").unwrap();
    assert!(first < second && second < third);
}

#[tokio::test]
async fn http10_keep_alive_is_opt_in() {
    let (_server, listener) = spawn_server(ServerConfig::default(), PathEcho);
    let mut conn = listener.dial().unwrap();

    conn.write_all(b"GET /a HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await.unwrap();
    let first = read_until(&mut conn, "\r\n\r\n/a").await;
    assert!(first.contains("connection: keep-alive"));

    conn.write_all(b"GET /b HTTP/1.0\r\n\r\n").await.unwrap();
    let second = read_to_close(&mut conn).await;
    assert!(second.contains("connection: close"));
}

#[tokio::test]
async fn head_response_has_no_body() {
    let (_server, listener) = spawn_server(ServerConfig::default(), PathEcho);
    let out = exchange(&listener, b"HEAD /resource HTTP/1.1\r\nConnection: close\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 200 OK"));
    assert!(out.contains("Content-Length: 9"));
    assert!(out.ends_with("\r\n\r\n"));
}

#[tokio::test]
async fn expect_continue_is_acknowledged_before_body() {
    let handler = handler_fn(|ctx: &mut RequestCtx| {
        let body = ctx.request.body.clone();
        ctx.success("text/plain", body);
    });
    let (_server, listener) = spawn_server(ServerConfig::default(), handler);
    let mut conn = listener.dial().unwrap();

    conn.write_all(b"POST /upload HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n")
        .await
        .unwrap();
    let interim = read_until(&mut conn, "\r\n\r\n").await;
    assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

    conn.write_all(b"hello").await.unwrap();
    let out = read_until(&mut conn, "hello").await;
    assert!(out.starts_with("HTTP/1.1 200 OK"));
}

#[tokio::test]
async fn hijacked_connection_gets_buffered_bytes() {
    let handler = handler_fn(|ctx: &mut RequestCtx| {
        ctx.success("text/plain", "switching");
        ctx.hijack(|mut conn| async move {
            let mut greeting = [0u8; 5];
            if conn.read_exact(&mut greeting).await.is_ok() {
                let _ = conn.write_all(&greeting.to_ascii_uppercase()).await;
            }
        });
    });
    let (_server, listener) = spawn_server(ServerConfig::default(), handler);

    let out = exchange(&listener, b"GET /upgrade HTTP/1.1\r\n\r\nhello").await;

    assert!(out.starts_with("HTTP/1.1 200 OK"));
    assert!(out.ends_with("switchingHELLO"));
}

#[tokio::test]
async fn hijack_skipped_when_connection_closes() {
    let handler = handler_fn(|ctx: &mut RequestCtx| {
        ctx.success("text/plain", "bye");
        ctx.hijack(|mut conn| async move {
            let _ = conn.write_all(b"should not appear").await;
        });
    });
    let (_server, listener) = spawn_server(ServerConfig::default(), handler);

    let out = exchange(&listener, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.ends_with("bye"));
}

#[tokio::test]
async fn slow_handler_answers_request_timeout() {
    let handler = timeout_handler(SlowEcho(Duration::from_millis(500)), Duration::from_millis(50), "too slow");
    let (_server, listener) = spawn_server(ServerConfig::default(), handler);

    let out = exchange(&listener, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 408 Request Timeout"));
    assert!(out.ends_with("too slow"));
}

#[tokio::test]
async fn timeout_response_overrides_handler_response() {
    let handler = handler_fn(|ctx: &mut RequestCtx| {
        ctx.timeout_error("gave up");
        ctx.success("text/plain", "late answer");
    });
    let (_server, listener) = spawn_server(ServerConfig::default(), handler);

    let out = exchange(&listener, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;

    assert!(out.starts_with("HTTP/1.1 408"));
    assert!(out.ends_with("gave up"));
}

#[tokio::test]
async fn per_ip_limit_rejects_extra_connections() {
    let config = ServerConfig {
        max_conns_per_ip: 1,
        ..ServerConfig::default()
    };
    let (_server, listener) = spawn_server(config, PathEcho);

    let mut held = listener.dial_from(peer(1, 1000)).unwrap();
    let mut rejected = listener.dial_from(peer(1, 1001)).unwrap();
    let other_ip = listener.dial_from(peer(2, 1000)).unwrap();

    let out = read_to_close(&mut rejected).await;
    assert!(out.starts_with("HTTP/1.1 429 Too Many Requests"));
    assert!(out.contains("max_conns_per_ip"));

    held.write_all(b"GET /held HTTP/1.1\r\n\r\n").await.unwrap();
    read_until(&mut held, "/held").await;

    let mut other_ip = other_ip;
    other_ip.write_all(b"GET /other HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
    assert!(read_to_close(&mut other_ip).await.ends_with("/other"));
}

#[tokio::test]
async fn per_ip_slot_released_on_close() {
    let config = ServerConfig {
        max_conns_per_ip: 1,
        ..ServerConfig::default()
    };
    let (server, listener) = spawn_server(config, PathEcho);

    let mut first = listener.dial_from(peer(3, 1)).unwrap();
    first.write_all(b"GET /1 HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
    read_to_close(&mut first).await;
    drop(first);
    tokio::time::timeout(Duration::from_secs(1), server.wait_idle()).await.unwrap();

    let mut second = listener.dial_from(peer(3, 2)).unwrap();
    second.write_all(b"GET /2 HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
    assert!(read_to_close(&mut second).await.ends_with("/2"));
}

#[tokio::test]
async fn serve_conn_enforces_concurrency() {
    let config = ServerConfig {
        concurrency: 1,
        ..ServerConfig::default()
    };
    let server = Server::new(config, PathEcho);

    let (mut busy_client, busy_server) = tokio::io::duplex(4096);
    let busy = {
        let server = server.clone();
        tokio::spawn(async move { server.serve_conn(Box::new(busy_server), None).await })
    };
    while server.concurrency() == 0 {
        tokio::task::yield_now().await;
    }

    let (mut client, conn) = tokio::io::duplex(4096);
    let err = server.serve_conn(Box::new(conn), None).await.unwrap_err();
    assert!(matches!(err, ServerError::ConcurrencyLimit));
    let out = read_to_close(&mut client).await;
    assert!(out.starts_with("HTTP/1.1 503 Service Unavailable"));

    busy_client.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await.unwrap();
    read_to_close(&mut busy_client).await;
    busy.await.unwrap().unwrap();
    assert_eq!(server.concurrency(), 0);
}

#[tokio::test]
async fn handler_panic_ends_only_its_connection() {
    let handler = handler_fn(|ctx: &mut RequestCtx| {
        if ctx.request.path() == "/panic" {
            panic!("handler failure");
        }
        ctx.success("text/plain", "fine");
    });
    let (_server, listener) = spawn_server(ServerConfig::default(), handler);

    let broken = exchange(&listener, b"GET /panic HTTP/1.1\r\n\r\n").await;
    assert!(broken.is_empty());

    let out = exchange(&listener, b"GET /ok HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.ends_with("fine"));
}

#[tokio::test]
async fn serve_conn_contains_handler_panic() {
    let handler = handler_fn(|_ctx: &mut RequestCtx| panic!("handler failure"));
    let server = Server::new(ServerConfig::default(), handler);

    let (mut client, conn) = tokio::io::duplex(4096);
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let err = server.serve_conn(Box::new(conn), None).await.unwrap_err();

    assert!(matches!(err, ServerError::HandlerPanic(ref msg) if msg == "handler failure"), "got {err:?}");
    assert!(read_to_close(&mut client).await.is_empty());
    assert_eq!(server.concurrency(), 0);
}

#[tokio::test]
async fn huge_content_length_fails_only_that_connection() {
    let (_server, listener) = spawn_server(ServerConfig::default(), PathEcho);

    let mut conn = listener.dial().unwrap();
    conn.write_all(b"POST / HTTP/1.1\r\nContent-Length: 1000000000000000\r\n\r\nabc")
        .await
        .unwrap();
    conn.shutdown().await.unwrap();
    assert!(read_to_close(&mut conn).await.is_empty());

    let out = exchange(&listener, b"GET /still-up HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.ends_with("/still-up"));
}

#[tokio::test]
async fn get_only_drops_other_methods() {
    let config = ServerConfig {
        get_only: true,
        ..ServerConfig::default()
    };
    let (_server, listener) = spawn_server(config, PathEcho);

    let out = exchange(&listener, b"POST /form HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await;
    assert!(out.is_empty());

    let out = exchange(&listener, b"GET /page HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.ends_with("/page"));
}

#[tokio::test]
async fn oversized_body_closes_connection() {
    let config = ServerConfig {
        max_request_body_size: 4,
        ..ServerConfig::default()
    };
    let (_server, listener) = spawn_server(config, PathEcho);

    let out = exchange(&listener, b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789").await;
    assert!(out.is_empty());
}

#[tokio::test]
async fn server_header_added_on_the_wire() {
    let config = ServerConfig {
        name: "unit-test".to_string(),
        ..ServerConfig::default()
    };
    let handler = handler_fn(|ctx: &mut RequestCtx| ctx.error("missing", StatusCode::NOT_FOUND));
    let (_server, listener) = spawn_server(config, handler);

    let out = exchange(&listener, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 404 Not Found"));
    assert!(out.contains("Server: unit-test"));
}

#[tokio::test]
async fn keepalive_allowance_expires() {
    let config = ServerConfig {
        max_keepalive_duration_ms: 100,
        ..ServerConfig::default()
    };
    let (_server, listener) = spawn_server(config, PathEcho);
    let mut conn = listener.dial().unwrap();

    conn.write_all(b"GET /a HTTP/1.1\r\n\r\n").await.unwrap();
    read_until(&mut conn, "/a").await;

    // idle past the allowance: the read deadline ends the connection
    let rest = read_to_close(&mut conn).await;
    assert!(rest.is_empty());
}

#[tokio::test]
async fn closed_listener_ends_serve() {
    let listener = fastwire::net::InMemoryListener::new();
    let server = Server::new(ServerConfig::default(), PathEcho);
    let serving = {
        let server = server.clone();
        let listener = listener.clone();
        tokio::spawn(async move { server.serve(&listener).await })
    };

    fastwire::net::Listener::close(&listener);
    tokio::time::timeout(Duration::from_secs(1), serving).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_signal_closes_listener() {
    let listener = fastwire::net::InMemoryListener::new();
    let server = Server::new(ServerConfig::default(), PathEcho);
    let shutdown = fastwire::Shutdown::new();
    let signal = shutdown.signaled();
    let serving = {
        let server = server.clone();
        let listener = listener.clone();
        tokio::spawn(async move { server.serve_with_shutdown(&listener, signal).await })
    };

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), serving).await.unwrap().unwrap().unwrap();
    assert!(listener.dial().is_err());
}
