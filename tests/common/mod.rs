//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use fastwire::codec::{Limits, Request};
use fastwire::config::ServerConfig;
use fastwire::net::{dial_fn, Accepted, BoxedConn, Dial, InMemoryListener, Listener};
use fastwire::server::{RequestCtx, RequestHandler, Server};

/// Starts `handler` behind an in-memory listener.
pub fn spawn_server(config: ServerConfig, handler: impl RequestHandler) -> (Server, InMemoryListener) {
    let listener = InMemoryListener::new();
    let server = Server::new(config, handler);
    {
        let server = server.clone();
        let listener = listener.clone();
        tokio::spawn(async move {
            let _ = server.serve(&listener).await;
        });
    }
    (server, listener)
}

/// Writes `raw` on a fresh connection and returns everything the server
/// sends back until it closes the connection.
pub async fn exchange(listener: &InMemoryListener, raw: &[u8]) -> String {
    let mut conn = listener.dial().unwrap();
    conn.write_all(raw).await.unwrap();
    read_to_close(&mut conn).await
}

pub async fn read_to_close<R: tokio::io::AsyncRead + Unpin>(conn: &mut R) -> String {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

/// Reads from `conn` until `needle` has been seen.
pub async fn read_until<R: tokio::io::AsyncRead + Unpin>(conn: &mut R, needle: &str) -> String {
    let mut out = Vec::new();
    let mut chunk = [0u8; 1024];
    while !String::from_utf8_lossy(&out).contains(needle) {
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut chunk))
            .await
            .expect("timed out waiting for server output")
            .unwrap();
        assert!(n > 0, "connection closed before {needle:?}; got {:?}", String::from_utf8_lossy(&out));
        out.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Handler answering `200 OK` with the request path.
pub struct PathEcho;

impl RequestHandler for PathEcho {
    fn handle<'a>(&'a self, ctx: &'a mut RequestCtx) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = ctx.request.path().to_owned();
            ctx.success("text/plain", body);
        })
    }
}

/// Handler that waits `delay` before answering with the request path.
pub struct SlowEcho(pub Duration);

impl RequestHandler for SlowEcho {
    fn handle<'a>(&'a self, ctx: &'a mut RequestCtx) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::sleep(self.0).await;
            let body = ctx.request.path().to_owned();
            ctx.success("text/plain", body);
        })
    }
}

/// Dialer that connects every address to `listener` and records the
/// addresses it was asked for.
pub fn recording_dialer(listener: &InMemoryListener) -> (Arc<dyn Dial>, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let listener = listener.clone();
    let dial = dial_fn(move |addr: String| {
        recorder.lock().unwrap().push(addr);
        let conn = listener.dial().map(|c| Box::new(c) as BoxedConn);
        async move { conn }
    });
    (Arc::new(dial), seen)
}

/// Accepts connections on `listener` and runs `f` with each one and its
/// 0-based index, for hand-scripted peers.
pub fn spawn_scripted_backend<F, Fut>(listener: InMemoryListener, f: F)
where
    F: Fn(usize, BoxedConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut index = 0;
        while let Ok(Some(Accepted { conn, .. })) = listener.accept().await {
            tokio::spawn(f(index, conn));
            index += 1;
        }
    });
}

/// Reads one request off a raw connection.
pub async fn read_request(conn: &mut BoxedConn, buf: &mut BytesMut) -> io::Result<Request> {
    Request::read_from(conn, buf, Limits::new(4096, 0))
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}

/// Start a programmable TCP backend answering every request on its own
/// connection with the status and body returned by `f`.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let mut socket: BoxedConn = Box::new(socket);
                        let mut buf = BytesMut::new();
                        if read_request(&mut socket, &mut buf).await.is_err() {
                            return;
                        }
                        let (status, body) = f().await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}
