//! Multi-host Client tests over real TCP sockets.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::header::LOCATION;
use http::{HeaderValue, StatusCode};

use fastwire::client::ClientError;
use fastwire::config::{ClientConfig, HostClientConfig, ServerConfig};
use fastwire::net::{Listener, TcpAcceptor};
use fastwire::server::{handler_fn, RequestCtx, Server};
use fastwire::{Client, HostClient};

use common::start_programmable_backend;

#[tokio::test]
async fn client_fetches_from_tcp_backend() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let addr = start_programmable_backend(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move { (200, format!("hello #{n}")) }
    })
    .await;

    let client = Client::new(ClientConfig::default());
    let resp = client.get(&format!("http://{addr}/greeting")).await.unwrap();

    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(&resp.body[..], b"hello #0");
    assert_eq!(client.host_count(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn backend_status_is_passed_through() {
    let addr = start_programmable_backend(|| async { (503, "overloaded".to_string()) }).await;
    let client = HostClient::new(HostClientConfig::new(addr.to_string()));

    let resp = client.get_timeout(&format!("http://{addr}/"), Duration::from_secs(2)).await.unwrap();
    assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(&resp.body[..], b"overloaded");
}

#[tokio::test]
async fn redirects_are_followed() {
    let listener = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = handler_fn(|ctx: &mut RequestCtx| match ctx.request.path() {
        "/old" => {
            ctx.response.status = StatusCode::FOUND;
            ctx.response.headers.insert(LOCATION, HeaderValue::from_static("/new"));
        }
        "/loop" => {
            ctx.response.status = StatusCode::MOVED_PERMANENTLY;
            ctx.response.headers.insert(LOCATION, HeaderValue::from_static("/loop"));
        }
        path => {
            let body = format!("at {path}");
            ctx.success("text/plain", body);
        }
    });
    let server = Server::new(ServerConfig::default(), handler);
    tokio::spawn(async move {
        let _ = server.serve(&listener).await;
    });

    let client = Client::new(ClientConfig::default());
    let resp = client.get(&format!("http://{addr}/old")).await.unwrap();
    assert_eq!(&resp.body[..], b"at /new");

    let err = client.get(&format!("http://{addr}/loop")).await.unwrap_err();
    assert!(matches!(err, ClientError::TooManyRedirects));
}

#[tokio::test]
async fn unsupported_scheme_is_rejected() {
    let client = Client::new(ClientConfig::default());
    let err = client.get("https://example.com/").await.unwrap_err();
    assert!(matches!(err, ClientError::UnsupportedScheme(_)), "got {err:?}");
    assert_eq!(client.host_count(), 0);
}
