//! Multi-host client.
//!
//! Routes each request to a [`HostClient`] keyed by `host:port`, creating
//! host clients on first use. A background cleaner drops host clients unused
//! for a minute and stops once none remain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::codec::{Request, Response};
use crate::config::ClientConfig;
use crate::net::dial::add_missing_port;
use crate::net::Dial;

use super::executor::{self, RequestExecutor};
use super::{ClientError, HostClient};

const HOST_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const CLEAN_INTERVAL: Duration = Duration::from_secs(10);

struct ClientInner {
    config: ClientConfig,
    dial: Option<Arc<dyn Dial>>,
    hosts: DashMap<String, HostClient>,
    cleaner_running: AtomicBool,
}

/// HTTP client for arbitrary `http://` URLs.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("hosts", &self.inner.hosts.len()).finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self::build(config, None)
    }

    /// Opens every connection with `dial` instead of TCP.
    pub fn with_dialer(config: ClientConfig, dial: Arc<dyn Dial>) -> Self {
        Self::build(config, Some(dial))
    }

    fn build(config: ClientConfig, dial: Option<Arc<dyn Dial>>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                dial,
                hosts: DashMap::new(),
                cleaner_running: AtomicBool::new(false),
            }),
        }
    }

    /// Number of hosts with a live host client.
    pub fn host_count(&self) -> usize {
        self.inner.hosts.len()
    }

    /// Sends `req` to the host named by its absolute target or `Host` header.
    pub async fn execute(&self, req: &Request, resp: &mut Response) -> Result<(), ClientError> {
        let host = self.route(req)?;
        self.host_client(&host).execute(req, resp).await
    }

    pub async fn execute_timeout(&self, req: &Request, resp: &mut Response, timeout: Duration) -> Result<(), ClientError> {
        executor::execute_deadline(self, req, resp, Instant::now() + timeout).await
    }

    pub async fn execute_deadline(&self, req: &Request, resp: &mut Response, deadline: Instant) -> Result<(), ClientError> {
        executor::execute_deadline(self, req, resp, deadline).await
    }

    /// GET `url`, following redirects.
    pub async fn get(&self, url: &str) -> Result<Response, ClientError> {
        executor::get(self, url, None).await
    }

    pub async fn get_timeout(&self, url: &str, timeout: Duration) -> Result<Response, ClientError> {
        executor::get(self, url, Some(Instant::now() + timeout)).await
    }

    pub async fn get_deadline(&self, url: &str, deadline: Instant) -> Result<Response, ClientError> {
        executor::get(self, url, Some(deadline)).await
    }

    pub async fn post(&self, url: &str, body: Bytes) -> Result<Response, ClientError> {
        executor::post(self, url, body).await
    }

    /// Resolves the `host:port` a request is sent to.
    fn route(&self, req: &Request) -> Result<String, ClientError> {
        if let Some(pos) = req.target.find("://") {
            let scheme = &req.target[..pos];
            if !scheme.eq_ignore_ascii_case("http") {
                return Err(ClientError::UnsupportedScheme(scheme.to_string()));
            }
        }
        let host = req
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClientError::InvalidUrl(format!("no host in request to {:?}", req.target)))?;
        Ok(add_missing_port(host, 80))
    }

    fn host_client(&self, host: &str) -> HostClient {
        if let Some(existing) = self.inner.hosts.get(host) {
            return existing.clone();
        }
        let client = self
            .inner
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                let config = self.inner.config.for_host(host);
                match &self.inner.dial {
                    Some(dial) => HostClient::with_dialer(config, Arc::clone(dial)),
                    None => HostClient::new(config),
                }
            })
            .clone();
        self.ensure_cleaner();
        client
    }

    fn ensure_cleaner(&self) {
        if self.inner.cleaner_running.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(clean_hosts(Arc::downgrade(&self.inner)));
    }
}

async fn clean_hosts(client: Weak<ClientInner>) {
    loop {
        tokio::time::sleep(CLEAN_INTERVAL).await;
        let Some(inner) = client.upgrade() else { return };
        let now = Instant::now();
        inner
            .hosts
            .retain(|_, host| now.saturating_duration_since(host.last_use_time()) <= HOST_IDLE_TIMEOUT);
        if inner.hosts.is_empty() {
            inner.cleaner_running.store(false, Ordering::Release);
            // a host may have been added between the check and the store
            if inner.hosts.is_empty() || inner.cleaner_running.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }
}

impl RequestExecutor for Client {
    fn execute<'a>(&'a self, req: &'a Request, resp: &'a mut Response) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(Client::execute(self, req, resp))
    }
}
