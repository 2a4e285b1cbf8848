//! Output reference resolution.
//!
//! Outputs in the notebook doc and in `output` broadcasts are either inline
//! Jupyter output JSON or the 64-hex hash of an output manifest in the
//! daemon's blob store. Inline outputs are parsed locally. Hashes are
//! fetched from the blob HTTP server on `127.0.0.1:{port}` and every
//! `ContentRef` in the manifest is resolved.
//!
//! Resolved hashes are cached for the life of the process and concurrent
//! requests for the same hash share one fetch. The blob port is cached too
//! and dropped on disconnect; a fetch that fails on a cached port gets one
//! retry on a freshly looked-up port.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use runtimed::output_store::{is_blob_hash, resolve_manifest, BlobSource};
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::daemon::DaemonRpc;
use crate::error::{ResolveError, SessionError};

/// Fetches blobs from the daemon's blob server.
#[async_trait]
pub trait BlobEndpoint: Send + Sync {
    async fn fetch(&self, port: u16, hash: &str) -> Result<Vec<u8>, ResolveError>;
}

/// `GET http://127.0.0.1:{port}/blob/{hash}`
#[derive(Debug, Clone)]
pub struct HttpBlobEndpoint {
    client: reqwest::Client,
}

impl HttpBlobEndpoint {
    /// The blob server is always on loopback, so proxies are skipped.
    pub fn new() -> Self {
        let client = match reqwest::Client::builder().no_proxy().build() {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    "[manifest-resolver] HTTP client setup failed ({}), using defaults",
                    e
                );
                reqwest::Client::default()
            }
        };
        Self { client }
    }
}

impl Default for HttpBlobEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobEndpoint for HttpBlobEndpoint {
    async fn fetch(&self, port: u16, hash: &str) -> Result<Vec<u8>, ResolveError> {
        let url = format!("http://127.0.0.1:{}/blob/{}", port, hash);
        let fetch_error = |message: String| ResolveError::Fetch {
            hash: hash.to_string(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Blob source bound to one port, for resolving a manifest's content refs.
struct PortBlobSource<'a> {
    endpoint: &'a dyn BlobEndpoint,
    port: u16,
}

#[async_trait]
impl BlobSource for PortBlobSource<'_> {
    async fn get_blob(&self, hash: &str) -> io::Result<Vec<u8>> {
        self.endpoint
            .fetch(self.port, hash)
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

type InFlight = Shared<BoxFuture<'static, Option<Value>>>;

struct Inner {
    daemon: Arc<dyn DaemonRpc>,
    endpoint: Arc<dyn BlobEndpoint>,
    port_retry: RetryPolicy,
    port: Mutex<Option<u16>>,
    /// Serializes port lookups so concurrent misses share one.
    port_lookup: tokio::sync::Mutex<()>,
    cache: Mutex<HashMap<String, Value>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

/// Cheap to clone; clones share the port and output caches.
#[derive(Clone)]
pub struct ManifestResolver {
    inner: Arc<Inner>,
}

impl ManifestResolver {
    pub fn new(
        daemon: Arc<dyn DaemonRpc>,
        endpoint: Arc<dyn BlobEndpoint>,
        port_retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                daemon,
                endpoint,
                port_retry,
                port: Mutex::new(None),
                port_lookup: tokio::sync::Mutex::new(()),
                cache: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolve an output reference to Jupyter output JSON.
    ///
    /// Returns `None` (after logging) when the reference can't be resolved.
    pub async fn resolve(&self, output_ref: &str) -> Option<Value> {
        if !is_blob_hash(output_ref) {
            return parse_inline_output(output_ref);
        }

        let fut = {
            let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(value) = self.cached(output_ref) {
                return Some(value);
            }
            match in_flight.get(output_ref) {
                Some(fut) => fut.clone(),
                None => {
                    let this = self.clone();
                    let hash = output_ref.to_string();
                    let fut = async move {
                        let result = this.resolve_uncached(&hash).await;
                        if let Some(value) = &result {
                            this.inner
                                .cache
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .insert(hash.clone(), value.clone());
                        }
                        this.inner
                            .in_flight
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&hash);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(output_ref.to_string(), fut.clone());
                    fut
                }
            }
        };

        fut.await
    }

    /// Previously resolved output for a hash.
    pub fn cached(&self, hash: &str) -> Option<Value> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .cloned()
    }

    /// Forget the blob port. The daemon picks a new one when it restarts.
    pub fn invalidate_port(&self) {
        *self.inner.port.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn cached_port(&self) -> Option<u16> {
        *self.inner.port.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn resolve_uncached(&self, hash: &str) -> Option<Value> {
        let (port, was_cached) = match self.port().await {
            Ok(found) => found,
            Err(e) => {
                warn!("[manifest-resolver] No blob port for {}: {}", hash, e);
                return None;
            }
        };

        let first = match self.fetch_output(port, hash).await {
            Ok(value) => return Some(value),
            Err(e) => e,
        };
        if !was_cached {
            warn!("[manifest-resolver] Dropping output {}: {}", hash, first);
            return None;
        }

        debug!(
            "[manifest-resolver] Fetch on cached port {} failed ({}), refreshing port",
            port, first
        );
        self.invalidate_port();
        let port = match self.port().await {
            Ok((port, _)) => port,
            Err(e) => {
                warn!("[manifest-resolver] Dropping output {}: {}", hash, e);
                return None;
            }
        };
        match self.fetch_output(port, hash).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("[manifest-resolver] Dropping output {}: {}", hash, e);
                None
            }
        }
    }

    /// The blob port and whether it came from the cache.
    async fn port(&self) -> Result<(u16, bool), ResolveError> {
        if let Some(port) = self.cached_port() {
            return Ok((port, true));
        }

        let _lookup = self.inner.port_lookup.lock().await;
        // Another caller may have finished a lookup while we waited.
        if let Some(port) = self.cached_port() {
            return Ok((port, false));
        }

        let policy = self.inner.port_retry;
        let mut last_error = SessionError::NotConnected;
        for attempt in 0..policy.attempts() {
            match self.inner.daemon.blob_port().await {
                Ok(port) => {
                    debug!("[manifest-resolver] Blob server on port {}", port);
                    *self.inner.port.lock().unwrap_or_else(|e| e.into_inner()) = Some(port);
                    return Ok((port, false));
                }
                Err(e) => {
                    debug!(
                        "[manifest-resolver] Port lookup attempt {} failed: {}",
                        attempt + 1,
                        e
                    );
                    last_error = e;
                    if attempt + 1 < policy.attempts() {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(ResolveError::Port(last_error))
    }

    async fn fetch_output(&self, port: u16, hash: &str) -> Result<Value, ResolveError> {
        let endpoint = self.inner.endpoint.as_ref();
        let manifest = endpoint.fetch(port, hash).await?;
        let source = PortBlobSource { endpoint, port };
        resolve_manifest(&manifest, &source)
            .await
            .map_err(|source| ResolveError::Manifest {
                hash: hash.to_string(),
                source,
            })
    }
}

/// Parse an inline output. Anything but a JSON object is rejected.
pub fn parse_inline_output(raw: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(_) => {
            warn!("[manifest-resolver] Inline output is not an object: {}", raw);
            None
        }
        Err(e) => {
            warn!("[manifest-resolver] Invalid inline output: {}", e);
            None
        }
    }
}
