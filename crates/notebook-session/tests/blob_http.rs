//! Output resolution against a real loopback blob server.

mod common;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{code_cell, fast_config, wait_for, FakeDaemon, FakeRoom};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use notebook_session::manifest_resolver::{BlobEndpoint, HttpBlobEndpoint};
use notebook_session::{CellOutput, NotebookSession};
use runtimed::output_store::blob_hash;
use serde_json::json;
use tokio::net::TcpListener;

/// Content-addressed blobs served at `/blob/{hash}`.
#[derive(Default)]
struct BlobServer {
    blobs: HashMap<String, Vec<u8>>,
    hits: AtomicUsize,
}

impl BlobServer {
    fn put(&mut self, data: &[u8]) -> String {
        let hash = blob_hash(data);
        self.blobs.insert(hash.clone(), data.to_vec());
        hash
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    async fn start(self: Arc<Self>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = self.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let server = server.clone();
                        async move { server.handle(req) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        port
    }

    fn handle(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let blob = req
            .uri()
            .path()
            .strip_prefix("/blob/")
            .and_then(|hash| self.blobs.get(hash));
        let response = match blob {
            Some(data) => Response::new(Full::new(Bytes::from(data.clone()))),
            None => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from_static(b"Not Found")))
                .unwrap(),
        };
        Ok(response)
    }
}

#[tokio::test]
async fn test_http_endpoint_fetches_and_reports_missing() {
    let mut server = BlobServer::default();
    let hash = server.put(b"payload");
    let server = Arc::new(server);
    let port = server.clone().start().await;

    let endpoint = HttpBlobEndpoint::new();
    assert_eq!(endpoint.fetch(port, &hash).await.unwrap(), b"payload");

    let missing = blob_hash(b"nope");
    let err = endpoint.fetch(port, &missing).await.unwrap_err();
    assert!(err.to_string().contains(&missing));
}

#[tokio::test]
async fn test_manifest_outputs_resolve_over_http() {
    let mut server = BlobServer::default();
    let image = server.put(b"iVBORw0KGgo=");
    let figure = server.put(
        json!({
            "output_type": "display_data",
            "data": {
                "image/png": { "blob": image, "size": 12 },
                "text/plain": { "inline": "<Figure>" },
            },
        })
        .to_string()
        .as_bytes(),
    );
    let stream = server.put(
        json!({
            "output_type": "stream",
            "name": "stdout",
            "text": { "inline": "done\n" },
        })
        .to_string()
        .as_bytes(),
    );
    let missing = blob_hash(b"never stored");
    let server = Arc::new(server);
    let port = server.clone().start().await;

    let daemon = FakeDaemon::new();
    daemon.set_blob_port(port);
    let room = FakeRoom::with_cells(
        daemon,
        vec![code_cell("a", "1", &[figure.as_str(), missing.as_str()])],
    );
    let session = NotebookSession::builder("notebook-1", fast_config())
        .connector(room.clone())
        .connect()
        .await
        .unwrap();

    wait_for("snapshot outputs to resolve", || {
        !session.cell("a").unwrap().has_pending_outputs()
    })
    .await;
    let cell = session.cell("a").unwrap();
    let rendered = cell.rendered_outputs();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0]["data"]["image/png"], "iVBORw0KGgo=");
    assert_eq!(rendered[0]["data"]["text/plain"], "<Figure>");
    assert_eq!(cell.outputs[1], CellOutput::Unresolvable(missing.clone()));

    room.broadcast(json!({ "event": "queue_changed", "executing": "a", "queued": [] }))
        .await;
    room.broadcast(json!({
        "event": "output",
        "cell_id": "a",
        "output_type": "stream",
        "output_json": stream,
    }))
    .await;
    wait_for("broadcast output", || {
        session.cell("a").unwrap().rendered_outputs().len() == 2
    })
    .await;

    // Resolved hashes come from the cache.
    let hits = server.hits();
    assert!(session.resolver().resolve(&figure).await.is_some());
    assert_eq!(server.hits(), hits);
}
