//! End-to-end test: a backend serving its HTTP API, and a distributor-side
//! client following the resource stream.

use ferry_client::Client;
use ferry_core::{BackendResources, Bridge, Interval, ResourceRequest, Stencil};
use ferry_server::api::ApiConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "IntegrationTestToken";
const FINGERPRINT: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

fn bridge(port: u16) -> Bridge {
    let mut b = Bridge::new();
    b.address = "1.2.3.4".parse().expect("valid address");
    b.port = port;
    b.fingerprint = FINGERPRINT.to_string();
    b
}

async fn start_backend(resources: Arc<BackendResources>) -> SocketAddr {
    let mut tokens = HashMap::new();
    tokens.insert("https".to_string(), TOKEN.to_string());
    let router = ApiConfig::new(resources, tokens).into_router(
        "/resources",
        "/resource-stream",
        "/status",
    );

    let handle = axum_server::Handle::new();
    let server_handle = handle.clone();
    tokio::spawn(async move {
        axum_server::bind("127.0.0.1:0".parse().expect("valid address"))
            .handle(server_handle)
            .serve(router.into_make_service())
            .await
            .expect("server runs");
    });
    handle.listening().await.expect("server bound")
}

#[tokio::test]
async fn stream_delivers_snapshot_then_deltas() {
    let mut stencil = Stencil::new();
    stencil.add_interval(Interval::new(0, 0, "https"));
    let resources = Arc::new(BackendResources::new(
        &["vanilla".to_string()],
        stencil,
        None,
    ));
    resources.add(Box::new(bridge(9001))).await;

    let addr = start_backend(resources.clone()).await;
    let client = Client::new(
        &format!("http://{addr}/resources"),
        &format!("http://{addr}/resource-stream"),
        TOKEN,
    )
    .expect("client");
    let request = ResourceRequest::new("https", &["vanilla"]);

    // A one-shot fetch sees the seeded bridge.
    let fetched = client.get_resources(&request).await.expect("resources");
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].fingerprint(), Some(FINGERPRINT));

    // The stream opens with a full snapshot.
    let shutdown = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = client.start_stream(request, tx, shutdown.clone());

    let snapshot = rx.recv().await.expect("snapshot frame");
    assert_eq!(snapshot.new.total(), 1);
    assert_eq!(snapshot.changed.total(), 0);

    // The same bridge on a new port keeps its uid but changes its oid, so
    // subscribers get exactly one changed frame.
    resources.add(Box::new(bridge(9002))).await;
    let delta = rx.recv().await.expect("delta frame");
    assert_eq!(delta.new.total(), 0);
    assert_eq!(delta.changed.total(), 1);
    let queue = delta.changed.queue("vanilla").expect("changed entries");
    assert!(queue.iter().next().expect("one entry").to_string().ends_with(FINGERPRINT));

    shutdown.cancel();
    stream.await.expect("stream task stops");
}

#[tokio::test]
async fn stream_requires_a_valid_token() {
    let mut stencil = Stencil::new();
    stencil.add_interval(Interval::new(0, 0, "https"));
    let resources = Arc::new(BackendResources::new(
        &["vanilla".to_string()],
        stencil,
        None,
    ));
    let addr = start_backend(resources).await;

    let client = Client::new(
        &format!("http://{addr}/resources"),
        &format!("http://{addr}/resource-stream"),
        "WrongToken",
    )
    .expect("client");

    let err = client
        .get_resources(&ResourceRequest::new("https", &["vanilla"]))
        .await
        .unwrap_err();
    match err {
        ferry_client::ClientError::Api { status, .. } => assert_eq!(status, 401),
        other => panic!("expected an api error, got {other:?}"),
    }
}
