use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::{fs, path::PathBuf};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tauon::{
    Context, HttpMethod, HttpTransport, Request, RunnerConfig, Scenario, ScenarioRunner,
    Transport, TransportError,
};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Hits {
    flaky: AtomicUsize,
    missing: AtomicUsize,
}

struct TestServer {
    base_url: String,
    hits: Arc<Hits>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// `/flaky` answers 503 until it has been hit `failures` times.
    async fn spawn(failures: usize) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Hits::default());

        let app = Router::new()
            .route(
                "/flaky",
                get(move |State(hits): State<Arc<Hits>>| async move {
                    let n = hits.flaky.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "busy"})))
                    } else {
                        (StatusCode::OK, Json(json!({"attempt": n + 1})))
                    }
                }),
            )
            .route(
                "/missing",
                get(|State(hits): State<Arc<Hits>>| async move {
                    hits.missing.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::NOT_FOUND, "no such thing")
                }),
            )
            .route(
                "/text",
                get(|| async move { ([("X-Custom", "yes")], "hello runner") }),
            )
            .route(
                "/echo-headers",
                get(|headers: HeaderMap| async move {
                    let map: HashMap<String, String> = headers
                        .iter()
                        .map(|(k, v)| {
                            (k.to_string(), v.to_str().unwrap_or_default().to_string())
                        })
                        .collect();
                    Json(json!(map))
                }),
            )
            .route(
                "/api/items",
                post(|Json(body): Json<Value>| async move {
                    let mut item = body;
                    item["id"] = json!("abc");
                    (StatusCode::CREATED, Json(item))
                }),
            )
            .route(
                "/api/items/:id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({"id": id, "name": "widget"}))
                }),
            )
            .with_state(hits.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn config(server: &TestServer, retries: u32) -> RunnerConfig {
    RunnerConfig {
        retries,
        retry_delay_ms: 10,
        ..RunnerConfig::default().with_base_url(&server.base_url)
    }
}

fn get_request(url: &str) -> Request {
    Request {
        method: HttpMethod::Get,
        url: url.to_string(),
        headers: HashMap::new(),
        body: None,
    }
}

fn load_scenario(path: &str, base_url: &str) -> Scenario {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let scenario_path = manifest_dir.join("tests/fixtures").join(path);
    let content = fs::read_to_string(&scenario_path)
        .unwrap_or_else(|e| panic!("failed to read {scenario_path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);
    Scenario::from_yaml(&content)
        .unwrap_or_else(|e| panic!("failed to parse scenario yaml: {e}"))
}

#[tokio::test]
async fn retries_server_errors_until_success() {
    let server = TestServer::spawn(2).await;
    let transport = HttpTransport::new(&config(&server, 2));

    let response = transport.send(&get_request("/flaky")).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.data, json!({"attempt": 3}));
    assert_eq!(server.hits.flaky.load(Ordering::SeqCst), 3);
    server.shutdown().await;
}

#[tokio::test]
async fn lenient_transport_still_retries_server_errors() {
    let server = TestServer::spawn(2).await;
    let lenient = RunnerConfig {
        fail_on_error_status: false,
        ..config(&server, 2)
    };
    let transport = HttpTransport::new(&lenient);

    let response = transport.send(&get_request("/flaky")).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(server.hits.flaky.load(Ordering::SeqCst), 3);
    server.shutdown().await;
}

#[tokio::test]
async fn lenient_transport_returns_last_server_error() {
    let server = TestServer::spawn(5).await;
    let lenient = RunnerConfig {
        fail_on_error_status: false,
        ..config(&server, 1)
    };
    let transport = HttpTransport::new(&lenient);

    let response = transport.send(&get_request("/flaky")).await.unwrap();

    assert_eq!(response.status, 503);
    assert_eq!(server.hits.flaky.load(Ordering::SeqCst), 2);
    server.shutdown().await;
}

#[tokio::test]
async fn gives_up_after_configured_retries() {
    let server = TestServer::spawn(5).await;
    let transport = HttpTransport::new(&config(&server, 1));

    let err = transport.send(&get_request("/flaky")).await.unwrap_err();

    assert!(matches!(err, TransportError::Status { status: 503, .. }));
    assert_eq!(server.hits.flaky.load(Ordering::SeqCst), 2);
    server.shutdown().await;
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = TestServer::spawn(0).await;
    let transport = HttpTransport::new(&config(&server, 3));

    let err = transport.send(&get_request("/missing")).await.unwrap_err();

    match err {
        TransportError::Status {
            status,
            status_text,
            body,
        } => {
            assert_eq!(status, 404);
            assert_eq!(status_text, "Not Found");
            assert_eq!(body, "no such thing");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(server.hits.missing.load(Ordering::SeqCst), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn error_status_can_be_returned_as_response() {
    let server = TestServer::spawn(0).await;
    let lenient = RunnerConfig {
        fail_on_error_status: false,
        ..config(&server, 0)
    };
    let transport = HttpTransport::new(&lenient);

    let response = transport.send(&get_request("/missing")).await.unwrap();

    assert_eq!(response.status, 404);
    assert_eq!(response.data, json!("no such thing"));
    server.shutdown().await;
}

#[tokio::test]
async fn text_body_and_lowercased_headers() {
    let server = TestServer::spawn(0).await;
    let transport = HttpTransport::new(&config(&server, 0));

    let response = transport.send(&get_request("/text")).await.unwrap();

    assert_eq!(response.data, json!("hello runner"));
    assert_eq!(response.headers.get("x-custom").map(String::as_str), Some("yes"));
    assert!(response.headers.keys().all(|k| *k == k.to_ascii_lowercase()));
    server.shutdown().await;
}

#[tokio::test]
async fn request_headers_are_sent() {
    let server = TestServer::spawn(0).await;
    let transport = HttpTransport::new(&config(&server, 0));
    let mut request = get_request(&format!("{}/echo-headers", server.base_url));
    request.headers.insert("X-Api-Key".into(), "secret".into());

    let response = transport.send(&request).await.unwrap();

    assert_eq!(response.data["x-api-key"], json!("secret"));
    server.shutdown().await;
}

#[tokio::test]
async fn connection_refused_is_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = RunnerConfig::default().with_base_url(format!("http://{addr}"));
    let err = HttpTransport::new(&config)
        .send(&get_request("/anything"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
}

#[tokio::test]
async fn create_then_read_scenario_over_http() {
    let server = TestServer::spawn(0).await;
    let scenario = load_scenario("create_read.yaml", &server.base_url);
    let mut runner = ScenarioRunner::new(scenario.config.clone());

    let report = runner
        .run(&scenario, Context::new())
        .await
        .expect("create/read scenario should succeed");

    assert!(report.success);
    assert_eq!(report.summary.successful, 2);
    assert_eq!(report.context.get("id"), Some(&json!("abc")));
    assert_eq!(report.context.get("itemName"), Some(&json!("widget")));
    server.shutdown().await;
}
