//! In-process fake of the Caddy admin API, plus shared test helpers

// Each test binary uses a different subset of these helpers
#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const SERVERS_PATH: &str = "/config/apps/http/servers";

/// How long a hanging fake waits before answering
const HANG: Duration = Duration::from_secs(30);

#[derive(Default)]
struct FakeState {
    /// The `apps.http.servers` subtree; `null` when nothing is configured
    servers: Mutex<Value>,
    /// Everything in the config outside `apps.http.servers`
    config: Mutex<Value>,
    server_posts: AtomicUsize,
    load_posts: AtomicUsize,
    reject: Mutex<Option<String>>,
    malformed: AtomicBool,
    hang: AtomicBool,
    /// Pause applied to every read of the servers subtree
    read_delay: Mutex<Duration>,
    /// Reads of the servers subtree not yet followed by a write
    cycles_in_flight: AtomicUsize,
    max_cycles_in_flight: AtomicUsize,
}

/// A fake Caddy admin endpoint listening on a random local port
pub struct FakeCaddy {
    addr: SocketAddr,
    state: Arc<FakeState>,
    task: JoinHandle<()>,
}

impl FakeCaddy {
    pub async fn start() -> Self {
        Self::with_servers(Value::Null).await
    }

    pub async fn with_servers(servers: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(FakeState::default());
        *state.servers.lock() = servers;
        *state.config.lock() = json!({
            "admin": {"listen": "localhost:2019"},
            "logging": {"logs": {"default": {"level": "INFO"}}}
        });

        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&task_state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, hyper::Error>(handle(req, state).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn servers(&self) -> Value {
        self.state.servers.lock().clone()
    }

    /// Number of POSTs to the servers subtree
    pub fn server_posts(&self) -> usize {
        self.state.server_posts.load(Ordering::SeqCst)
    }

    /// Number of POSTs to `/load`
    pub fn load_posts(&self) -> usize {
        self.state.load_posts.load(Ordering::SeqCst)
    }

    /// Reject every write with this message
    pub fn reject_writes(&self, message: &str) {
        *self.state.reject.lock() = Some(message.to_string());
    }

    /// Answer reads with a body that is not JSON
    pub fn serve_malformed(&self) {
        self.state.malformed.store(true, Ordering::SeqCst);
    }

    /// Accept connections but never answer within a client timeout
    pub fn hang(&self) {
        self.state.hang.store(true, Ordering::SeqCst);
    }

    /// Hold every read of the servers subtree for `delay` before answering
    pub fn delay_reads(&self, delay: Duration) {
        *self.state.read_delay.lock() = delay;
    }

    /// Highest number of read-then-write cycles seen open at the same time
    pub fn max_cycles_in_flight(&self) -> usize {
        self.state.max_cycles_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for FakeCaddy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .unwrap()
}

fn rejection(state: &FakeState) -> Option<Response<Full<Bytes>>> {
    state.reject.lock().as_ref().map(|message| {
        json_response(
            StatusCode::BAD_REQUEST,
            json!({ "error": message }).to_string(),
        )
    })
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    state: Arc<FakeState>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await.unwrap().to_bytes();

    if state.hang.load(Ordering::SeqCst) {
        tokio::time::sleep(HANG).await;
    }

    if method == Method::GET && state.malformed.load(Ordering::SeqCst) {
        return json_response(StatusCode::OK, "{not json");
    }

    match (method, path.as_str()) {
        (Method::GET, SERVERS_PATH) => {
            let open = state.cycles_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_cycles_in_flight.fetch_max(open, Ordering::SeqCst);

            let delay = *state.read_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            json_response(StatusCode::OK, state.servers.lock().to_string())
        }
        (Method::POST, SERVERS_PATH) => {
            let _ = state.cycles_in_flight.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            });
            if let Some(response) = rejection(&state) {
                return response;
            }
            let Ok(servers) = serde_json::from_slice::<Value>(&body) else {
                return json_response(StatusCode::BAD_REQUEST, r#"{"error":"invalid JSON"}"#);
            };
            *state.servers.lock() = servers;
            state.server_posts.fetch_add(1, Ordering::SeqCst);
            json_response(StatusCode::OK, "")
        }
        (Method::GET, "/config/") => {
            let mut config = state.config.lock().clone();
            let servers = state.servers.lock().clone();
            if !servers.is_null() {
                config["apps"]["http"]["servers"] = servers;
            }
            json_response(StatusCode::OK, config.to_string())
        }
        (Method::POST, "/load") => {
            if let Some(response) = rejection(&state) {
                return response;
            }
            let Ok(mut config) = serde_json::from_slice::<Value>(&body) else {
                return json_response(StatusCode::BAD_REQUEST, r#"{"error":"invalid JSON"}"#);
            };
            let servers = config
                .pointer_mut("/apps/http")
                .and_then(|http| http.as_object_mut())
                .and_then(|http| http.remove("servers"))
                .unwrap_or(Value::Null);
            *state.servers.lock() = servers;
            *state.config.lock() = config;
            state.load_posts.fetch_add(1, Ordering::SeqCst);
            json_response(StatusCode::OK, "")
        }
        _ => json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#),
    }
}

/// Address with nothing listening on it
pub async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// One group listening on `listen` with a managed route for `domain`
pub fn group_with_route(listen: &str, domain: &str, dial: &str) -> Value {
    json!({
        "listen": [listen],
        "routes": [managed_route(domain, dial)]
    })
}

pub fn managed_route(domain: &str, dial: &str) -> Value {
    json!({
        "match": [{"host": [domain]}],
        "handle": [{
            "handler": "subroute",
            "routes": [{
                "handle": [{
                    "handler": "reverse_proxy",
                    "upstreams": [{"dial": dial}]
                }]
            }]
        }]
    })
}

/// Every (host, dial) pair routed by a servers subtree, in group order
pub fn routed_hosts(servers: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let Some(groups) = servers.as_object() else {
        return pairs;
    };
    for group in groups.values() {
        for route in group["routes"].as_array().into_iter().flatten() {
            let host = route.pointer("/match/0/host/0").and_then(Value::as_str);
            let dial = route
                .pointer("/handle/0/routes/0/handle/0/upstreams/0/dial")
                .and_then(Value::as_str);
            if let (Some(host), Some(dial)) = (host, dial) {
                pairs.push((host.to_string(), dial.to_string()));
            }
        }
    }
    pairs
}
