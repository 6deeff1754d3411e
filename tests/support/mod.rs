//! In-process LogNog server used by the integration tests.

use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use serde_json::{json, Value};

#[derive(Default)]
pub struct ServerState {
    pub ingest_status: AtomicU16,
    pub batches: Mutex<Vec<Value>>,
    pub notifications: Mutex<Vec<Value>>,
    pub acks: Mutex<Vec<(String, Value)>>,
}

impl ServerState {
    /// Every message the server has accepted so far, in arrival order.
    pub fn messages(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| {
                batch["events"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|event| event["message"].as_str().map(str::to_owned))
            })
            .collect()
    }
}

pub struct MockServer {
    pub url: String,
    pub state: Arc<ServerState>,
}

impl MockServer {
    /// Spawn the server on the current tokio runtime. Responds 200 to
    /// ingest until `state.ingest_status` says otherwise.
    pub fn spawn() -> MockServer {
        let state = Arc::new(ServerState::default());
        state.ingest_status.store(200, Ordering::SeqCst);

        let handler_state = Arc::clone(&state);
        let make_service = make_service_fn(move |_| {
            let state = Arc::clone(&handler_state);
            async move { Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&state), req))) }
        });

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let server = Server::bind(&addr).serve(make_service);
        let url = format!("http://{}", server.local_addr());
        tokio::spawn(server);

        MockServer { url, state }
    }
}

/// An address that refuses connections: bind, note the port, drop.
pub fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

async fn handle(
    state: Arc<ServerState>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_owned();

    if path == "/health" {
        return Ok(Response::new(Body::empty()));
    }

    if path == "/api/ingest/agent" {
        let status = state.ingest_status.load(Ordering::SeqCst);
        if status != 200 {
            return Ok(Response::builder()
                .status(status)
                .body(Body::empty())
                .unwrap());
        }
        let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        state.batches.lock().unwrap().push(body);
        return Ok(Response::new(Body::empty()));
    }

    if path == "/api/ingest/notifications" {
        let pending: Vec<Value> = state.notifications.lock().unwrap().drain(..).collect();
        let body = json!({ "notifications": pending }).to_string();
        return Ok(Response::builder()
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap());
    }

    if let Some(id) = path
        .strip_prefix("/api/ingest/notifications/")
        .and_then(|rest| rest.strip_suffix("/ack"))
    {
        let id = id.to_owned();
        let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        state.acks.lock().unwrap().push((id, body));
        return Ok(Response::new(Body::empty()));
    }

    Ok(Response::builder().status(404).body(Body::empty()).unwrap())
}
