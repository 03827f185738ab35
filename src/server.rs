use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::task;
use tracing::{debug, error, info};

use crate::message::{Decode, Encode, PresignData, PresignRequest, PresignResponse, StatsRecord};

/// The endpoints emulated by [`LoopbackServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `POST /presign`
    Presign,
    /// `PUT /objects/<name>`
    Put,
    /// `GET /objects/<name>`
    Get,
    /// `POST /stats`
    Stats,
}

#[derive(Default)]
struct LoopbackState {
    base_url: String,
    objects: HashMap<String, Bytes>,
    stats: Vec<StatsRecord>,
    requests: HashMap<Endpoint, usize>,
    failures: HashMap<Endpoint, u16>,
    latency: Duration,
}

type SharedState = Arc<Mutex<LoopbackState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, LoopbackState> {
    // A panicked handler leaves the maps consistent, so poisoning is ignored.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    resp
}

/// Local stand-in for the presign service, a storage bucket and the stats
/// collector, served from a single address.
pub struct LoopbackServer {
    state: SharedState,
    /// Main worker for the server
    main_worker: Option<task::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState::default())),
            main_worker: None,
            local_addr: None,
        }
    }

    /// Start serving on `addr`; port 0 picks a free port. Returns the bound address.
    pub async fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, hyper::Error> {
        let state = self.state.clone();
        let make_svc = make_service_fn(move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req)))
            }
        });

        let server = Server::try_bind(&addr)?.serve(make_svc);
        let local_addr = server.local_addr();
        lock(&self.state).base_url = format!("http://{}", local_addr);
        info!("Loopback endpoints listening on http://{}", local_addr);

        let handle = task::spawn(async move {
            if let Err(err) = server.await {
                error!("Loopback server error: {}", err);
            }
        });
        self.main_worker = Some(handle);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop the server.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.main_worker.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// `http://<addr>` once listening.
    pub fn base_url(&self) -> Option<String> {
        self.local_addr.map(|addr| format!("http://{}", addr))
    }

    /// URL under which an object named `name` is served.
    pub fn object_url(&self, name: &str) -> Option<String> {
        self.base_url()
            .map(|base| format!("{}/objects/{}", base, object_segment(name)))
    }

    /// Store an object so it can be downloaded.
    pub fn put_object(&self, name: &str, bytes: impl Into<Bytes>) {
        lock(&self.state)
            .objects
            .insert(name.to_string(), bytes.into());
    }

    pub fn object(&self, name: &str) -> Option<Bytes> {
        lock(&self.state).objects.get(name).cloned()
    }

    /// Stats records received so far, in arrival order.
    pub fn stats_records(&self) -> Vec<StatsRecord> {
        lock(&self.state).stats.clone()
    }

    /// Number of requests an endpoint has seen, failed ones included.
    pub fn request_count(&self, endpoint: Endpoint) -> usize {
        lock(&self.state)
            .requests
            .get(&endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Make `endpoint` answer every request with `status`.
    pub fn fail_endpoint(&self, endpoint: Endpoint, status: u16) {
        lock(&self.state).failures.insert(endpoint, status);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Delay applied before storage requests are answered.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }
}

/// Object names travel percent-encoded so any file name forms a valid URI.
fn object_segment(name: &str) -> String {
    utf8_percent_encode(name, NON_ALPHANUMERIC).to_string()
}

fn route(method: &Method, path: &str) -> Option<(Endpoint, Option<String>)> {
    match (method, path) {
        (&Method::POST, "/presign") => Some((Endpoint::Presign, None)),
        (&Method::POST, "/stats") => Some((Endpoint::Stats, None)),
        (&Method::PUT, path) | (&Method::GET, path) => {
            let segment = path.strip_prefix("/objects/")?;
            if segment.is_empty() || segment.contains('/') {
                return None;
            }
            let name = percent_decode_str(segment).decode_utf8().ok()?;
            let endpoint = if *method == Method::PUT {
                Endpoint::Put
            } else {
                Endpoint::Get
            };
            Some((endpoint, Some(name.to_string())))
        }
        _ => None,
    }
}

async fn handle(state: SharedState, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    debug!("Loopback {} {}", req.method(), req.uri());
    let Some((endpoint, name)) = route(req.method(), req.uri().path()) else {
        return Ok(respond(StatusCode::NOT_FOUND, "not found"));
    };

    // The body is always drained so clients see the status, not a reset.
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(err) => return Ok(respond(StatusCode::BAD_REQUEST, err.to_string())),
    };

    let (failure, latency) = {
        let mut state = lock(&state);
        *state.requests.entry(endpoint).or_insert(0) += 1;
        (state.failures.get(&endpoint).copied(), state.latency)
    };
    if let Some(status) = failure {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Ok(respond(status, "injected failure"));
    }

    if matches!(endpoint, Endpoint::Put | Endpoint::Get) && !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }

    let resp = match (endpoint, name) {
        (Endpoint::Presign, _) => presign(&state, &body),
        (Endpoint::Stats, _) => match StatsRecord::decode(&body) {
            Ok(record) => {
                lock(&state).stats.push(record);
                respond(StatusCode::OK, "")
            }
            Err(err) => respond(StatusCode::BAD_REQUEST, err.to_string()),
        },
        (Endpoint::Put, Some(name)) => {
            lock(&state).objects.insert(name, body);
            respond(StatusCode::OK, "")
        }
        (Endpoint::Get, Some(name)) => match lock(&state).objects.get(&name).cloned() {
            Some(object) => respond(StatusCode::OK, object),
            None => respond(StatusCode::NOT_FOUND, "no such object"),
        },
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(resp)
}

fn presign(state: &SharedState, body: &[u8]) -> Response<Body> {
    let req = match PresignRequest::decode(body) {
        Ok(req) => req,
        Err(err) => return respond(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let base_url = lock(state).base_url.clone();

    let mut data = PresignData::default();
    for name in &req.files {
        data.urls.push(format!(
            "{}/objects/{}?region={}&accelerated={}",
            base_url,
            object_segment(name),
            req.bucket_region,
            req.accelerated
        ));
        data.file_paths.push(format!("/{}", name));
    }

    match (PresignResponse { data }).encode() {
        Ok(encoded) => {
            let mut resp = respond(StatusCode::OK, encoded);
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(err) => respond(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
