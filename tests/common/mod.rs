#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mediafetch::{
    subscriber, DirCacheStore, DownloadEvent, DownloadRegistry, EngineConfig, LocalFileStore, Subscriber,
};

/// How the test origin behaves.
#[derive(Clone)]
pub struct Origin {
    pub body: Bytes,
    pub supports_ranges: bool,
    pub missing: bool,
    /// Status returned for the ranged GET starting at this offset.
    pub fail_range_start: Option<(u64, u16)>,
    /// Bodies are streamed in `piece`-sized parts, each after `delay`.
    pub piece: usize,
    pub delay: Option<Duration>,
    /// Delay before answering the `bytes=0-0` range check.
    pub range_check_delay: Option<Duration>,
}

impl Origin {
    pub fn new(body: Bytes) -> Self {
        Self {
            body,
            supports_ranges: true,
            missing: false,
            fail_range_start: None,
            piece: 16 * 1024,
            delay: None,
            range_check_delay: None,
        }
    }

    pub fn slow(mut self, delay_ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(delay_ms));
        self
    }
}

#[derive(Default)]
pub struct Counters {
    pub range_checks: AtomicUsize,
    pub ranged: AtomicUsize,
    pub full: AtomicUsize,
}

impl Counters {
    pub fn range_checks(&self) -> usize {
        self.range_checks.load(Ordering::SeqCst)
    }

    pub fn ranged(&self) -> usize {
        self.ranged.load(Ordering::SeqCst)
    }

    pub fn full(&self) -> usize {
        self.full.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.range_checks() + self.ranged() + self.full()
    }
}

struct ServerState {
    origin: Origin,
    counters: Arc<Counters>,
}

pub struct TestServer {
    addr: SocketAddr,
    pub counters: Arc<Counters>,
}

impl TestServer {
    pub async fn start(origin: Origin) -> Self {
        let counters = Arc::new(Counters::default());
        let state = Arc::new(ServerState {
            origin,
            counters: counters.clone(),
        });
        let app = Router::new().route("/*path", get(serve)).with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, counters }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }
}

fn parse_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn streamed(status: StatusCode, data: Bytes, origin: &Origin, extra: Option<(header::HeaderName, String)>) -> Response {
    let len = data.len();
    let body = match origin.delay {
        Some(delay) => {
            let piece = origin.piece.max(1);
            let parts: Vec<Bytes> = (0..len).step_by(piece).map(|at| data.slice(at..(at + piece).min(len))).collect();
            Body::from_stream(futures::stream::iter(parts).then(move |part| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, Infallible>(part)
            }))
        }
        None => Body::from(data),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len as u64));
    if origin.supports_ranges {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    if let Some((name, value)) = extra {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    response
}

async fn serve(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let origin = &state.origin;
    let counters = &state.counters;
    let range = parse_range(&headers);

    match range {
        Some((0, 0)) => {
            counters.range_checks.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = origin.range_check_delay {
                tokio::time::sleep(delay).await;
            }
        }
        Some(_) if origin.supports_ranges => {
            counters.ranged.fetch_add(1, Ordering::SeqCst);
        }
        _ => {
            counters.full.fetch_add(1, Ordering::SeqCst);
        }
    }

    if origin.missing {
        return StatusCode::NOT_FOUND.into_response();
    }

    let total = origin.body.len() as u64;
    match range {
        Some((start, end)) if origin.supports_ranges => {
            if let Some((failing, status)) = origin.fail_range_start {
                if failing == start {
                    return StatusCode::from_u16(status)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                        .into_response();
                }
            }
            if start >= total {
                let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                return response;
            }
            let end = end.min(total - 1);
            let data = origin.body.slice(start as usize..=end as usize);
            streamed(
                StatusCode::PARTIAL_CONTENT,
                data,
                origin,
                Some((header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))),
            )
        }
        _ => streamed(StatusCode::OK, origin.body.clone(), origin, None),
    }
}

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>().into()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        worker_threads: 8,
        buffer_size: 16 * 1024,
        probe_timeout_ms: 1000,
        read_timeout_ms: 5000,
        ..EngineConfig::default()
    }
}

pub fn registry(dir: &Path, config: EngineConfig) -> DownloadRegistry {
    DownloadRegistry::new(config, Arc::new(DirCacheStore::new(dir)), Arc::new(LocalFileStore))
}

pub type EventLog = Arc<Mutex<Vec<DownloadEvent>>>;

/// A subscriber that records every event it sees.
pub fn recorder() -> (Subscriber, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(vec![]));
    let sink = log.clone();
    (subscriber(move |event| sink.lock().push(event.clone())), log)
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => vec![],
    }
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
