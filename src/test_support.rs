//! Local HTTP fixture used by the worker and task tests.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;

/// Deterministic, non-repeating-looking test payload.
pub(crate) fn sample_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 251) as u8).collect()
}

#[derive(Debug, Clone)]
pub(crate) struct FixtureOptions {
    /// Answer `Range` requests with `206` and the requested slice.
    pub honor_range: bool,
    /// Report `Content-Length` on `HEAD`.
    pub advertise_length: bool,
    /// Send everything from the range start to EOF, ignoring the range end.
    pub overdeliver: bool,
    pub chunk_size: usize,
    /// Pause before every body chunk.
    pub chunk_delay: Duration,
    /// Number of initial GETs answered with `503`.
    pub fail_first: usize,
    /// Number of GETs (after the failing ones) cut off halfway.
    pub truncate_first: usize,
    /// Answer every GET with this status.
    pub status: Option<StatusCode>,
}

impl FixtureOptions {
    pub fn ranged() -> Self {
        Self {
            honor_range: true,
            advertise_length: true,
            overdeliver: false,
            chunk_size: 1024,
            chunk_delay: Duration::ZERO,
            fail_first: 0,
            truncate_first: 0,
            status: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RequestLog {
    pub method: Method,
    pub range: Option<String>,
}

struct Fixture {
    body: Bytes,
    options: FixtureOptions,
    gets: AtomicUsize,
    requests: Mutex<Vec<RequestLog>>,
}

impl Fixture {
    fn log(&self, method: Method, range: Option<String>) {
        self.requests
            .lock()
            .unwrap()
            .push(RequestLog { method, range });
    }
}

pub(crate) struct FixtureServer {
    pub url: String,
    fixture: Arc<Fixture>,
}

impl FixtureServer {
    pub async fn start(body: Vec<u8>, options: FixtureOptions) -> Self {
        let fixture = Arc::new(Fixture {
            body: Bytes::from(body),
            options,
            gets: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/file.bin", get(serve_get).head(serve_head))
            .with_state(fixture.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/file.bin"),
            fixture,
        }
    }

    /// GET requests seen so far, in arrival order.
    pub fn requests(&self) -> Vec<RequestLog> {
        self.fixture
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == Method::GET)
            .cloned()
            .collect()
    }
}

async fn serve_head(State(fixture): State<Arc<Fixture>>) -> Response {
    fixture.log(Method::HEAD, None);
    let mut response = Response::builder().status(StatusCode::OK);
    if fixture.options.advertise_length {
        response = response.header(header::CONTENT_LENGTH, fixture.body.len());
    }
    if fixture.options.honor_range {
        response = response.header(header::ACCEPT_RANGES, "bytes");
    }
    response.body(Body::empty()).unwrap()
}

async fn serve_get(State(fixture): State<Arc<Fixture>>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let n = fixture.gets.fetch_add(1, Ordering::SeqCst);
    fixture.log(Method::GET, range.clone());

    let options = &fixture.options;
    if let Some(status) = options.status {
        return status.into_response();
    }
    if n < options.fail_first {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let total = fixture.body.len() as u64;
    let requested = range.as_deref().and_then(|r| parse_range(r, total));
    let (status, start, end) = match requested {
        Some(Requested::Unsatisfiable) if options.honor_range => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{total}"))
                .body(Body::empty())
                .unwrap();
        }
        Some(Requested::Slice(start, end)) if options.honor_range => {
            let end = if options.overdeliver { total - 1 } else { end };
            (StatusCode::PARTIAL_CONTENT, start, end)
        }
        _ => (StatusCode::OK, 0, total.saturating_sub(1)),
    };

    let mut slice = if total == 0 {
        Bytes::new()
    } else {
        fixture.body.slice(start as usize..=end as usize)
    };
    if n < options.fail_first.saturating_add(options.truncate_first) {
        slice = slice.slice(..slice.len() / 2);
    }

    let mut response = Response::builder().status(status);
    if options.honor_range {
        response = response.header(header::ACCEPT_RANGES, "bytes");
    }
    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{total}"),
        );
    }
    response
        .body(chunked_body(slice, options.chunk_size, options.chunk_delay))
        .unwrap()
}

enum Requested {
    Slice(u64, u64),
    Unsatisfiable,
}

fn parse_range(value: &str, total: u64) -> Option<Requested> {
    let bounds = value.strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };
    if end.is_some_and(|end| end < start) {
        return None;
    }

    // A first byte at or past the end cannot be served.
    let Some(last) = total.checked_sub(1).filter(|&last| start <= last) else {
        return Some(Requested::Unsatisfiable);
    };
    Some(Requested::Slice(start, end.map_or(last, |end| end.min(last))))
}

/// Streams the data without a length so truncation looks like a clean EOF.
fn chunked_body(data: Bytes, chunk_size: usize, delay: Duration) -> Body {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(chunk_size)
        .map(|i| data.slice(i..(i + chunk_size).min(data.len())))
        .collect();

    let stream = futures::stream::iter(chunks).then(move |chunk| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, Infallible>(chunk)
    });
    Body::from_stream(stream)
}
