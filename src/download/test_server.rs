//! Local origin for tests: deterministic bytes with real Range semantics.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;

pub struct Origin {
    pub body: Vec<u8>,
    /// Respond 200 with the full body even when a Range is requested.
    pub ignore_range: bool,
    /// Delay between response chunks, to keep transfers observable.
    pub chunk_delay: Option<Duration>,
    pub chunk_size: usize,
}

impl Origin {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ignore_range: false,
            chunk_delay: None,
            chunk_size: 16 * 1024,
        }
    }

    pub fn slow(body: Vec<u8>, chunk_delay: Duration) -> Self {
        Self {
            chunk_delay: Some(chunk_delay),
            ..Self::new(body)
        }
    }
}

/// 512, 513, ... bytes of repeatable content
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub async fn spawn(origin: Origin) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new()
        .route("/file", any(serve_file))
        .with_state(Arc::new(origin));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}/file")
}

async fn serve_file(State(origin): State<Arc<Origin>>, request: Request) -> Response {
    let total = origin.body.len() as u64;

    if request.method() == Method::HEAD {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::empty())
            .unwrap();
    }

    if total == 0 {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, 0)
            .body(Body::empty())
            .unwrap();
    }

    let range = request
        .headers()
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_range);

    let (status, start, end) = match range {
        Some((start, end)) if !origin.ignore_range => {
            (StatusCode::PARTIAL_CONTENT, start, end.min(total - 1))
        }
        _ => (StatusCode::OK, 0, total - 1),
    };

    let slice = origin.body[start as usize..=end as usize].to_vec();
    let content_length = slice.len();

    let delay = origin.chunk_delay;
    let chunks: Vec<Bytes> = slice
        .chunks(origin.chunk_size)
        .map(Bytes::copy_from_slice)
        .collect();
    let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok::<Bytes, std::io::Error>(chunk)
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, content_length)
        .body(Body::from_stream(stream))
        .unwrap()
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}
