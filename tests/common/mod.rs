#![allow(dead_code)]

//! Shared fixtures: an in-process upstream feed server with ETag support
//! and helpers for building the application under test.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};

use epg_viewer::config::Config;

/// One servable upstream path.
#[derive(Clone, Default)]
pub struct RouteSpec {
    pub body: Vec<u8>,
    /// When set, conditional requests matching it get a 304.
    pub etag: Option<String>,
    /// Serve this many 500s before succeeding.
    pub failures_remaining: usize,
    /// Fail requests that carry no If-None-Match header with a 500,
    /// while conditional revalidations still get their 304.
    pub fail_unconditional: bool,
}

impl RouteSpec {
    pub fn text(body: &str) -> Self {
        Self {
            body: body.as_bytes().to_vec(),
            ..Self::default()
        }
    }

    pub fn with_etag(mut self, etag: &str) -> Self {
        self.etag = Some(etag.to_string());
        self
    }

    pub fn failing_first(mut self, failures: usize) -> Self {
        self.failures_remaining = failures;
        self
    }

    pub fn failing_unconditional(mut self) -> Self {
        self.fail_unconditional = true;
        self
    }
}

#[derive(Default)]
struct Inner {
    routes: HashMap<String, RouteSpec>,
    hits: HashMap<String, usize>,
}

/// Minimal upstream standing in for playlist and EPG servers.
pub struct FeedServer {
    pub addr: SocketAddr,
    inner: Arc<Mutex<Inner>>,
}

impl FeedServer {
    pub async fn start() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let app = Router::new()
            .fallback(handler)
            .with_state(Arc::clone(&inner));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, inner }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn set(&self, path: &str, spec: RouteSpec) {
        self.inner
            .lock()
            .unwrap()
            .routes
            .insert(path.to_string(), spec);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .hits
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

async fn handler(
    State(inner): State<Arc<Mutex<Inner>>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().to_string();
    let mut guard = inner.lock().unwrap();
    *guard.hits.entry(path.clone()).or_default() += 1;
    let Some(spec) = guard.routes.get_mut(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if spec.failures_remaining > 0 {
        spec.failures_remaining -= 1;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if let Some(etag) = spec.etag.clone() {
        let matched = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == etag)
            .unwrap_or(false);
        if matched {
            return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
        }
        if spec.fail_unconditional {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        return (StatusCode::OK, [(header::ETAG, etag)], spec.body.clone()).into_response();
    }
    if spec.fail_unconditional {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (StatusCode::OK, spec.body.clone()).into_response()
}

/// Config rooted in a temporary data directory.
pub fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = data_dir.to_path_buf();
    config
}

/// A small guide fixture: one channel, one June 2024 programme.
pub const BBC_GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv generator-info-name="fixture">
  <channel id="bbc1"><display-name>BBC 1</display-name></channel>
  <programme channel="bbc1" start="20240610120000 +0100" stop="20240610130000 +0100">
    <title>News</title>
  </programme>
</tv>
"#;

pub const BBC_PLAYLIST: &str = "#EXTM3U\n#EXTINF:-1 tvg-id=\"BBC1\",BBC One\nhttp://streams.example/bbc1\n";
