//! HTTP harness.
//!
//! Serves a static page at `/` and an event stream at `/ping` on every
//! registered listener. Accept loops stop when the drain controller closes
//! the accept path; open connections are then shut down gracefully and
//! event streams run until they finish or are force-closed.

mod sse;

pub use sse::{encode_event, StreamEnd};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use baton_common::GenerationId;
use baton_config::StreamConfig;

use crate::drain::DrainController;

/// Response body shared by every route
pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Request headers must be complete within this window
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest accepted request head
pub const MAX_HEADER_BYTES: usize = 1024 * 1024;

/// Pause after a failed accept, e.g. when out of descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const GENERATION_HEADER: HeaderName = HeaderName::from_static("x-baton-generation");

const INDEX_PAGE: &str = include_str!("harness/index.html");

/// Harness settings
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub generation: GenerationId,
    pub stream_interval: Duration,
    pub release_tag: Option<String>,
    pub index_page: Bytes,
}

impl HarnessConfig {
    pub fn new(generation: GenerationId) -> Self {
        Self {
            generation,
            stream_interval: Duration::from_secs(1),
            release_tag: None,
            index_page: Bytes::from_static(INDEX_PAGE.as_bytes()),
        }
    }

    /// Build from configuration, reading the index file if one is set.
    ///
    /// An unreadable index file falls back to the embedded page.
    pub fn from_stream_config(config: &StreamConfig, generation: GenerationId) -> Self {
        let index_page = match &config.index_file {
            Some(path) => match std::fs::read(path) {
                Ok(page) => {
                    debug!(path = %path.display(), bytes = page.len(), "Loaded index page");
                    Bytes::from(page)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read index file, serving embedded page");
                    Bytes::from_static(INDEX_PAGE.as_bytes())
                }
            },
            None => Bytes::from_static(INDEX_PAGE.as_bytes()),
        };

        Self {
            generation,
            stream_interval: config.interval(),
            release_tag: config.release_tag.clone(),
            index_page,
        }
    }
}

/// HTTP harness serving one generation
pub struct HttpHarness {
    config: HarnessConfig,
    drain: Arc<DrainController>,
    accept_loops: TaskTracker,
    connections: TaskTracker,
}

impl HttpHarness {
    pub fn new(config: HarnessConfig, drain: Arc<DrainController>) -> Arc<Self> {
        debug!(
            generation = %config.generation,
            stream_interval_ms = config.stream_interval.as_millis(),
            "Creating HTTP harness"
        );
        Arc::new(Self {
            config,
            drain,
            accept_loops: TaskTracker::new(),
            connections: TaskTracker::new(),
        })
    }

    /// Start accepting on `listener` until the accept path closes
    pub fn serve(self: &Arc<Self>, name: &str, listener: std::net::TcpListener) -> std::io::Result<SocketAddr> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let addr = listener.local_addr()?;

        let harness = Arc::clone(self);
        let name = name.to_string();
        self.accept_loops.spawn(harness.accept_loop(name, addr, listener));
        Ok(addr)
    }

    /// Open HTTP connections, streaming or not
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Wait until accept loops stopped and every connection finished
    pub async fn wait_idle(&self) {
        self.accept_loops.close();
        self.accept_loops.wait().await;
        self.connections.close();
        self.connections.wait().await;
    }

    async fn accept_loop(self: Arc<Self>, name: String, addr: SocketAddr, listener: TcpListener) {
        let shutdown = self.drain.accept_token();
        info!(listener = %name, address = %addr, "Accepting connections");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let harness = Arc::clone(&self);
                        self.connections.spawn(harness.serve_connection(stream, peer));
                    }
                    Err(e) => {
                        error!(listener = %name, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        info!(listener = %name, address = %addr, "Stopped accepting connections");
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        trace!(peer = %peer, "Connection accepted");
        let force_close = CancellationToken::new();

        let harness = Arc::clone(&self);
        let token = force_close.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let response = harness.route(&req, &token);
            async move { Ok::<_, Infallible>(response) }
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .max_buf_size(MAX_HEADER_BYTES)
            .keep_alive(true);
        let connection = builder.serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);

        let shutdown = self.drain.accept_token();
        let mut shutting_down = false;
        loop {
            tokio::select! {
                result = connection.as_mut() => {
                    if let Err(e) = result {
                        debug!(peer = %peer, error = %e, "Connection ended with error");
                    }
                    break;
                }
                _ = shutdown.cancelled(), if !shutting_down => {
                    connection.as_mut().graceful_shutdown();
                    shutting_down = true;
                }
                _ = force_close.cancelled() => {
                    debug!(peer = %peer, "Connection force-closed");
                    break;
                }
            }
        }

        trace!(peer = %peer, "Connection closed");
    }

    fn route(&self, req: &Request<Incoming>, connection: &CancellationToken) -> Response<ResponseBody> {
        let started = Instant::now();
        let path = req.uri().path();

        let response = match (req.method(), path) {
            (&Method::OPTIONS, _) => self.preflight(),
            (&Method::GET | &Method::HEAD, "/") => self.index(),
            (&Method::GET, "/ping") => self.ping(connection),
            (_, "/" | "/ping") => self.plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n"),
            _ => self.plain(StatusCode::NOT_FOUND, "not found\n"),
        };

        debug!(
            method = %req.method(),
            path = %path,
            status = response.status().as_u16(),
            elapsed_us = started.elapsed().as_micros(),
            "Handled request"
        );
        response
    }

    fn index(&self) -> Response<ResponseBody> {
        let mut response = self.respond(StatusCode::OK, Full::new(self.config.index_page.clone()).boxed_unsync());
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    }

    fn ping(&self, connection: &CancellationToken) -> Response<ResponseBody> {
        let tracked = self.drain.track(connection.clone());
        debug!(connection = %tracked.id(), "Event stream opened");

        let body = sse::event_stream(
            tracked,
            self.config.stream_interval,
            self.config.release_tag.clone(),
        );
        let mut response = self.respond(StatusCode::OK, body);
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );
        response
    }

    fn preflight(&self) -> Response<ResponseBody> {
        let mut response = self.respond(StatusCode::NO_CONTENT, Empty::<Bytes>::new().boxed_unsync());
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, HEAD, OPTIONS"),
        );
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
        response
    }

    fn plain(&self, status: StatusCode, text: &'static str) -> Response<ResponseBody> {
        let mut response = self.respond(status, Full::new(Bytes::from_static(text.as_bytes())).boxed_unsync());
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if status == StatusCode::METHOD_NOT_ALLOWED {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD, OPTIONS"));
        }
        response
    }

    /// Response carrying the headers every route shares
    fn respond(&self, status: StatusCode, body: ResponseBody) -> Response<ResponseBody> {
        let mut response = Response::new(body);
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(
            GENERATION_HEADER,
            HeaderValue::from(self.config.generation.as_u64()),
        );
        response
    }
}
