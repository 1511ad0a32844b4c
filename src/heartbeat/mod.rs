use crate::agent::Registry;
use crate::tracker::Tracker;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Heartbeat bodies beyond this are rejected
const MAX_BODY_BYTES: usize = 8 * 1024;

/// Bounded wait for in-flight requests on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Heartbeat body. Endpoint agents differ on key names, so both spellings of
/// each field are accepted.
#[derive(Debug, Default, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    machine: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    user: String,
}

impl HeartbeatRequest {
    fn identity(&self) -> (&str, &str) {
        let machine = if self.hostname.trim().is_empty() {
            self.machine.trim()
        } else {
            self.hostname.trim()
        };
        let username = if self.username.trim().is_empty() {
            self.user.trim()
        } else {
            self.username.trim()
        };
        (machine, username)
    }
}

/// Small HTTP surface receiving endpoint-agent heartbeats.
///
/// Each successful heartbeat refreshes the agent registry and forwards the
/// identity to the activity tracker (which ignores IPs without traffic).
pub struct HeartbeatServer {
    registry: Arc<Registry>,
    tracker: Arc<Tracker>,
}

impl HeartbeatServer {
    pub fn new(registry: Arc<Registry>, tracker: Arc<Tracker>) -> Self {
        Self { registry, tracker }
    }

    /// Serves connections until shutdown, then drains in-flight requests for
    /// a bounded few seconds.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!("heartbeat endpoint listening on http://{}", addr);
        }

        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("heartbeat accept error: {}", e);
                            continue;
                        }
                    };

                    let server = Arc::clone(&self);
                    conns.spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let server = Arc::clone(&server);
                            async move {
                                Ok::<_, Infallible>(server.handle(req, peer).await)
                            }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("heartbeat connection error from {}: {}", peer, e);
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }

        drop(listener);
        let drain = async {
            while conns.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(
                "heartbeat drain timed out, aborting {} connections",
                conns.len()
            );
            conns.abort_all();
        }
    }

    async fn handle<B>(&self, req: Request<B>, peer: SocketAddr) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/healthz") => text(StatusCode::OK, "ok\n"),
            (&Method::POST, "/api/v1/agent/heartbeat") => self.heartbeat(req, peer).await,
            (_, "/api/v1/agent/heartbeat") => {
                let mut resp = text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
                resp.headers_mut()
                    .insert(ALLOW, HeaderValue::from_static("POST"));
                resp
            }
            _ => text(StatusCode::NOT_FOUND, "not found\n"),
        }
    }

    async fn heartbeat<B>(&self, req: Request<B>, peer: SocketAddr) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return text(StatusCode::BAD_REQUEST, "read body failed\n"),
        };

        let beat: HeartbeatRequest = match serde_json::from_slice(&body) {
            Ok(beat) => beat,
            Err(_) => return text(StatusCode::BAD_REQUEST, "invalid json\n"),
        };
        let (machine, username) = beat.identity();

        let src_ip = peer.ip().to_string();
        let now = Utc::now();
        self.registry.update(&src_ip, machine, username, now);
        self.tracker.set_identity(&src_ip, machine, username, now);
        debug!(
            "heartbeat from {}: machine={:?} username={:?}",
            src_ip, machine, username
        );

        let mut resp = Response::new(Full::new(Bytes::from_static(b"{\"ok\":true}\n")));
        resp.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        resp
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
