//! HTTP health endpoints for container orchestration.
//!
//! - `/health/live` - the process is running
//! - `/health/ready` - the node published `SystemReady` and is not shutting down
//! - `/health/startup` - core services finished initializing
//! - `/metrics` - controller counters as JSON
//!
//! Probe state is derived entirely from controller output-bus messages, so
//! it can never disagree with the role state machine.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kel_cluster::Message;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

#[derive(Debug)]
pub struct HealthState {
    startup_complete: AtomicBool,
    ready: AtomicBool,
    alive: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            startup_complete: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn is_startup_complete(&self) -> bool {
        self.startup_complete.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn apply(&self, message: &Message) {
        match message {
            Message::SystemStart => {
                self.startup_complete.store(true, Ordering::Release);
                info!(target: "keel::health", "Startup complete");
            },
            Message::SystemReady => {
                self.ready.store(true, Ordering::Release);
                info!(target: "keel::health", "Node ready");
            },
            Message::BecomeShuttingDown { .. } => {
                self.ready.store(false, Ordering::Release);
                info!(target: "keel::health", "Node no longer ready");
            },
            Message::BecomeShutdown => {
                self.ready.store(false, Ordering::Release);
                self.alive.store(false, Ordering::Release);
            },
            _ => {},
        }
    }
}

/// Track controller output until the bus closes.
pub async fn watch_bus(state: Arc<HealthState>, mut bus: broadcast::Receiver<Message>) {
    loop {
        match bus.recv().await {
            Ok(message) => state.apply(&message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(target: "keel::health", skipped, "Health watcher lagged");
            },
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

type BoxBody = Full<Bytes>;

fn json_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn probe(ok: bool, up: &'static str, down: &'static str) -> Response<BoxBody> {
    if ok {
        json_response(StatusCode::OK, format!(r#"{{"status":"{up}"}}"#))
    } else {
        json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!(r#"{{"status":"{down}"}}"#),
        )
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<HealthState>,
) -> Result<Response<BoxBody>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health/live") => probe(state.is_alive(), "alive", "not_alive"),
        (&Method::GET, "/health/ready") => probe(state.is_ready(), "ready", "not_ready"),
        (&Method::GET, "/health/startup") => {
            probe(state.is_startup_complete(), "started", "starting")
        },
        (&Method::GET, "/metrics") => {
            let snapshot = kel_metrics::snapshot();
            let body = format!(
                r#"{{"current_role":{},"role_transitions":{},"stale_messages_dropped":{},"elections_triggered":{},"split_brain_detections":{},"writes_forwarded":{},"forward_timeouts":{},"denied_not_ready":{},"denied_not_leader":{},"denied_read_only":{},"shutdown_timeouts":{}}}"#,
                snapshot.current_role,
                snapshot.role_transitions,
                snapshot.stale_messages_dropped,
                snapshot.elections_triggered,
                snapshot.split_brain_detections,
                snapshot.writes_forwarded,
                snapshot.forward_timeouts,
                snapshot.denied_not_ready,
                snapshot.denied_not_leader,
                snapshot.denied_read_only,
                snapshot.shutdown_timeouts,
            );
            json_response(StatusCode::OK, body)
        },
        _ => json_response(StatusCode::NOT_FOUND, r#"{"error":"not_found"}"#.to_string()),
    };

    trace!(
        target: "keel::health",
        method = %req.method(),
        path = %req.uri().path(),
        status = %response.status(),
        "Health check"
    );

    Ok(response)
}

pub async fn run_health_server(
    addr: SocketAddr,
    state: Arc<HealthState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    info!(target: "keel::health", addr = %addr, "Health server listening");

    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(req, state).await }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(target: "keel::health", error = %e, "Health connection error");
                    }
                });
            },
            Err(e) => {
                error!(target: "keel::health", error = %e, "Health accept failed");
            },
        }
    }
}
