//! HTTP server setup and the forwarding engine.
//!
//! # Responsibilities
//! - Create the Axum router with a single catch-all proxy handler
//! - Observe request line, header blocks and bodies of every exchange
//! - Forward requests to the upstream target unmodified, streaming
//! - Fail bodies that stall for longer than the idle timeout
//! - Decode long-polling bodies into packets once they are complete
//! - Hand WebSocket upgrades to the upgrade relay
//! - Map upstream failures to gateway statuses without touching other
//!   connections

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request, Uri},
    response::{IntoResponse, Response},
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::capture::{CaptureLabel, CaptureRecord, EmitPolicy, HeaderBlock, ObservedBody};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::idle::IdleTimeoutBody;
use crate::http::polling::{carries_packets, is_polling_request, PollingTap};
use crate::http::websocket;
use crate::net::ExchangeId;
use crate::observability::{Observation, Observer, Side, TracingSink};
use crate::protocol::polling::{PollingSessions, DEFAULT_SESSION_LIMIT};
use crate::protocol::Direction;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub client: Client<HttpConnector, Body>,
    pub observer: Observer,
    pub polling: PollingSessions,
}

impl AppState {
    fn capture_record(&self, label: CaptureLabel) -> CaptureRecord {
        CaptureRecord::new(label, self.config.capture.max_bytes)
    }

    /// Packet decoding for one body of a polling exchange, if it has any.
    fn polling_tap(
        &self,
        exchange: ExchangeId,
        method: &Method,
        uri: &Uri,
        direction: Direction,
    ) -> Option<PollingTap> {
        (is_polling_request(&self.config, uri) && carries_packets(method, direction)).then(|| {
            PollingTap::new(
                exchange,
                direction,
                uri,
                self.observer.clone(),
                self.polling.clone(),
            )
        })
    }
}

/// HTTP server for the observing proxy.
pub struct HttpServer {
    router: Router,
    config: Arc<ProxyConfig>,
}

impl HttpServer {
    /// Create a server whose captures go to the `tracing` output.
    ///
    /// Must be called inside a Tokio runtime when capture is enabled.
    pub fn new(config: ProxyConfig) -> Self {
        let observer = if config.capture.enabled {
            Observer::spawn(TracingSink, config.capture.queue_capacity)
        } else {
            Observer::disabled()
        };
        Self::with_observer(config, observer)
    }

    /// Create a server reporting to the given observer.
    pub fn with_observer(config: ProxyConfig, observer: Observer) -> Self {
        let observer = if config.capture.enabled {
            observer
        } else {
            Observer::disabled()
        };

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.timeouts.connect_secs)));
        connector.set_nodelay(true);

        // One upstream connection per exchange; no idle pool.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        let polling =
            PollingSessions::new(DEFAULT_SESSION_LIMIT, config.capture.max_pending_acks);
        let config = Arc::new(config);
        let state = AppState {
            config: Arc::clone(&config),
            client,
            observer,
            polling,
        };

        let router = Self::build_router(state);
        Self { router, config }
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve connections from `listener` until `shutdown` fires.
    ///
    /// Returns as soon as the signal arrives; exchanges still in flight are
    /// abandoned. If every shutdown sender is dropped the server runs until
    /// the process exits.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstream = %self.config.upstream.authority(),
            capture = self.config.capture.enabled,
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        tokio::select! {
            result = axum::serve(listener, app).into_future() => result?,
            _ = shutdown_requested(&mut shutdown) => {
                tracing::info!("Shutdown signal received");
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Resolves once shutdown is triggered. A closed channel never resolves.
async fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) {
    if let Err(broadcast::error::RecvError::Closed) = shutdown.recv().await {
        std::future::pending::<()>().await;
    }
}

/// Methods whose request body is captured.
pub fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Rewrite an inbound target onto the upstream authority.
pub fn upstream_uri(config: &ProxyConfig, original: &Uri) -> Result<Uri, ProxyError> {
    let path = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("http://{}{}", config.upstream.authority(), path);
    target
        .parse()
        .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", target, e)))
}

/// Catch-all handler: one exchange per call.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let exchange = ExchangeId::new();
    let method = request.method().clone();
    let uri = request.uri().clone();

    tracing::info!(
        exchange = %exchange,
        peer = %peer,
        method = %method,
        uri = %uri,
        "Proxying request"
    );

    if state.observer.is_enabled() {
        state.observer.emit(Observation::Request {
            exchange,
            method: method.to_string(),
            uri: uri.to_string(),
        });
        state.observer.emit(Observation::Headers {
            exchange,
            side: Side::Request,
            block: HeaderBlock::from_headers(request.headers()),
        });
    }

    let result = if websocket::is_upgrade_request(request.headers()) {
        websocket::proxy_upgrade(state.clone(), exchange, request).await
    } else {
        forward(&state, exchange, request).await
    };

    match result {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(
                exchange = %exchange,
                method = %method,
                uri = %uri,
                error = %err,
                "Exchange failed"
            );
            state.observer.emit(Observation::Failure {
                exchange,
                reason: err.to_string(),
            });
            err.into_response()
        }
    }
}

/// Forward one plain request/response exchange.
async fn forward(
    state: &AppState,
    exchange: ExchangeId,
    request: Request<Body>,
) -> Result<Response, ProxyError> {
    let observing = state.observer.is_enabled();
    let (mut parts, body) = request.into_parts();
    let method = parts.method.clone();
    let original_uri = parts.uri.clone();
    parts.uri = upstream_uri(&state.config, &parts.uri)?;

    let idle = Duration::from_secs(state.config.timeouts.idle_secs);
    let body = IdleTimeoutBody::new(body, idle);
    let body = if observing && carries_body(&method) {
        let observed = ObservedBody::new(
            body,
            state.capture_record(CaptureLabel::RequestBody),
            EmitPolicy::OnEnd,
            state.observer.clone(),
            exchange,
        );
        let tap = state.polling_tap(exchange, &method, &original_uri, Direction::ClientToUpstream);
        match tap {
            Some(tap) => Body::new(observed.with_inspector(move |bytes| tap.inspect(bytes))),
            None => Body::new(observed),
        }
    } else {
        Body::new(body)
    };

    let request_secs = state.config.timeouts.request_secs;
    let response = tokio::time::timeout(
        Duration::from_secs(request_secs),
        state.client.request(Request::from_parts(parts, body)),
    )
    .await
    .map_err(|_| ProxyError::Timeout(request_secs))??;

    let (parts, body) = response.into_parts();

    tracing::info!(
        exchange = %exchange,
        status = %parts.status,
        "Upstream responded"
    );

    let body = IdleTimeoutBody::new(Body::new(body), idle);
    let body = if observing {
        state.observer.emit(Observation::Status {
            exchange,
            status: parts.status,
        });
        state.observer.emit(Observation::Headers {
            exchange,
            side: Side::Response,
            block: HeaderBlock::from_headers(&parts.headers),
        });
        let observed = ObservedBody::new(
            body,
            state.capture_record(CaptureLabel::ResponseBody),
            EmitPolicy::EachChunk,
            state.observer.clone(),
            exchange,
        );
        let tap = state.polling_tap(exchange, &method, &original_uri, Direction::UpstreamToClient);
        match tap {
            Some(tap) => Body::new(observed.with_inspector(move |bytes| tap.inspect(bytes))),
            None => Body::new(observed),
        }
    } else {
        Body::new(body)
    };

    Ok(Response::from_parts(parts, body))
}
