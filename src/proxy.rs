use crate::config::ServerConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::host::ConnectionGuard;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::router::{AttemptedHosts, HostRouter, RouteRequest};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Per-request proxy behaviour
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub session_cookie_names: Vec<String>,
    pub request_timeout: Duration,
    pub max_attempts: usize,
}

impl ProxySettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            session_cookie_names: config.session_cookie_names.clone(),
            request_timeout: config.request_timeout(),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

struct ProxyContext {
    router: Arc<HostRouter>,
    pool: Arc<ConnectionPool>,
    settings: ProxySettings,
}

/// The load-balancing reverse proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<HostRouter>,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    settings: ProxySettings,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<HostRouter>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, router, shutdown_rx, PoolConfig::default())
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        router: Arc<HostRouter>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
            pool: Arc::new(ConnectionPool::new(pool_config)),
            settings: ProxySettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ProxySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            selector = self.router.selector_name(),
            max_attempts = self.settings.max_attempts,
            "Proxy server listening"
        );

        let ctx = Arc::new(ProxyContext {
            router: self.router,
            pool: self.pool,
            settings: self.settings,
        });
        let mut shutdown_rx = self.shutdown_rx;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let started = Instant::now();
    let route = RouteRequest::from_parts(req.uri(), req.headers(), &ctx.settings.session_cookie_names);

    let (mut parts, body) = req.into_parts();

    let request_id = parts
        .headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| route.request_id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        parts.headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        parts.headers.insert(X_FORWARDED_FOR, value);
    }

    debug!(
        method = %parts.method,
        uri = %parts.uri,
        request_id,
        category = route.category.as_deref(),
        session_route = route.session_route.as_deref(),
        "Incoming request"
    );

    // Buffered once so a retry on another host resends the same bytes
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(request_id, error = %e, "Failed to read request body");
            return Ok(json_error_response(
                ProxyErrorCode::BadRequest,
                "Failed to read request body",
            ));
        }
    };

    let mut attempted = AttemptedHosts::new();

    for attempt in 1..=ctx.settings.max_attempts {
        let Some(host) = ctx.router.select_host(&route, &attempted) else {
            break;
        };

        let conn = host.acquire();
        let result = tokio::time::timeout(
            ctx.settings.request_timeout,
            ctx.pool.send_request(&parts, body.clone(), &host.uri),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                host.clear_problem();
                log_completion(&route, started, response.status());
                return Ok(response.map(|body| GuardedBody::new(body, conn).boxed()));
            }
            Ok(Err(e)) => {
                drop(conn);
                warn!(
                    uri = %host.uri,
                    request_id,
                    attempt,
                    error = %e,
                    "Backend failed, trying another host"
                );
                host.mark_problem();
                attempted.insert(host);
                ctx.pool.stats().record_retry();
            }
            Err(_) => {
                warn!(
                    uri = %host.uri,
                    request_id,
                    timeout_secs = ctx.settings.request_timeout.as_secs(),
                    "Request timed out"
                );
                log_completion(&route, started, StatusCode::GATEWAY_TIMEOUT);
                return Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        ctx.settings.request_timeout.as_secs()
                    ),
                ));
            }
        }
    }

    if attempted.is_empty() {
        warn!(request_id, "No backend available");
        log_completion(&route, started, StatusCode::SERVICE_UNAVAILABLE);
        Ok(json_error_response(
            ProxyErrorCode::NoBackendAvailable,
            "No backend available",
        ))
    } else {
        error!(request_id, attempts = attempted.len(), "All attempted backends failed");
        log_completion(&route, started, StatusCode::BAD_GATEWAY);
        Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Failed to connect to backend",
        ))
    }
}

/// Backend response body that keeps the host's connection slot until the
/// last frame has been sent to the client
struct GuardedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    conn: Option<ConnectionGuard>,
}

impl GuardedBody {
    fn new(inner: BoxBody<Bytes, hyper::Error>, conn: ConnectionGuard) -> Self {
        Self {
            inner,
            conn: Some(conn),
        }
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let frame = Pin::new(&mut self.inner).poll_frame(cx);
        if matches!(frame, Poll::Ready(None | Some(Err(_)))) {
            self.conn = None;
        }
        frame
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Record a classified request once it is answered
fn log_completion(route: &RouteRequest, started: Instant, status: StatusCode) {
    if let (Some(category), Some(argument), Some(id)) =
        (&route.category, &route.argument, &route.request_id)
    {
        info!(
            category = category.as_str(),
            arg = argument.as_str(),
            id = id.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            status = status.as_u16(),
            "Request completed"
        );
    }
}
