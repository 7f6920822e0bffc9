use crate::group::{GroupStatus, ScalingGroups};
use crate::host::{Availability, HostSpec};
use crate::router::{HostMatch, HostRouter};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

#[derive(Debug, Serialize)]
struct HostStatus {
    uri: String,
    route: Option<String>,
    instance_id: Option<String>,
    instance_type: Option<String>,
    availability: Availability,
    active_connections: usize,
}

#[derive(Debug, Serialize)]
struct PoolStatus {
    selector: &'static str,
    hosts: Vec<HostStatus>,
    groups: Vec<GroupStatus>,
}

struct AdminContext {
    router: Arc<HostRouter>,
    groups: Arc<ScalingGroups>,
    auth_token: String,
}

/// Admin API server for inspecting and editing the host pool
pub struct AdminServer {
    bind_addr: SocketAddr,
    ctx: Arc<AdminContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<HostRouter>,
        groups: Arc<ScalingGroups>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            ctx: Arc::new(AdminContext {
                router,
                groups,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, ctx).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, ctx: Arc<AdminContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move {
            Ok::<_, hyper::Error>(handle_admin_request(
                req.method(),
                req.uri(),
                req.headers(),
                &ctx,
            ))
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|q| {
            q.split('&')
                .filter_map(|pair| {
                    let (key, value) = pair.split_once('=')?;
                    let value = urlencoding::decode(value).ok()?;
                    Some((key.to_string(), value.into_owned()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn handle_admin_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    ctx: &AdminContext,
) -> Response<Full<Bytes>> {
    let path = uri.path();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/status") => {
            let snapshot = ctx.router.snapshot();
            let status = PoolStatus {
                selector: ctx.router.selector_name(),
                hosts: snapshot
                    .hosts
                    .iter()
                    .map(|h| HostStatus {
                        uri: h.uri.to_string(),
                        route: h.route_id.clone(),
                        instance_id: h.instance_id.clone(),
                        instance_type: h.instance_type.clone(),
                        availability: h.availability(),
                        active_connections: h.connections().active(),
                    })
                    .collect(),
                groups: ctx.groups.status(),
            };
            match serde_json::to_string(&status) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }

        // Register a host: POST /hosts?uri=..&route=..&type=..&instance_id=.. (auth required)
        (&Method::POST, "/hosts") => {
            if !check_auth(headers, &ctx.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            let params = query_params(uri);
            let Some(host_uri) = params.get("uri").and_then(|u| u.parse::<Uri>().ok()) else {
                return response(StatusCode::BAD_REQUEST, "missing or invalid uri");
            };

            let mut spec = HostSpec::new(host_uri);
            if let Some(route) = params.get("route") {
                spec = spec.with_route(route);
            }
            if let Some(instance_type) = params.get("type") {
                spec = spec.with_instance_type(instance_type);
            }
            if let Some(instance_id) = params.get("instance_id") {
                spec = spec.with_instance_id(instance_id);
            }

            let host = ctx.router.add_host(spec);
            let body = serde_json::json!({
                "uri": host.uri.to_string(),
                "route": host.route_id,
                "hosts": ctx.router.len(),
            });
            json_response(StatusCode::CREATED, body.to_string())
        }

        // Deregister a host: DELETE /hosts?uri=.. or ?instance_id=.. (auth required)
        (&Method::DELETE, "/hosts") => {
            if !check_auth(headers, &ctx.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            let params = query_params(uri);
            let host_uri = params.get("uri").and_then(|u| u.parse::<Uri>().ok());
            let instance_id = params.get("instance_id").cloned();

            match HostMatch::from_parts(host_uri, instance_id) {
                None => response(StatusCode::BAD_REQUEST, "missing uri or instance_id"),
                Some(key) => match ctx.router.remove_host(&key) {
                    Some(host) => {
                        let body = serde_json::json!({
                            "removed": host.uri.to_string(),
                            "hosts": ctx.router.len(),
                        });
                        json_response(StatusCode::OK, body.to_string())
                    }
                    None => response(StatusCode::NOT_FOUND, "no matching host"),
                },
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostLimits;
    use crate::selector::RoundRobinSelector;

    fn context() -> AdminContext {
        let router = HostRouter::new(Arc::new(RoundRobinSelector::new()), HostLimits::default());
        let groups = Arc::new(ScalingGroups::new(&[], Arc::clone(&router), None));
        AdminContext {
            router,
            groups,
            auth_token: "secret".to_string(),
        }
    }

    fn authed() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer secret".parse().unwrap());
        headers
    }

    #[test]
    fn test_health_needs_no_auth() {
        let ctx = context();
        let resp = handle_admin_request(&Method::GET, &"/health".parse().unwrap(), &HeaderMap::new(), &ctx);
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_writes_need_auth() {
        let ctx = context();
        let uri: Uri = "/hosts?uri=http%3A%2F%2F10.0.0.1%3A8080".parse().unwrap();
        let resp = handle_admin_request(&Method::POST, &uri, &HeaderMap::new(), &ctx);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(ctx.router.is_empty());
    }

    #[test]
    fn test_add_and_remove_host() {
        let ctx = context();
        let add: Uri = "/hosts?uri=http%3A%2F%2F10.0.0.1%3A8080&route=r1&type=m4.large&instance_id=i-1"
            .parse()
            .unwrap();
        let resp = handle_admin_request(&Method::POST, &add, &authed(), &ctx);
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(ctx.router.len(), 1);
        assert!(ctx.router.snapshot().route("r1").is_some());

        let remove: Uri = "/hosts?uri=http%3A%2F%2F10.9.9.9%3A8080&instance_id=i-1".parse().unwrap();
        let resp = handle_admin_request(&Method::DELETE, &remove, &authed(), &ctx);
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(ctx.router.is_empty());

        let resp = handle_admin_request(&Method::DELETE, &remove, &authed(), &ctx);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_add_requires_uri() {
        let ctx = context();
        let resp = handle_admin_request(&Method::POST, &"/hosts".parse().unwrap(), &authed(), &ctx);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status() {
        let ctx = context();
        ctx.router
            .add_host(HostSpec::new("http://10.0.0.1:8080".parse().unwrap()).with_route("r1"));
        let resp = handle_admin_request(&Method::GET, &"/status".parse().unwrap(), &HeaderMap::new(), &ctx);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_query_params() {
        let params = query_params(&"/hosts?uri=a%20b&flag&route=r".parse().unwrap());
        assert_eq!(params.get("uri").unwrap(), "a b");
        assert_eq!(params.get("route").unwrap(), "r");
        assert!(!params.contains_key("flag"));
    }
}
