//! Routable backend hosts and their capacity state
//!
//! A [`Host`] is immutable once built; the only thing that changes over its
//! lifetime is the connection gauge that drives [`Availability`].

use hyper::http::uri::InvalidUri;
use hyper::Uri;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A host's current capacity to accept a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Availability {
    Available,
    /// At the connection limit but still queueing
    Full,
    /// Queue exhausted as well
    FullQueue,
    /// Recently failed; retried once the problem window elapses
    Problem,
    /// Removed from the pool
    Closed,
}

/// Connection limits shared by every host in a pool
#[derive(Debug, Clone, Copy)]
pub struct HostLimits {
    pub max_connections: usize,
    pub max_queue_size: usize,
    pub problem_retry: Duration,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            max_connections: 30,
            max_queue_size: 24,
            problem_retry: Duration::from_secs(10),
        }
    }
}

/// Live connection accounting for one host
#[derive(Debug)]
pub struct HostConnections {
    active: AtomicUsize,
    problem_since: Mutex<Option<Instant>>,
    closed: AtomicBool,
    limits: HostLimits,
}

impl HostConnections {
    fn new(limits: HostLimits) -> Self {
        Self {
            active: AtomicUsize::new(0),
            problem_since: Mutex::new(None),
            closed: AtomicBool::new(false),
            limits,
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Everything needed to register a host with the router
#[derive(Debug, Clone)]
pub struct HostSpec {
    pub uri: Uri,
    pub route_id: Option<String>,
    pub instance_id: Option<String>,
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
}

impl HostSpec {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            route_id: None,
            instance_id: None,
            image_id: None,
            instance_type: None,
        }
    }

    pub fn with_route(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = Some(instance_type.into());
        self
    }
}

/// One routable backend entry in the live pool
#[derive(Debug)]
pub struct Host {
    pub uri: Uri,
    pub route_id: Option<String>,
    pub instance_id: Option<String>,
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
    connections: HostConnections,
}

impl Host {
    pub fn new(spec: HostSpec, limits: HostLimits) -> Arc<Self> {
        Arc::new(Self {
            uri: spec.uri,
            route_id: spec.route_id,
            instance_id: spec.instance_id,
            image_id: spec.image_id,
            instance_type: spec.instance_type,
            connections: HostConnections::new(limits),
        })
    }

    pub fn connections(&self) -> &HostConnections {
        &self.connections
    }

    /// Classify the host's capacity right now
    pub fn availability(&self) -> Availability {
        let conns = &self.connections;
        if conns.closed.load(Ordering::Acquire) {
            return Availability::Closed;
        }

        {
            let mut problem = conns.problem_since.lock();
            if let Some(since) = *problem {
                if since.elapsed() < conns.limits.problem_retry {
                    return Availability::Problem;
                }
                *problem = None;
            }
        }

        let active = conns.active();
        if active < conns.limits.max_connections {
            Availability::Available
        } else if active - conns.limits.max_connections < conns.limits.max_queue_size {
            Availability::Full
        } else {
            Availability::FullQueue
        }
    }

    /// Count a connection against this host until the guard is dropped
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            host: Arc::clone(self),
        }
    }

    /// Flag a forwarding failure; the host reports `Problem` for the retry window
    pub fn mark_problem(&self) {
        *self.connections.problem_since.lock() = Some(Instant::now());
    }

    pub fn clear_problem(&self) {
        *self.connections.problem_since.lock() = None;
    }

    /// Called when the host leaves the pool. Its idle backend connections
    /// stay in the shared client until the pool's idle timeout.
    pub fn close(&self) {
        self.connections.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.connections.closed.load(Ordering::Acquire)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// Holds one active connection slot on a host
#[derive(Debug)]
pub struct ConnectionGuard {
    host: Arc<Host>,
}

impl ConnectionGuard {
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.host.connections.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Turn a member address into a routable URI.
///
/// Addresses that already carry a scheme are used as given; bare addresses
/// become `http://<address>:<port>`.
pub fn host_uri(address: &str, port: u16) -> Result<Uri, InvalidUri> {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.parse()
    } else {
        format!("http://{}:{}", address, port).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_connections: usize, max_queue_size: usize) -> HostLimits {
        HostLimits {
            max_connections,
            max_queue_size,
            problem_retry: Duration::from_secs(10),
        }
    }

    fn host(limits: HostLimits) -> Arc<Host> {
        Host::new(
            HostSpec::new(Uri::from_static("http://10.0.0.1:8080")),
            limits,
        )
    }

    #[test]
    fn test_availability_follows_connection_count() {
        let host = host(limits(2, 1));
        assert_eq!(host.availability(), Availability::Available);

        let _a = host.acquire();
        let _b = host.acquire();
        assert_eq!(host.availability(), Availability::Full);

        let c = host.acquire();
        assert_eq!(host.availability(), Availability::FullQueue);

        drop(c);
        assert_eq!(host.availability(), Availability::Full);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let host = host(HostLimits::default());
        {
            let guard = host.acquire();
            assert_eq!(host.connections().active(), 1);
            assert_eq!(guard.host().uri, host.uri);
        }
        assert_eq!(host.connections().active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_problem_window_expires() {
        let host = host(HostLimits::default());
        host.mark_problem();
        assert_eq!(host.availability(), Availability::Problem);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(host.availability(), Availability::Available);
    }

    #[test]
    fn test_clear_problem() {
        let host = host(HostLimits::default());
        host.mark_problem();
        host.clear_problem();
        assert_eq!(host.availability(), Availability::Available);
    }

    #[test]
    fn test_closed_wins() {
        let host = host(HostLimits::default());
        host.mark_problem();
        host.close();
        assert!(host.is_closed());
        assert_eq!(host.availability(), Availability::Closed);
    }

    #[test]
    fn test_host_spec_builder() {
        let spec = HostSpec::new(Uri::from_static("http://10.0.0.2:8080"))
            .with_route("r2")
            .with_instance_id("i-2")
            .with_image_id("ami-1")
            .with_instance_type("m4.large");
        let host = Host::new(spec, HostLimits::default());
        assert_eq!(host.route_id.as_deref(), Some("r2"));
        assert_eq!(host.instance_id.as_deref(), Some("i-2"));
        assert_eq!(host.image_id.as_deref(), Some("ami-1"));
        assert_eq!(host.instance_type.as_deref(), Some("m4.large"));
        assert_eq!(host.to_string(), "http://10.0.0.2:8080/");
    }

    #[test]
    fn test_host_uri() {
        assert_eq!(
            host_uri("ec2-1.example.com", 8080).unwrap().to_string(),
            "http://ec2-1.example.com:8080/"
        );
        assert_eq!(
            host_uri("http://10.0.0.5:9000", 8080).unwrap().to_string(),
            "http://10.0.0.5:9000/"
        );
        assert!(host_uri("bad host", 8080).is_err());
    }
}
