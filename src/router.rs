//! Host pool and per-request routing
//!
//! The pool is published as an immutable [`PoolSnapshot`] behind an
//! [`ArcSwap`]. Writers serialize on a mutex, build a new snapshot from the
//! current one and swap it in; readers load whatever snapshot is current and
//! never block. The route map lives inside the snapshot so it is always
//! consistent with the host list it was built with.

use crate::host::{Availability, Host, HostLimits, HostSpec};
use crate::selector::HostSelector;
use arc_swap::ArcSwap;
use hyper::header::COOKIE;
use hyper::{HeaderMap, Uri};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One published view of the pool
#[derive(Debug, Default)]
pub struct PoolSnapshot {
    pub hosts: Vec<Arc<Host>>,
    routes: HashMap<String, Arc<Host>>,
}

impl PoolSnapshot {
    pub fn route(&self, route_id: &str) -> Option<&Arc<Host>> {
        self.routes.get(route_id)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Key used to remove a host from the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMatch {
    Uri(Uri),
    InstanceId(String),
}

impl HostMatch {
    /// Instance id wins when both keys are supplied
    pub fn from_parts(uri: Option<Uri>, instance_id: Option<String>) -> Option<Self> {
        match (instance_id, uri) {
            (Some(id), _) => Some(HostMatch::InstanceId(id)),
            (None, Some(uri)) => Some(HostMatch::Uri(uri)),
            (None, None) => None,
        }
    }

    fn matches(&self, host: &Host) -> bool {
        match self {
            HostMatch::Uri(uri) => host.uri == *uri,
            HostMatch::InstanceId(id) => host.instance_id.as_deref() == Some(id.as_str()),
        }
    }
}

/// Routing metadata carried by an inbound request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteRequest {
    /// `type` query parameter
    pub category: Option<String>,
    /// `id` query parameter
    pub request_id: Option<String>,
    /// `arg` query parameter
    pub argument: Option<String>,
    /// Route key parsed out of the session cookie
    pub session_route: Option<String>,
}

impl RouteRequest {
    /// Classify a request from its query string and cookies
    pub fn from_parts(uri: &Uri, headers: &HeaderMap, cookie_names: &[String]) -> Self {
        let mut request = RouteRequest::default();

        if let Some(query) = uri.query() {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = match urlencoding::decode(value) {
                    Ok(v) => v.into_owned(),
                    Err(_) => continue,
                };
                match key {
                    "type" => request.category = Some(value),
                    "id" => request.request_id = Some(value),
                    "arg" => request.argument = Some(value),
                    _ => {}
                }
            }
        }

        request.session_route = session_token(headers, cookie_names)
            .and_then(|token| parse_route(&token).map(String::from));

        request
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_session_route(mut self, route: impl Into<String>) -> Self {
        self.session_route = Some(route.into());
        self
    }
}

/// Find the first configured session cookie present on the request
fn session_token(headers: &HeaderMap, cookie_names: &[String]) -> Option<String> {
    let cookies: Vec<(&str, &str)> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|c| c.trim().split_once('='))
        .collect();

    cookie_names.iter().find_map(|name| {
        cookies
            .iter()
            .find(|(k, _)| *k == name.as_str())
            .map(|(_, v)| v.trim_matches('"').to_string())
    })
}

/// Extract the route key from a `<opaque>.<route>[.<suffix>]` session token
pub fn parse_route(token: &str) -> Option<&str> {
    let (_, rest) = token.split_once('.')?;
    let route = rest.split('.').next()?;
    if route.is_empty() {
        None
    } else {
        Some(route)
    }
}

/// Hosts already tried for the current request
#[derive(Debug, Default)]
pub struct AttemptedHosts {
    hosts: Vec<Arc<Host>>,
}

impl AttemptedHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: Arc<Host>) {
        if !self.contains(&host) {
            self.hosts.push(host);
        }
    }

    pub fn contains(&self, host: &Arc<Host>) -> bool {
        self.hosts.iter().any(|h| Arc::ptr_eq(h, host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Owns the live host pool and picks a host per request attempt
pub struct HostRouter {
    snapshot: ArcSwap<PoolSnapshot>,
    write_lock: Mutex<()>,
    selector: Arc<dyn HostSelector>,
    limits: HostLimits,
}

impl HostRouter {
    pub fn new(selector: Arc<dyn HostSelector>, limits: HostLimits) -> Arc<Self> {
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(PoolSnapshot::default()),
            write_lock: Mutex::new(()),
            selector,
            limits,
        })
    }

    /// The currently published pool
    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn selector_name(&self) -> &'static str {
        self.selector.name()
    }

    /// Add a host and publish the extended pool
    pub fn add_host(&self, spec: HostSpec) -> Arc<Host> {
        let host = Host::new(spec, self.limits);

        let _guard = self.write_lock.lock();
        let current = self.snapshot.load();

        let mut hosts = Vec::with_capacity(current.hosts.len() + 1);
        hosts.extend(current.hosts.iter().cloned());
        hosts.push(Arc::clone(&host));

        let mut routes = current.routes.clone();
        if let Some(ref route) = host.route_id {
            routes.insert(route.clone(), Arc::clone(&host));
        }

        self.snapshot.store(Arc::new(PoolSnapshot { hosts, routes }));

        info!(
            uri = %host.uri,
            route = host.route_id.as_deref(),
            instance_id = host.instance_id.as_deref(),
            total_hosts = current.hosts.len() + 1,
            "Added host to pool"
        );

        host
    }

    /// Remove the first host matching `key`. Returns `None` if nothing matched.
    pub fn remove_host(&self, key: &HostMatch) -> Option<Arc<Host>> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load();

        let pos = current.hosts.iter().position(|h| key.matches(h))?;
        let removed = Arc::clone(&current.hosts[pos]);

        let hosts: Vec<Arc<Host>> = current
            .hosts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != pos)
            .map(|(_, h)| Arc::clone(h))
            .collect();

        let mut routes = current.routes.clone();
        if let Some(ref route) = removed.route_id {
            if routes
                .get(route)
                .is_some_and(|h| Arc::ptr_eq(h, &removed))
            {
                routes.remove(route);
            }
        }

        let remaining = hosts.len();
        self.snapshot.store(Arc::new(PoolSnapshot { hosts, routes }));
        removed.close();

        info!(
            uri = %removed.uri,
            instance_id = removed.instance_id.as_deref(),
            total_hosts = remaining,
            "Removed host from pool"
        );

        Some(removed)
    }

    /// Pick a host for one attempt of `request`, skipping `attempted`.
    ///
    /// Preference: sticky route, then the first AVAILABLE host in a circular
    /// scan from the selector's index, then the first FULL host seen, then
    /// the first PROBLEM / FULL_QUEUE host seen. `None` means no backend.
    pub fn select_host(
        &self,
        request: &RouteRequest,
        attempted: &AttemptedHosts,
    ) -> Option<Arc<Host>> {
        let snapshot = self.snapshot.load();

        if let Some(ref route) = request.session_route {
            if let Some(host) = snapshot.routes.get(route) {
                if !attempted.contains(host) {
                    debug!(route, uri = %host.uri, "Sticky route hit");
                    return Some(Arc::clone(host));
                }
            }
        }

        let hosts = &snapshot.hosts;
        if hosts.is_empty() {
            return None;
        }

        let start = self
            .selector
            .select_start_index(hosts, request.category.as_deref())
            % hosts.len();

        let mut full: Option<&Arc<Host>> = None;
        let mut degraded: Option<&Arc<Host>> = None;

        for offset in 0..hosts.len() {
            let host = &hosts[(start + offset) % hosts.len()];
            if attempted.contains(host) {
                continue;
            }
            match host.availability() {
                Availability::Available => return Some(Arc::clone(host)),
                Availability::Full => {
                    full.get_or_insert(host);
                }
                Availability::Problem | Availability::FullQueue => {
                    degraded.get_or_insert(host);
                }
                Availability::Closed => {}
            }
        }

        full.or(degraded).cloned()
    }
}
