//! Host selector strategies
//!
//! A selector only picks where the router's failover scan starts. It reads the
//! snapshot it is handed and mutates nothing but its own counters, so every
//! implementation is safe to call concurrently without touching the pool lock.

use crate::config::{SelectorConfig, SelectorKind};
use crate::host::Host;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Maps a request category to a starting index into a pool snapshot
pub trait HostSelector: Send + Sync {
    /// `hosts` is never empty when the router calls this
    fn select_start_index(&self, hosts: &[Arc<Host>], category: Option<&str>) -> usize;

    fn name(&self) -> &'static str;
}

/// Build the selector named in configuration
pub fn build_selector(config: &SelectorConfig) -> Arc<dyn HostSelector> {
    match config.strategy {
        SelectorKind::RoundRobin => Arc::new(RoundRobinSelector::new()),
        SelectorKind::Random => Arc::new(RandomSelector),
        SelectorKind::TypeAffine => Arc::new(TypeAffineSelector::new(config.type_affinity.clone())),
        SelectorKind::Heterogeneous => Arc::new(HeterogeneousSelector::new(
            config.fixed_routes.clone(),
            config.unclassified_index,
        )),
    }
}

fn random_index(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

/// Cycles through the pool in order, ignoring the category
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostSelector for RoundRobinSelector {
    fn select_start_index(&self, hosts: &[Arc<Host>], _category: Option<&str>) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % hosts.len()
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Uniformly random start
#[derive(Debug, Default)]
pub struct RandomSelector;

impl HostSelector for RandomSelector {
    fn select_start_index(&self, hosts: &[Arc<Host>], _category: Option<&str>) -> usize {
        random_index(hosts.len())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Prefers hosts whose instance type suits the request category.
///
/// Each known category keeps its own cursor. The scan resumes one past the
/// cursor, wraps once, and moves the cursor to whatever it matched so that
/// consecutive requests rotate across the matching hosts.
#[derive(Debug)]
pub struct TypeAffineSelector {
    preferred: HashMap<String, (String, AtomicUsize)>,
}

impl TypeAffineSelector {
    pub fn new(affinity: HashMap<String, String>) -> Self {
        let preferred = affinity
            .into_iter()
            .map(|(category, instance_type)| (category, (instance_type, AtomicUsize::new(0))))
            .collect();
        Self { preferred }
    }
}

impl HostSelector for TypeAffineSelector {
    fn select_start_index(&self, hosts: &[Arc<Host>], category: Option<&str>) -> usize {
        let len = hosts.len();
        let Some((instance_type, cursor)) = category.and_then(|c| self.preferred.get(c)) else {
            return random_index(len);
        };

        let start = cursor.load(Ordering::Relaxed);
        for offset in 1..=len {
            let idx = (start + offset) % len;
            if hosts[idx].instance_type.as_deref() == Some(instance_type.as_str()) {
                cursor.store(idx, Ordering::Relaxed);
                return idx;
            }
        }

        random_index(len)
    }

    fn name(&self) -> &'static str {
        "type-affine"
    }
}

/// Reserves the lowest indices for fixed-role hosts.
///
/// Categories listed in `fixed` always start at their reserved index.
/// Unclassified requests (health checks) start at `unclassified_index`.
/// Everything else round-robins over the indices past the reserved block.
#[derive(Debug)]
pub struct HeterogeneousSelector {
    fixed: HashMap<String, usize>,
    unclassified_index: usize,
    reserved: usize,
    counter: AtomicUsize,
}

impl HeterogeneousSelector {
    pub fn new(fixed: HashMap<String, usize>, unclassified_index: usize) -> Self {
        let reserved = fixed.values().map(|idx| idx + 1).max().unwrap_or(0);
        Self {
            fixed,
            unclassified_index,
            reserved,
            counter: AtomicUsize::new(0),
        }
    }
}

impl HostSelector for HeterogeneousSelector {
    fn select_start_index(&self, hosts: &[Arc<Host>], category: Option<&str>) -> usize {
        let len = hosts.len();
        let Some(category) = category else {
            return self.unclassified_index % len;
        };

        if let Some(&idx) = self.fixed.get(category) {
            return idx % len;
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        if len > self.reserved {
            self.reserved + n % (len - self.reserved)
        } else {
            n % len
        }
    }

    fn name(&self) -> &'static str {
        "heterogeneous"
    }
}
