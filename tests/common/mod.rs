//! Shared helpers for integration tests: in-memory provider, metrics and
//! probe doubles plus config builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use scalegate::config::{GroupConfig, MemberConfig, ScaleDownPolicy, ScaleUpPolicy, ScalingMode};
use scalegate::error::{MetricsError, ProbeError, ProviderError};
use scalegate::host::HostLimits;
use scalegate::lifecycle::LifecycleSettings;
use scalegate::metrics::{Datapoint, LoadProbe, MetricQuery, MetricsSource};
use scalegate::provider::{ComputeProvider, InstanceDescription, InstanceState, IngressRule, LaunchSpec};
use scalegate::router::HostRouter;
use scalegate::selector::RoundRobinSelector;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Compute provider double. Instances report `pending` for a configurable
/// number of polls, then `running` with a synthetic public address.
#[derive(Default)]
pub struct MockProvider {
    next_id: Mutex<usize>,
    pending_polls: Mutex<HashMap<String, usize>>,
    terminated: Mutex<HashSet<String>>,
    pub launches: Mutex<Vec<LaunchSpec>>,
    pub terminate_calls: Mutex<Vec<Vec<String>>>,
    pub tagged: Mutex<Vec<String>>,
    /// Polls spent in `pending` before `running`
    pub polls_before_running: usize,
    /// Never leave `pending`
    pub stuck: bool,
    /// Report this address for running instances instead of `10.1.0.N`
    pub address_override: Option<String>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stuck() -> Arc<Self> {
        Arc::new(Self {
            stuck: true,
            ..Self::default()
        })
    }

    pub fn slow_boot(polls_before_running: usize) -> Arc<Self> {
        Arc::new(Self {
            polls_before_running,
            ..Self::default()
        })
    }

    /// Instances come up with an address no host URI can be built from
    pub fn unroutable() -> Arc<Self> {
        Arc::new(Self {
            address_override: Some("bad host".to_string()),
            ..Self::default()
        })
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.terminate_calls.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ComputeProvider for MockProvider {
    async fn launch_instance(&self, spec: &LaunchSpec) -> Result<String, ProviderError> {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            format!("i-mock-{}", *next)
        };
        self.launches.lock().push(spec.clone());
        self.pending_polls
            .lock()
            .insert(id.clone(), self.polls_before_running);
        Ok(id)
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceDescription, ProviderError> {
        if self.terminated.lock().contains(instance_id) {
            return Ok(InstanceDescription {
                instance_id: instance_id.to_string(),
                state: InstanceState::Terminated,
                public_address: None,
            });
        }

        let mut pending = self.pending_polls.lock();
        let Some(remaining) = pending.get_mut(instance_id) else {
            return Err(ProviderError::NotFound(instance_id.to_string()));
        };

        let state = if self.stuck || *remaining > 0 {
            *remaining = remaining.saturating_sub(1);
            InstanceState::Pending
        } else {
            InstanceState::Running
        };
        let number = instance_id.trim_start_matches("i-mock-");
        let address = self
            .address_override
            .clone()
            .unwrap_or_else(|| format!("10.1.0.{}", number));

        Ok(InstanceDescription {
            instance_id: instance_id.to_string(),
            state,
            public_address: (state == InstanceState::Running).then_some(address),
        })
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        self.terminate_calls.lock().push(instance_ids.to_vec());
        self.terminated.lock().extend(instance_ids.iter().cloned());
        Ok(())
    }

    async fn tag_resources(
        &self,
        resource_ids: &[String],
        _tags: &HashMap<String, String>,
    ) -> Result<(), ProviderError> {
        self.tagged.lock().extend(resource_ids.iter().cloned());
        Ok(())
    }

    async fn create_security_group(&self, name: &str) -> Result<(), ProviderError> {
        Err(ProviderError::AlreadyExists(name.to_string()))
    }

    async fn authorize_ingress(&self, _group: &str, _rule: &IngressRule) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Metrics double answering per dimension value
#[derive(Default)]
pub struct MockMetrics {
    values: Mutex<HashMap<String, Vec<f64>>>,
    failing: Mutex<HashSet<String>>,
    pub queries: Mutex<Vec<MetricQuery>>,
}

impl MockMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Datapoints for one dimension, oldest first, one minute apart
    pub fn set(&self, dimension: &str, values: &[f64]) {
        self.values.lock().insert(dimension.to_string(), values.to_vec());
    }

    pub fn set_all(&self, dimensions: &[String], value: f64) {
        for dimension in dimensions {
            self.set(dimension, &[value]);
        }
    }

    pub fn fail(&self, dimension: &str) {
        self.failing.lock().insert(dimension.to_string());
    }
}

#[async_trait]
impl MetricsSource for MockMetrics {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<Datapoint>, MetricsError> {
        self.queries.lock().push(query.clone());
        if self.failing.lock().contains(&query.dimension_value) {
            return Err(MetricsError::Request("metrics endpoint unavailable".to_string()));
        }

        let values = self
            .values
            .lock()
            .get(&query.dimension_value)
            .cloned()
            .unwrap_or_default();
        let now = Utc::now();
        let count = values.len() as i64;
        Ok(values
            .into_iter()
            .enumerate()
            .map(|(i, value)| Datapoint {
                timestamp: now - chrono::Duration::minutes(count - i as i64),
                value,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProbeReply {
    Load(f64),
    Refused,
    Garbage,
}

/// Load probe double answering per member address
#[derive(Default)]
pub struct MockProbe {
    replies: Mutex<HashMap<String, ProbeReply>>,
}

impl MockProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, address: &str, reply: ProbeReply) {
        self.replies.lock().insert(address.to_string(), reply);
    }
}

#[async_trait]
impl LoadProbe for MockProbe {
    async fn fetch_load(&self, address: &str) -> Result<f64, ProbeError> {
        let reply = self
            .replies
            .lock()
            .get(address)
            .copied()
            .unwrap_or(ProbeReply::Load(0.0));
        match reply {
            ProbeReply::Load(load) => Ok(load),
            ProbeReply::Refused => Err(ProbeError::Connect(format!("{}: connection refused", address))),
            ProbeReply::Garbage => Err(ProbeError::Invalid {
                address: address.to_string(),
                reason: "not a number".to_string(),
            }),
        }
    }
}

pub fn router() -> Arc<HostRouter> {
    HostRouter::new(Arc::new(RoundRobinSelector::new()), HostLimits::default())
}

pub fn lifecycle_settings() -> LifecycleSettings {
    let mut tags = HashMap::new();
    tags.insert("Name".to_string(), "Server".to_string());
    LifecycleSettings {
        security_group: "elastic-webserver".to_string(),
        key_name: None,
        poll_interval: Duration::from_secs(5),
        max_backoff: Duration::from_secs(60),
        warmup: Duration::from_secs(90),
        launch_timeout: Duration::from_secs(300),
        terminate_timeout: Duration::from_secs(300),
        max_workers: 10,
        tags,
    }
}

pub fn group_config(mode: ScalingMode, min: usize, max: usize, pool: Vec<MemberConfig>) -> GroupConfig {
    GroupConfig {
        name: Some("web".to_string()),
        image_id: "ami-1234".to_string(),
        instance_type: "m4.large".to_string(),
        mode,
        min,
        max,
        backend_port: 8080,
        scale: true,
        server_pool: pool,
        scale_up: Vec::new(),
        scale_down: Vec::new(),
    }
}

/// Pool members backed by provider instances `i-seed-1..=count`
pub fn seeded_members(count: usize) -> Vec<MemberConfig> {
    (1..=count)
        .map(|i| MemberConfig::Detailed {
            address: format!("10.0.0.{}", i),
            instance_id: Some(format!("i-seed-{}", i)),
            route: None,
        })
        .collect()
}

pub fn plain_members(addresses: &[&str]) -> Vec<MemberConfig> {
    addresses
        .iter()
        .map(|a| MemberConfig::Address(a.to_string()))
        .collect()
}

pub fn scale_up_policy(instances: usize, lower: f64, upper: f64) -> ScaleUpPolicy {
    ScaleUpPolicy {
        metric: "CPUUtilization".to_string(),
        statistic: "Average".to_string(),
        period_secs: 60,
        instances,
        lower_threshold: lower,
        upper_threshold: upper,
    }
}

pub fn scale_down_policy(instances: usize, upper: f64) -> ScaleDownPolicy {
    ScaleDownPolicy {
        metric: "CPUUtilization".to_string(),
        statistic: "Average".to_string(),
        period_secs: 60,
        instances,
        upper_threshold: upper,
    }
}
