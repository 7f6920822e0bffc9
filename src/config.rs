use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the load balancer and its scaling groups
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Host selector strategy and its parameters
    #[serde(default)]
    pub selector: SelectorConfig,

    /// Compute provider endpoint (required for remote groups or launches)
    pub provider: Option<ProviderConfig>,

    /// Metrics source endpoint (required for remote groups)
    pub metrics: Option<MetricsConfig>,

    /// Direct load probing used by local groups
    #[serde(default)]
    pub local_probe: LocalProbeConfig,

    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port for proxied traffic
    #[serde(default = "default_listen_port")]
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for admin write operations.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Cookies inspected, in order, for a sticky-session route
    #[serde(default = "default_session_cookie_names")]
    pub session_cookie_names: Vec<String>,

    /// Maximum time to wait for a backend response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum backends tried for one request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Connections a host accepts before it reports FULL
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,

    /// Requests that may queue on a full host before it reports FULL_QUEUE
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Seconds a failed host is reported as PROBLEM before being retried
    #[serde(default = "default_problem_server_retry")]
    pub problem_server_retry_secs: u64,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn problem_server_retry(&self) -> Duration {
        Duration::from_secs(self.problem_server_retry_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            session_cookie_names: default_session_cookie_names(),
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            max_connections_per_host: default_max_connections_per_host(),
            max_queue_size: default_max_queue_size(),
            problem_server_retry_secs: default_problem_server_retry(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Which host selector strategy picks the starting index of the failover scan
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorKind {
    #[default]
    RoundRobin,
    Random,
    TypeAffine,
    Heterogeneous,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SelectorConfig {
    #[serde(default)]
    pub strategy: SelectorKind,

    /// Request category -> preferred instance type (type-affine)
    #[serde(default = "default_type_affinity")]
    pub type_affinity: HashMap<String, String>,

    /// Request category -> reserved pool index (heterogeneous)
    #[serde(default = "default_fixed_routes")]
    pub fixed_routes: HashMap<String, usize>,

    /// Index used for requests without a category, e.g. health checks (heterogeneous)
    #[serde(default = "default_unclassified_index")]
    pub unclassified_index: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectorKind::default(),
            type_affinity: default_type_affinity(),
            fixed_routes: default_fixed_routes(),
            unclassified_index: default_unclassified_index(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Base URL of the compute provider API
    pub endpoint: String,

    #[serde(default = "default_security_group")]
    pub security_group: String,

    pub key_name: Option<String>,

    /// Interval between instance status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Upper bound for the backoff applied after provider errors
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Boot and application startup time before a new instance takes traffic
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,

    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,

    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,

    /// Launch/terminate workers allowed to run at once
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Tags applied to every launched instance
    #[serde(default = "default_tags")]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// Base URL of the metrics query API
    pub endpoint: String,

    #[serde(default = "default_metrics_namespace")]
    pub namespace: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalProbeConfig {
    /// Port members expose their load reading on
    #[serde(default = "default_backend_port")]
    pub port: u16,

    #[serde(default = "default_probe_path")]
    pub path: String,

    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,

    /// Simulated provisioning delay before standby members join
    #[serde(default = "default_scale_up_settle")]
    pub scale_up_settle_secs: u64,

    /// Simulated deprovisioning delay before members leave
    #[serde(default = "default_scale_down_settle")]
    pub scale_down_settle_secs: u64,
}

impl LocalProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LocalProbeConfig {
    fn default() -> Self {
        Self {
            port: default_backend_port(),
            path: default_probe_path(),
            timeout_ms: default_probe_timeout(),
            scale_up_settle_secs: default_scale_up_settle(),
            scale_down_settle_secs: default_scale_down_settle(),
        }
    }
}

/// How a group observes load
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// Windowed statistics from the metrics source; capacity via the provider
    #[default]
    #[serde(alias = "aws_cloudwatch")]
    Remote,
    /// Instantaneous load probed from each member; capacity from a standby list
    Local,
}

/// A configured pool member: a bare address or an address with its instance id
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum MemberConfig {
    Address(String),
    Detailed {
        address: String,
        instance_id: Option<String>,
        /// Session route id the member stamps into its cookies
        route: Option<String>,
    },
}

impl MemberConfig {
    pub fn address(&self) -> &str {
        match self {
            MemberConfig::Address(address) => address,
            MemberConfig::Detailed { address, .. } => address,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            MemberConfig::Address(_) => None,
            MemberConfig::Detailed { instance_id, .. } => instance_id.as_deref(),
        }
    }

    pub fn route(&self) -> Option<&str> {
        match self {
            MemberConfig::Address(_) => None,
            MemberConfig::Detailed { route, .. } => route.as_deref(),
        }
    }
}

/// One scaling group (launch config)
#[derive(Debug, Deserialize, Clone)]
pub struct GroupConfig {
    /// Label used in logs and status output
    pub name: Option<String>,

    pub image_id: String,

    pub instance_type: String,

    #[serde(default)]
    pub mode: ScalingMode,

    #[serde(default)]
    pub min: usize,

    pub max: usize,

    /// Port used when turning a bare member address into a URI
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,

    /// Whether the scale policies below are run at all
    #[serde(default)]
    pub scale: bool,

    #[serde(default)]
    pub server_pool: Vec<MemberConfig>,

    #[serde(default)]
    pub scale_up: Vec<ScaleUpPolicy>,

    #[serde(default)]
    pub scale_down: Vec<ScaleDownPolicy>,
}

impl GroupConfig {
    pub fn label(&self, id: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("group-{}", id))
    }

    pub fn validate(&self, label: &str) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.image_id.is_empty() {
            errors.push("'image_id' must not be empty".to_string());
        }
        if self.instance_type.is_empty() {
            errors.push("'instance_type' must not be empty".to_string());
        }
        if self.min > self.max {
            errors.push(format!("'min' ({}) exceeds 'max' ({})", self.min, self.max));
        }
        for policy in &self.scale_up {
            if policy.period_secs == 0 {
                errors.push(format!("scale_up policy '{}' has zero period", policy.metric));
            }
            if policy.lower_threshold > policy.upper_threshold {
                errors.push(format!(
                    "scale_up policy '{}' has lower_threshold above upper_threshold",
                    policy.metric
                ));
            }
        }
        for policy in &self.scale_down {
            if policy.period_secs == 0 {
                errors.push(format!("scale_down policy '{}' has zero period", policy.metric));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!("{}: {}", label, errors.join(", ")))
        }
    }
}

/// Scale-up trigger: fires when the averaged metric lies inside
/// `[lower_threshold, upper_threshold]`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ScaleUpPolicy {
    pub metric: String,
    #[serde(default = "default_statistic")]
    pub statistic: String,
    pub period_secs: u64,
    /// Instances added per trigger
    pub instances: usize,
    pub lower_threshold: f64,
    pub upper_threshold: f64,
}

impl ScaleUpPolicy {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn in_band(&self, value: f64) -> bool {
        value >= self.lower_threshold && value <= self.upper_threshold
    }
}

/// Scale-down trigger: fires when the averaged metric is at or below `upper_threshold`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ScaleDownPolicy {
    pub metric: String,
    #[serde(default = "default_statistic")]
    pub statistic: String,
    pub period_secs: u64,
    /// Instances removed per trigger
    pub instances: usize,
    pub upper_threshold: f64,
}

impl ScaleDownPolicy {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_session_cookie_names() -> Vec<String> {
    vec!["JSESSIONID".to_string()]
}

fn default_request_timeout() -> u64 {
    600
}

fn default_max_attempts() -> usize {
    3
}

fn default_max_connections_per_host() -> usize {
    30
}

fn default_max_queue_size() -> usize {
    24
}

fn default_problem_server_retry() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_type_affinity() -> HashMap<String, String> {
    HashMap::from([
        ("418wisdom".to_string(), "c4.xlarge".to_string()),
        ("countprimes".to_string(), "m4.large".to_string()),
    ])
}

fn default_fixed_routes() -> HashMap<String, usize> {
    HashMap::from([("tellmenow".to_string(), 0), ("memorykiller".to_string(), 1)])
}

fn default_unclassified_index() -> usize {
    2
}

fn default_security_group() -> String {
    "elastic-webserver".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_backoff() -> u64 {
    60
}

fn default_warmup() -> u64 {
    90
}

fn default_launch_timeout() -> u64 {
    900
}

fn default_terminate_timeout() -> u64 {
    600
}

fn default_max_workers() -> usize {
    10
}

fn default_tags() -> HashMap<String, String> {
    HashMap::from([("Name".to_string(), "Server".to_string())])
}

fn default_metrics_namespace() -> String {
    "AWS/EC2".to_string()
}

fn default_backend_port() -> u16 {
    8080
}

fn default_probe_path() -> String {
    "/cpu".to_string()
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_scale_up_settle() -> u64 {
    25
}

fn default_scale_down_settle() -> u64 {
    15
}

fn default_statistic() -> String {
    "Average".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.max_attempts == 0 {
            errors.push("server.max_attempts must be at least 1".to_string());
        }
        if self.server.max_connections_per_host == 0 {
            errors.push("server.max_connections_per_host must be at least 1".to_string());
        }
        if let Some(ref provider) = self.provider {
            if provider.max_workers == 0 {
                errors.push("provider.max_workers must be at least 1".to_string());
            }
        }

        for (id, group) in self.groups.iter().enumerate() {
            let label = group.label(id);
            if let Err(e) = group.validate(&label) {
                errors.push(e);
            }
            if group.mode == ScalingMode::Remote && group.scale {
                if self.provider.is_none() {
                    errors.push(format!("{}: remote scaling requires [provider]", label));
                }
                if self.metrics.is_none() {
                    errors.push(format!("{}: remote scaling requires [metrics]", label));
                }
            }
            if group.server_pool.len() < group.min && self.provider.is_none() {
                errors.push(format!(
                    "{}: server_pool has {} members but min is {}; launching the rest requires [provider]",
                    label,
                    group.server_pool.len(),
                    group.min
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
