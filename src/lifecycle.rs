//! Instance lifecycle manager
//!
//! Drives the compute provider through launch (submit, poll until running,
//! tag, warm up) and terminate (submit, poll until terminated). Every
//! operation runs as its own task, bounded by a worker semaphore, and reports
//! its outcome once through a [`LifecycleHandle`].
//!
//! Poll loops are bounded by a deadline and by the shutdown signal. Provider
//! errors while polling back off exponentially up to `max_backoff`.

use crate::config::ProviderConfig;
use crate::error::{LifecycleError, ProviderError};
use crate::provider::{ComputeProvider, IngressRule, InstanceState, LaunchSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Resolves once shutdown has been signalled. A dropped sender never resolves.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Timing and launch parameters for lifecycle operations
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub security_group: String,
    pub key_name: Option<String>,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub warmup: Duration,
    pub launch_timeout: Duration,
    pub terminate_timeout: Duration,
    pub max_workers: usize,
    pub tags: HashMap<String, String>,
}

impl From<&ProviderConfig> for LifecycleSettings {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            security_group: config.security_group.clone(),
            key_name: config.key_name.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            warmup: Duration::from_secs(config.warmup_secs),
            launch_timeout: Duration::from_secs(config.launch_timeout_secs),
            terminate_timeout: Duration::from_secs(config.terminate_timeout_secs),
            max_workers: config.max_workers,
            tags: config.tags.clone(),
        }
    }
}

/// A launched instance, running and warmed up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedInstance {
    pub instance_id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatedInstances {
    pub instance_ids: Vec<String>,
}

/// Completion of one in-flight lifecycle operation
#[derive(Debug)]
pub struct LifecycleHandle<T> {
    rx: oneshot::Receiver<Result<T, LifecycleError>>,
}

impl<T> LifecycleHandle<T> {
    /// Wait for the operation to finish
    pub async fn wait(self) -> Result<T, LifecycleError> {
        self.rx.await.unwrap_or(Err(LifecycleError::WorkerLost))
    }
}

/// Deadline and backoff bookkeeping for one poll loop
struct PollClock {
    deadline: Instant,
    timeout: Duration,
    interval: Duration,
    max_backoff: Duration,
    backoff: Duration,
}

impl PollClock {
    fn new(settings: &LifecycleSettings, timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            interval: settings.poll_interval,
            max_backoff: settings.max_backoff.max(settings.poll_interval),
            backoff: settings.poll_interval,
        }
    }

    /// Delay after a successful but not-yet-final poll
    fn progressed(&mut self) -> Duration {
        self.backoff = self.interval;
        self.interval
    }

    /// Delay after a provider error
    fn failed(&mut self) -> Duration {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.max_backoff);
        delay
    }
}

pub struct LifecycleManager {
    provider: Arc<dyn ComputeProvider>,
    settings: LifecycleSettings,
    workers: Arc<Semaphore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LifecycleManager {
    /// Create the manager and run idempotent provider setup once
    pub async fn new(
        provider: Arc<dyn ComputeProvider>,
        settings: LifecycleSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            provider,
            workers: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            settings,
            shutdown_rx,
        });
        manager.setup().await;
        manager
    }

    /// Create the security group and open its ingress. Errors are logged only.
    pub async fn setup(&self) {
        let group = &self.settings.security_group;

        match self.provider.create_security_group(group).await {
            Ok(()) => info!(security_group = group, "Created security group"),
            Err(ProviderError::AlreadyExists(_)) => {
                debug!(security_group = group, "Security group already exists")
            }
            Err(e) => warn!(security_group = group, error = %e, "Failed to create security group"),
        }

        match self
            .provider
            .authorize_ingress(group, &IngressRule::open_tcp())
            .await
        {
            Ok(()) => info!(security_group = group, "Authorized ingress"),
            Err(ProviderError::AlreadyExists(_)) => {
                debug!(security_group = group, "Ingress rule already present")
            }
            Err(e) => warn!(security_group = group, error = %e, "Failed to authorize ingress"),
        }
    }

    /// Launch one instance in the background
    pub fn launch(
        self: &Arc<Self>,
        instance_type: &str,
        image_id: &str,
        group_id: usize,
    ) -> LifecycleHandle<LaunchedInstance> {
        let (tx, rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let instance_type = instance_type.to_string();
        let image_id = image_id.to_string();

        tokio::spawn(async move {
            let result = match Arc::clone(&manager.workers).acquire_owned().await {
                Ok(_permit) => manager.run_launch(&instance_type, &image_id, group_id).await,
                Err(_) => Err(LifecycleError::WorkerLost),
            };
            if let Err(ref e) = result {
                error!(group_id, instance_type, error = %e, "Launch failed");
            }
            let _ = tx.send(result);
        });

        LifecycleHandle { rx }
    }

    /// Terminate instances in the background
    pub fn terminate(
        self: &Arc<Self>,
        instance_ids: Vec<String>,
        group_id: usize,
    ) -> LifecycleHandle<TerminatedInstances> {
        let (tx, rx) = oneshot::channel();
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let result = match Arc::clone(&manager.workers).acquire_owned().await {
                Ok(_permit) => manager.run_terminate(instance_ids, group_id).await,
                Err(_) => Err(LifecycleError::WorkerLost),
            };
            if let Err(ref e) = result {
                error!(group_id, error = %e, "Terminate failed");
            }
            let _ = tx.send(result);
        });

        LifecycleHandle { rx }
    }

    async fn run_launch(
        &self,
        instance_type: &str,
        image_id: &str,
        group_id: usize,
    ) -> Result<LaunchedInstance, LifecycleError> {
        let spec = LaunchSpec {
            image_id: image_id.to_string(),
            instance_type: instance_type.to_string(),
            key_name: self.settings.key_name.clone(),
            security_group: self.settings.security_group.clone(),
            monitoring: true,
        };

        let instance_id = self.provider.launch_instance(&spec).await?;
        info!(group_id, instance_id, instance_type, image_id, "Launch submitted");

        match self.bring_online(&instance_id).await {
            Ok(address) => {
                info!(group_id, instance_id, address, "Instance ready for traffic");
                Ok(LaunchedInstance {
                    instance_id,
                    address,
                })
            }
            Err(e) => {
                self.abandon(&instance_id).await;
                Err(e)
            }
        }
    }

    async fn bring_online(&self, instance_id: &str) -> Result<String, LifecycleError> {
        let mut clock = PollClock::new(&self.settings, self.settings.launch_timeout);

        loop {
            let delay = match self.provider.describe_instance_state(instance_id).await {
                Ok(InstanceState::Running) => break,
                Ok(state @ (InstanceState::ShuttingDown | InstanceState::Terminated)) => {
                    return Err(ProviderError::InvalidResponse(format!(
                        "instance {} went {} while launching",
                        instance_id,
                        state.as_str()
                    ))
                    .into());
                }
                Ok(state) => {
                    debug!(instance_id, state = state.as_str(), "Waiting for instance to run");
                    clock.progressed()
                }
                Err(e) => {
                    warn!(instance_id, error = %e, "Failed to describe instance");
                    clock.failed()
                }
            };
            self.pause(&mut clock, delay, instance_id, "running").await?;
        }

        let address = loop {
            let delay = match self.provider.describe_public_address(instance_id).await {
                Ok(address) => break address,
                Err(e) => {
                    debug!(instance_id, error = %e, "Public address not available yet");
                    clock.failed()
                }
            };
            self.pause(&mut clock, delay, instance_id, "running").await?;
        };

        if !self.settings.tags.is_empty() {
            if let Err(e) = self
                .provider
                .tag_resources(&[instance_id.to_string()], &self.settings.tags)
                .await
            {
                warn!(instance_id, error = %e, "Failed to tag instance");
            }
        }

        debug!(
            instance_id,
            warmup_secs = self.settings.warmup.as_secs(),
            "Warming up instance"
        );
        self.sleep_or_cancel(self.settings.warmup).await?;

        Ok(address)
    }

    /// Best-effort cleanup of an instance whose launch did not complete
    async fn abandon(&self, instance_id: &str) {
        if let Err(e) = self
            .provider
            .terminate_instances(&[instance_id.to_string()])
            .await
        {
            warn!(instance_id, error = %e, "Failed to terminate abandoned instance");
        }
    }

    async fn run_terminate(
        &self,
        instance_ids: Vec<String>,
        group_id: usize,
    ) -> Result<TerminatedInstances, LifecycleError> {
        self.provider.terminate_instances(&instance_ids).await?;
        info!(group_id, instance_ids = ?instance_ids, "Terminate submitted");

        let mut clock = PollClock::new(&self.settings, self.settings.terminate_timeout);
        for instance_id in &instance_ids {
            loop {
                let delay = match self.provider.describe_instance_state(instance_id).await {
                    Ok(InstanceState::Terminated) | Err(ProviderError::NotFound(_)) => break,
                    Ok(state) => {
                        debug!(instance_id, state = state.as_str(), "Waiting for termination");
                        clock.progressed()
                    }
                    Err(e) => {
                        warn!(instance_id, error = %e, "Failed to describe instance");
                        clock.failed()
                    }
                };
                self.pause(&mut clock, delay, instance_id, "terminated").await?;
            }
            info!(group_id, instance_id, "Instance terminated");
        }

        Ok(TerminatedInstances { instance_ids })
    }

    /// Sleep before the next poll, failing once the deadline has passed
    async fn pause(
        &self,
        clock: &mut PollClock,
        delay: Duration,
        instance_id: &str,
        target: &'static str,
    ) -> Result<(), LifecycleError> {
        let now = Instant::now();
        if now >= clock.deadline {
            return Err(LifecycleError::Timeout {
                instance_id: instance_id.to_string(),
                target,
                waited: clock.timeout,
            });
        }
        self.sleep_or_cancel(delay.min(clock.deadline - now)).await
    }

    async fn sleep_or_cancel(&self, duration: Duration) -> Result<(), LifecycleError> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = shutdown_requested(&mut shutdown_rx) => Err(LifecycleError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> LifecycleSettings {
        LifecycleSettings {
            security_group: "sg".to_string(),
            key_name: None,
            poll_interval: Duration::from_secs(5),
            max_backoff: Duration::from_secs(30),
            warmup: Duration::from_secs(90),
            launch_timeout: Duration::from_secs(600),
            terminate_timeout: Duration::from_secs(300),
            max_workers: 2,
            tags: HashMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_clock_backoff() {
        let mut clock = PollClock::new(&settings(), Duration::from_secs(60));
        assert_eq!(clock.failed(), Duration::from_secs(5));
        assert_eq!(clock.failed(), Duration::from_secs(10));
        assert_eq!(clock.failed(), Duration::from_secs(20));
        assert_eq!(clock.failed(), Duration::from_secs(30));
        assert_eq!(clock.failed(), Duration::from_secs(30));
        assert_eq!(clock.progressed(), Duration::from_secs(5));
        assert_eq!(clock.failed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_shutdown_requested() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_is_not_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let result =
            tokio::time::timeout(Duration::from_secs(1), shutdown_requested(&mut rx)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_handle_reports_lost_worker() {
        let (tx, rx) = oneshot::channel::<Result<(), LifecycleError>>();
        drop(tx);
        let handle = LifecycleHandle { rx };
        assert!(matches!(handle.wait().await, Err(LifecycleError::WorkerLost)));
    }

    #[test]
    fn test_settings_from_config() {
        let config = ProviderConfig {
            endpoint: "http://provider".to_string(),
            security_group: "web".to_string(),
            key_name: Some("p0".to_string()),
            poll_interval_secs: 2,
            max_backoff_secs: 20,
            warmup_secs: 45,
            launch_timeout_secs: 300,
            terminate_timeout_secs: 120,
            max_workers: 4,
            tags: HashMap::from([("Name".to_string(), "Server".to_string())]),
        };
        let settings = LifecycleSettings::from(&config);
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.warmup, Duration::from_secs(45));
        assert_eq!(settings.key_name.as_deref(), Some("p0"));
        assert_eq!(settings.tags.get("Name").unwrap(), "Server");
    }
}
