//! Autoscaling controller
//!
//! One [`Autoscaler`] runs per configured scale policy, each on its own timer.
//! Remote groups average windowed statistics per member and hand capacity
//! changes to the lifecycle manager; the guard is released by the completion
//! paths in [`crate::group`]. Local groups probe members directly, wait a
//! fixed settle delay and move members between the pool and standby
//! synchronously.

use crate::config::{LocalProbeConfig, ScaleDownPolicy, ScaleUpPolicy, ScalingMode};
use crate::error::ProbeError;
use crate::group::{Member, ScalingGroup};
use crate::lifecycle::shutdown_requested;
use crate::metrics::{latest, LoadProbe, MetricQuery, MetricsSource};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Load reported for a member that refuses connections
pub const UNREACHABLE_LOAD: f64 = 100.0;

/// Where a controller reads load from
#[derive(Clone)]
pub enum LoadSignal {
    Remote {
        metrics: Arc<dyn MetricsSource>,
        namespace: String,
    },
    Local {
        probe: Arc<dyn LoadProbe>,
        settle_up: Duration,
        settle_down: Duration,
    },
}

impl LoadSignal {
    pub fn local(probe: Arc<dyn LoadProbe>, config: &LocalProbeConfig) -> Self {
        LoadSignal::Local {
            probe,
            settle_up: Duration::from_secs(config.scale_up_settle_secs),
            settle_down: Duration::from_secs(config.scale_down_settle_secs),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A scaling action is still in flight
    Skipped,
    /// No usable load reading this tick
    NoData,
    NoChange,
    ScaledUp(usize),
    ScaledDown(usize),
}

pub struct Autoscaler {
    group: Arc<ScalingGroup>,
    up: Option<ScaleUpPolicy>,
    down: Option<ScaleDownPolicy>,
    signal: LoadSignal,
}

impl Autoscaler {
    pub fn new(
        group: Arc<ScalingGroup>,
        up: Option<ScaleUpPolicy>,
        down: Option<ScaleDownPolicy>,
        signal: LoadSignal,
    ) -> Self {
        Self {
            group,
            up,
            down,
            signal,
        }
    }

    /// One controller per configured policy, or none if scaling is disabled
    pub fn for_group(group: &Arc<ScalingGroup>, signal: LoadSignal) -> Vec<Autoscaler> {
        let config = group.config();
        if !config.scale {
            return Vec::new();
        }

        let ups = config
            .scale_up
            .iter()
            .map(|p| Autoscaler::new(Arc::clone(group), Some(p.clone()), None, signal.clone()));
        let downs = config
            .scale_down
            .iter()
            .map(|p| Autoscaler::new(Arc::clone(group), None, Some(p.clone()), signal.clone()));
        ups.chain(downs).collect()
    }

    /// Metric, statistic and period this controller evaluates
    fn evaluation(&self) -> Option<(&str, &str, Duration)> {
        if let Some(ref up) = self.up {
            Some((up.metric.as_str(), up.statistic.as_str(), up.period()))
        } else {
            self.down
                .as_ref()
                .map(|down| (down.metric.as_str(), down.statistic.as_str(), down.period()))
        }
    }

    /// Tick immediately, then once per policy period, until shutdown
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let Some((metric, _, period)) = self.evaluation() else {
            return;
        };
        let period = period.max(Duration::from_secs(1));

        info!(
            group = self.group.name(),
            metric,
            period_secs = period.as_secs(),
            direction = if self.up.is_some() { "up" } else { "down" },
            "Autoscaler started"
        );

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_requested(&mut shutdown_rx) => break,
            }
            tokio::select! {
                outcome = self.tick() => {
                    debug!(group = self.group.name(), outcome = ?outcome, "Autoscaler tick");
                }
                _ = shutdown_requested(&mut shutdown_rx) => break,
            }
        }

        info!(group = self.group.name(), "Autoscaler stopped");
    }

    /// Evaluate the policy once
    pub async fn tick(&self) -> TickOutcome {
        match self.signal {
            LoadSignal::Remote {
                ref metrics,
                ref namespace,
            } => self.remote_tick(metrics.as_ref(), namespace).await,
            LoadSignal::Local {
                ref probe,
                settle_up,
                settle_down,
            } => self.local_tick(probe.as_ref(), settle_up, settle_down).await,
        }
    }

    async fn remote_tick(&self, metrics: &dyn MetricsSource, namespace: &str) -> TickOutcome {
        if self.group.is_scaling() {
            return TickOutcome::Skipped;
        }
        let (current, desired) = self.group.counts();
        if current != desired {
            return TickOutcome::Skipped;
        }

        let Some(load) = self.remote_load(metrics, namespace).await else {
            return TickOutcome::NoData;
        };
        debug!(group = self.group.name(), load, current, "Remote load");

        if let Some(ref up) = self.up {
            if current < self.group.config().max && up.in_band(load) {
                let Some(permit) = self.group.try_begin_scaling() else {
                    return TickOutcome::Skipped;
                };
                return match self.group.scale_up(permit, up.instances) {
                    0 => TickOutcome::NoChange,
                    n => TickOutcome::ScaledUp(n),
                };
            }
        }

        if let Some(ref down) = self.down {
            if load <= down.upper_threshold {
                let Some(permit) = self.group.try_begin_scaling() else {
                    return TickOutcome::Skipped;
                };
                return match self.group.scale_down(permit, down.instances).len() {
                    0 => TickOutcome::NoChange,
                    n => TickOutcome::ScaledDown(n),
                };
            }
        }

        TickOutcome::NoChange
    }

    /// Average of each member's latest datapoint over a window of twice the
    /// period. Members without data are left out; `None` if nobody had data.
    async fn remote_load(&self, metrics: &dyn MetricsSource, namespace: &str) -> Option<f64> {
        let (metric, statistic, period) = self.evaluation()?;
        let end = Utc::now();
        let start = end - chrono::Duration::seconds(2 * period.as_secs() as i64);

        let queries: Vec<MetricQuery> = self
            .group
            .members()
            .iter()
            .map(|member| {
                let (dimension_key, dimension_value) = dimension(member);
                MetricQuery {
                    namespace: namespace.to_string(),
                    metric: metric.to_string(),
                    statistic: statistic.to_string(),
                    dimension_key: dimension_key.to_string(),
                    dimension_value,
                    period_secs: period.as_secs(),
                    start,
                    end,
                }
            })
            .collect();

        let results = join_all(queries.iter().map(|q| metrics.query(q))).await;

        let mut samples = Vec::with_capacity(results.len());
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(points) => match latest(&points) {
                    Some(point) => samples.push(point.value),
                    None => debug!(group = self.group.name(), member = query.dimension_value, "No datapoints"),
                },
                Err(e) => {
                    warn!(group = self.group.name(), member = query.dimension_value, error = %e, "Metrics query failed");
                }
            }
        }

        average(&samples)
    }

    async fn local_tick(
        &self,
        probe: &dyn LoadProbe,
        settle_up: Duration,
        settle_down: Duration,
    ) -> TickOutcome {
        if self.group.is_scaling() {
            return TickOutcome::Skipped;
        }

        let Some(load) = self.local_load(probe).await else {
            return TickOutcome::NoData;
        };
        let (current, _) = self.group.counts();
        let config = self.group.config();
        debug!(group = self.group.name(), load, current, "Local load");

        if let Some(ref up) = self.up {
            if current < config.max && up.in_band(load) {
                if self.group.standby_len() == 0 {
                    return TickOutcome::NoChange;
                }
                let Some(_permit) = self.group.try_begin_scaling() else {
                    return TickOutcome::Skipped;
                };
                tokio::time::sleep(settle_up).await;
                let activated = self.group.activate_standby(up.instances);
                return match activated.len() {
                    0 => TickOutcome::NoChange,
                    n => TickOutcome::ScaledUp(n),
                };
            }
        }

        if let Some(ref down) = self.down {
            if load <= down.upper_threshold && current > config.min {
                let Some(_permit) = self.group.try_begin_scaling() else {
                    return TickOutcome::Skipped;
                };
                tokio::time::sleep(settle_down).await;
                let removed = self.group.deactivate_members(down.instances);
                return match removed.len() {
                    0 => TickOutcome::NoChange,
                    n => TickOutcome::ScaledDown(n),
                };
            }
        }

        TickOutcome::NoChange
    }

    /// Average instantaneous load across active members. An unreachable
    /// member counts as fully loaded; any other failure aborts the tick.
    async fn local_load(&self, probe: &dyn LoadProbe) -> Option<f64> {
        let members = self.group.members();
        let results = join_all(members.iter().map(|m| probe.fetch_load(&m.address))).await;

        let mut samples = Vec::with_capacity(results.len());
        for (member, result) in members.iter().zip(results) {
            match result {
                Ok(load) => samples.push(load),
                Err(ProbeError::Connect(_)) => {
                    warn!(group = self.group.name(), member = member.address, "Member unreachable, counting as fully loaded");
                    samples.push(UNREACHABLE_LOAD);
                }
                Err(e) => {
                    warn!(group = self.group.name(), member = member.address, error = %e, "No load reading, skipping tick");
                    return None;
                }
            }
        }

        average(&samples)
    }
}

/// Metric dimension identifying one member
fn dimension(member: &Member) -> (&'static str, String) {
    match member.instance_id {
        Some(ref id) => ("InstanceId", id.clone()),
        None => ("Address", member.address.clone()),
    }
}

fn average(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

/// Build every controller for every group
pub fn build_autoscalers(
    groups: &[Arc<ScalingGroup>],
    remote: Option<LoadSignal>,
    local: Option<LoadSignal>,
) -> Vec<Autoscaler> {
    groups
        .iter()
        .flat_map(|group| {
            let signal = match group.mode() {
                ScalingMode::Remote => remote.clone(),
                ScalingMode::Local => local.clone(),
            };
            match signal {
                Some(signal) => Autoscaler::for_group(group, signal),
                None => {
                    if group.config().scale {
                        warn!(group = group.name(), "No load signal configured, scaling disabled");
                    }
                    Vec::new()
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average() {
        assert_eq!(average(&[]), None);
        assert_eq!(average(&[10.0, 20.0, 60.0]), Some(30.0));
    }

    #[test]
    fn test_dimension() {
        let member = Member::new("10.0.0.1").with_instance_id("i-1");
        assert_eq!(dimension(&member), ("InstanceId", "i-1".to_string()));
        assert_eq!(
            dimension(&Member::new("10.0.0.2")),
            ("Address", "10.0.0.2".to_string())
        );
    }
}
