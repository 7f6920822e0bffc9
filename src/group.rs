//! Scaling groups and their single-flight guard
//!
//! `current` is written only by the completion paths in this module
//! (`instance_launched`, `instance_terminated`, and the synchronous standby
//! moves of local groups). The guard is released only once `current`
//! has caught up with `desired`.

use crate::config::{GroupConfig, MemberConfig, ScalingMode};
use crate::error::LifecycleError;
use crate::host::{host_uri, HostSpec};
use crate::lifecycle::{LaunchedInstance, LifecycleHandle, LifecycleManager, TerminatedInstances};
use crate::router::{HostMatch, HostRouter};
use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One instance belonging to a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub address: String,
    pub instance_id: Option<String>,
    pub route: Option<String>,
}

impl Member {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            instance_id: None,
            route: None,
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }
}

impl From<&MemberConfig> for Member {
    fn from(config: &MemberConfig) -> Self {
        Self {
            address: config.address().to_string(),
            instance_id: config.instance_id().map(String::from),
            route: config.route().map(String::from),
        }
    }
}

impl From<&LaunchedInstance> for Member {
    fn from(launched: &LaunchedInstance) -> Self {
        Self {
            address: launched.address.clone(),
            instance_id: Some(launched.instance_id.clone()),
            route: Some(launched.instance_id.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct GroupState {
    current: usize,
    desired: usize,
    /// Active members, oldest first
    members: Vec<Member>,
    /// Configured but inactive members of a local group
    standby: VecDeque<Member>,
}

/// Point-in-time view of a group for status output
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub id: usize,
    pub name: String,
    pub mode: &'static str,
    pub image_id: String,
    pub instance_type: String,
    pub min: usize,
    pub max: usize,
    pub current: usize,
    pub desired: usize,
    pub scaling: bool,
    pub members: Vec<Member>,
    pub standby: usize,
}

/// Holds a group's single-flight guard.
///
/// Dropping the permit releases the guard. [`ScalingPermit::hand_off`]
/// transfers it to in-flight lifecycle operations instead, whose completion
/// paths release it once `current == desired`.
pub struct ScalingPermit<'a> {
    group: &'a ScalingGroup,
    armed: bool,
}

impl ScalingPermit<'_> {
    pub fn hand_off(mut self) {
        self.armed = false;
    }
}

impl Drop for ScalingPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.group.scaling.store(false, Ordering::Release);
        }
    }
}

pub struct ScalingGroup {
    id: usize,
    name: String,
    config: GroupConfig,
    state: Mutex<GroupState>,
    scaling: AtomicBool,
    router: Arc<HostRouter>,
    lifecycle: Option<Arc<LifecycleManager>>,
}

impl ScalingGroup {
    pub fn new(
        id: usize,
        config: GroupConfig,
        router: Arc<HostRouter>,
        lifecycle: Option<Arc<LifecycleManager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: config.label(id),
            config,
            state: Mutex::new(GroupState::default()),
            scaling: AtomicBool::new(false),
            router,
            lifecycle,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn mode(&self) -> ScalingMode {
        self.config.mode
    }

    /// (current, desired)
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.current, state.desired)
    }

    pub fn members(&self) -> Vec<Member> {
        self.state.lock().members.clone()
    }

    pub fn standby_len(&self) -> usize {
        self.state.lock().standby.len()
    }

    pub fn is_scaling(&self) -> bool {
        self.scaling.load(Ordering::Acquire)
    }

    /// Take the single-flight guard, or `None` if an action is in flight
    pub fn try_begin_scaling(&self) -> Option<ScalingPermit<'_>> {
        self.scaling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ScalingPermit {
                group: self,
                armed: true,
            })
    }

    /// Register configured members and launch whatever `min` still needs
    pub fn bootstrap(self: &Arc<Self>) -> anyhow::Result<()> {
        let pool: Vec<Member> = self.config.server_pool.iter().map(Member::from).collect();
        let active = pool.len().min(self.config.min);

        let missing = {
            let mut state = self.state.lock();
            for member in &pool[..active] {
                self.register(member)?;
                state.members.push(member.clone());
            }
            match self.config.mode {
                ScalingMode::Local => state.standby.extend(pool[active..].iter().cloned()),
                ScalingMode::Remote if pool.len() > active => {
                    warn!(
                        group = self.name,
                        ignored = pool.len() - active,
                        "Members beyond min are not registered for remote groups"
                    );
                }
                ScalingMode::Remote => {}
            }
            state.current = active;
            state.desired = self.config.min;
            self.config.min - active
        };

        info!(
            group = self.name,
            registered = active,
            launching = missing,
            min = self.config.min,
            max = self.config.max,
            "Scaling group bootstrapped"
        );

        if missing > 0 {
            let lifecycle = self
                .lifecycle
                .clone()
                .with_context(|| format!("{}: no provider to launch {} instances", self.name, missing))?;
            if let Some(permit) = self.try_begin_scaling() {
                permit.hand_off();
            }
            for _ in 0..missing {
                let handle = lifecycle.launch(&self.config.instance_type, &self.config.image_id, self.id);
                self.track_launch(handle);
            }
        }

        Ok(())
    }

    fn register(&self, member: &Member) -> anyhow::Result<()> {
        let uri = host_uri(&member.address, self.config.backend_port)
            .with_context(|| format!("invalid member address '{}'", member.address))?;

        let mut spec = HostSpec::new(uri)
            .with_image_id(&self.config.image_id)
            .with_instance_type(&self.config.instance_type);
        if let Some(ref id) = member.instance_id {
            spec = spec.with_instance_id(id);
        }
        if let Some(ref route) = member.route {
            spec = spec.with_route(route);
        }

        self.router.add_host(spec);
        Ok(())
    }

    fn deregister(&self, member: &Member) {
        let uri = host_uri(&member.address, self.config.backend_port).ok();
        if let Some(key) = HostMatch::from_parts(uri, member.instance_id.clone()) {
            if self.router.remove_host(&key).is_none() {
                debug!(group = self.name, address = member.address, "Member was not in the pool");
            }
        }
    }

    /// Release the guard once the group has settled
    fn settle(&self, state: &GroupState) {
        if state.current == state.desired {
            self.scaling.store(false, Ordering::Release);
            debug!(group = self.name, current = state.current, "Scaling settled");
        }
    }

    /// Raise `desired` and launch up to `per_trigger` instances without
    /// exceeding `max`. Returns the number of launches issued.
    pub fn scale_up(self: &Arc<Self>, permit: ScalingPermit<'_>, per_trigger: usize) -> usize {
        let Some(lifecycle) = self.lifecycle.clone() else {
            warn!(group = self.name, "Cannot scale up without a provider");
            return 0;
        };

        let increment = {
            let mut state = self.state.lock();
            let increment = self.config.max.saturating_sub(state.current).min(per_trigger);
            state.desired += increment;
            increment
        };
        if increment == 0 {
            return 0;
        }

        permit.hand_off();
        info!(group = self.name, increment, "Scaling up");
        for _ in 0..increment {
            let handle = lifecycle.launch(&self.config.instance_type, &self.config.image_id, self.id);
            self.track_launch(handle);
        }
        increment
    }

    /// Lower `desired` and terminate up to `per_trigger` of the most recently
    /// added provider-backed members without going below `min`.
    /// Returns the instance ids targeted.
    pub fn scale_down(self: &Arc<Self>, permit: ScalingPermit<'_>, per_trigger: usize) -> Vec<String> {
        let Some(lifecycle) = self.lifecycle.clone() else {
            warn!(group = self.name, "Cannot scale down without a provider");
            return Vec::new();
        };

        let victims: Vec<String> = {
            let mut state = self.state.lock();
            let decrement = state.current.saturating_sub(self.config.min).min(per_trigger);
            let victims: Vec<String> = state
                .members
                .iter()
                .rev()
                .filter_map(|m| m.instance_id.clone())
                .take(decrement)
                .collect();
            state.desired -= victims.len();
            victims
        };
        if victims.is_empty() {
            return victims;
        }

        permit.hand_off();
        info!(group = self.name, victims = ?victims, "Scaling down");
        for instance_id in &victims {
            let handle = lifecycle.terminate(vec![instance_id.clone()], self.id);
            self.track_terminate(handle);
        }
        victims
    }

    fn track_launch(self: &Arc<Self>, handle: LifecycleHandle<LaunchedInstance>) {
        let group = Arc::clone(self);
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(launched) => group.instance_launched(&launched),
                Err(e) => group.launch_failed(&e),
            }
        });
    }

    fn track_terminate(self: &Arc<Self>, handle: LifecycleHandle<TerminatedInstances>) {
        let group = Arc::clone(self);
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(done) => group.instance_terminated(&done),
                Err(e) => group.terminate_failed(1, &e),
            }
        });
    }

    /// A launch completed: the instance joins the group and the pool
    pub fn instance_launched(&self, launched: &LaunchedInstance) {
        let member = Member::from(launched);
        let mut state = self.state.lock();

        if let Err(e) = self.register(&member) {
            warn!(group = self.name, instance_id = launched.instance_id, error = %e, "Launched instance is not routable");
            if let Some(ref lifecycle) = self.lifecycle {
                // Not a member, so its completion is not tracked
                drop(lifecycle.terminate(vec![launched.instance_id.clone()], self.id));
            }
            state.desired = state.desired.saturating_sub(1);
            self.settle(&state);
            return;
        }

        state.members.push(member);
        state.current += 1;
        info!(
            group = self.name,
            instance_id = launched.instance_id,
            address = launched.address,
            current = state.current,
            desired = state.desired,
            "Instance launched"
        );
        self.settle(&state);
    }

    /// A launch failed: give up on that unit of desired capacity
    pub fn launch_failed(&self, error: &LifecycleError) {
        let mut state = self.state.lock();
        state.desired = state.desired.saturating_sub(1).max(state.current);
        warn!(
            group = self.name,
            error = %error,
            current = state.current,
            desired = state.desired,
            "Launch did not complete"
        );
        self.settle(&state);
    }

    /// Instances are gone: they leave the group and the pool
    pub fn instance_terminated(&self, done: &TerminatedInstances) {
        let mut state = self.state.lock();
        for instance_id in &done.instance_ids {
            let Some(pos) = state
                .members
                .iter()
                .position(|m| m.instance_id.as_deref() == Some(instance_id.as_str()))
            else {
                warn!(group = self.name, instance_id, "Terminated instance was not a member");
                continue;
            };
            let member = state.members.remove(pos);
            self.router
                .remove_host(&HostMatch::InstanceId(instance_id.clone()));
            state.current -= 1;
            info!(
                group = self.name,
                instance_id,
                address = member.address,
                current = state.current,
                desired = state.desired,
                "Instance terminated"
            );
        }
        self.settle(&state);
    }

    /// A termination failed: the targeted capacity is still there
    pub fn terminate_failed(&self, count: usize, error: &LifecycleError) {
        let mut state = self.state.lock();
        state.desired = (state.desired + count).min(state.current);
        warn!(
            group = self.name,
            error = %error,
            current = state.current,
            desired = state.desired,
            "Termination did not complete"
        );
        self.settle(&state);
    }

    /// Move up to `count` standby members into the pool (local groups)
    pub fn activate_standby(&self, count: usize) -> Vec<Member> {
        let mut state = self.state.lock();
        let room = self.config.max.saturating_sub(state.current);
        let mut activated = Vec::new();

        while activated.len() < count.min(room) {
            let Some(member) = state.standby.pop_front() else {
                break;
            };
            if let Err(e) = self.register(&member) {
                warn!(group = self.name, address = member.address, error = %e, "Skipping unroutable standby member");
                continue;
            }
            state.members.push(member.clone());
            activated.push(member);
        }

        state.current += activated.len();
        state.desired = state.current;
        if !activated.is_empty() {
            info!(group = self.name, activated = activated.len(), current = state.current, "Activated standby members");
        }
        activated
    }

    /// Return up to `count` of the newest members to standby (local groups)
    pub fn deactivate_members(&self, count: usize) -> Vec<Member> {
        let mut state = self.state.lock();
        let excess = state.current.saturating_sub(self.config.min).min(count);
        let split = state.members.len() - excess.min(state.members.len());
        let removed: Vec<Member> = state.members.split_off(split);

        for member in removed.iter() {
            self.deregister(member);
        }
        for member in removed.iter() {
            state.standby.push_front(member.clone());
        }

        state.current -= removed.len();
        state.desired = state.current;
        if !removed.is_empty() {
            info!(group = self.name, deactivated = removed.len(), current = state.current, "Returned members to standby");
        }
        removed
    }

    pub fn status(&self) -> GroupStatus {
        let state = self.state.lock();
        GroupStatus {
            id: self.id,
            name: self.name.clone(),
            mode: match self.config.mode {
                ScalingMode::Remote => "remote",
                ScalingMode::Local => "local",
            },
            image_id: self.config.image_id.clone(),
            instance_type: self.config.instance_type.clone(),
            min: self.config.min,
            max: self.config.max,
            current: state.current,
            desired: state.desired,
            scaling: self.is_scaling(),
            members: state.members.clone(),
            standby: state.standby.len(),
        }
    }
}

/// Every configured scaling group
pub struct ScalingGroups {
    groups: Vec<Arc<ScalingGroup>>,
}

impl ScalingGroups {
    pub fn new(
        configs: &[GroupConfig],
        router: Arc<HostRouter>,
        lifecycle: Option<Arc<LifecycleManager>>,
    ) -> Self {
        let groups = configs
            .iter()
            .enumerate()
            .map(|(id, config)| {
                ScalingGroup::new(id, config.clone(), Arc::clone(&router), lifecycle.clone())
            })
            .collect();
        Self { groups }
    }

    pub fn bootstrap(&self) -> anyhow::Result<()> {
        for group in &self.groups {
            group.bootstrap()?;
        }
        Ok(())
    }

    pub fn groups(&self) -> &[Arc<ScalingGroup>] {
        &self.groups
    }

    pub fn status(&self) -> Vec<GroupStatus> {
        self.groups.iter().map(|g| g.status()).collect()
    }
}
