//! Compute provider contract
//!
//! The control plane only needs a handful of calls from the provider: launch,
//! describe, terminate, tag, and idempotent network setup. [`ComputeProvider`]
//! captures that surface; [`HttpComputeProvider`] speaks it as JSON over HTTP.

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Provider-reported lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown => "unknown",
        }
    }
}

/// Parameters for launching exactly one instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub security_group: String,
    pub monitoring: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    pub public_address: Option<String>,
}

/// An inbound firewall rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngressRule {
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: String,
}

impl IngressRule {
    /// Every TCP port from anywhere
    pub fn open_tcp() -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: 0,
            to_port: 65535,
            cidr: "0.0.0.0/0".to_string(),
        }
    }
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Submit a launch request, returning the new instance id
    async fn launch_instance(&self, spec: &LaunchSpec) -> Result<String, ProviderError>;

    async fn describe_instance(&self, instance_id: &str)
        -> Result<InstanceDescription, ProviderError>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError>;

    async fn tag_resources(
        &self,
        resource_ids: &[String],
        tags: &HashMap<String, String>,
    ) -> Result<(), ProviderError>;

    async fn create_security_group(&self, name: &str) -> Result<(), ProviderError>;

    async fn authorize_ingress(&self, group: &str, rule: &IngressRule)
        -> Result<(), ProviderError>;

    async fn describe_instance_state(&self, instance_id: &str)
        -> Result<InstanceState, ProviderError> {
        Ok(self.describe_instance(instance_id).await?.state)
    }

    async fn describe_public_address(&self, instance_id: &str) -> Result<String, ProviderError> {
        self.describe_instance(instance_id)
            .await?
            .public_address
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidResponse(format!("instance {} has no public address", instance_id))
            })
    }
}

#[derive(Deserialize)]
struct LaunchResponse {
    instance_id: String,
}

/// JSON/HTTP adapter for a compute provider endpoint
pub struct HttpComputeProvider {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpComputeProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        subject: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        check_status(response, subject).await
    }
}

async fn check_status(
    response: reqwest::Response,
    subject: &str,
) -> Result<reqwest::Response, ProviderError> {
    match response.status() {
        s if s.is_success() => Ok(response),
        StatusCode::CONFLICT => Err(ProviderError::AlreadyExists(subject.to_string())),
        StatusCode::NOT_FOUND => Err(ProviderError::NotFound(subject.to_string())),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::Request(format!("{} ({}): {}", subject, status, body)))
        }
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    async fn launch_instance(&self, spec: &LaunchSpec) -> Result<String, ProviderError> {
        let response = self.post_json("/instances", spec, &spec.image_id).await?;
        let launched: LaunchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        debug!(instance_id = launched.instance_id, "Launch request accepted");
        Ok(launched.instance_id)
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<InstanceDescription, ProviderError> {
        let response = self
            .client
            .get(self.url(&format!("/instances/{}", instance_id)))
            .send()
            .await?;
        check_status(response, instance_id)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        let body = serde_json::json!({ "instance_ids": instance_ids });
        self.post_json("/instances/terminate", &body, &instance_ids.join(","))
            .await?;
        Ok(())
    }

    async fn tag_resources(
        &self,
        resource_ids: &[String],
        tags: &HashMap<String, String>,
    ) -> Result<(), ProviderError> {
        let body = serde_json::json!({ "resource_ids": resource_ids, "tags": tags });
        self.post_json("/tags", &body, &resource_ids.join(",")).await?;
        Ok(())
    }

    async fn create_security_group(&self, name: &str) -> Result<(), ProviderError> {
        let body = serde_json::json!({ "name": name, "description": name });
        self.post_json("/security-groups", &body, name).await?;
        Ok(())
    }

    async fn authorize_ingress(
        &self,
        group: &str,
        rule: &IngressRule,
    ) -> Result<(), ProviderError> {
        let path = format!("/security-groups/{}/ingress", urlencoding::encode(group));
        self.post_json(&path, rule, group).await?;
        Ok(())
    }
}
