//! Load signals consumed by the autoscaler
//!
//! Remote groups read windowed statistics from a [`MetricsSource`]; local
//! groups ask each member directly through a [`LoadProbe`].

use crate::config::{LocalProbeConfig, MetricsConfig};
use crate::error::{MetricsError, ProbeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One statistic query for one dimension over a time window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricQuery {
    pub namespace: String,
    pub metric: String,
    pub statistic: String,
    pub dimension_key: String,
    pub dimension_value: String,
    pub period_secs: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// The most recent datapoint, if any
pub fn latest(datapoints: &[Datapoint]) -> Option<&Datapoint> {
    datapoints.iter().max_by_key(|d| d.timestamp)
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<Datapoint>, MetricsError>;
}

#[async_trait]
pub trait LoadProbe: Send + Sync {
    /// Instantaneous load of the member at `address`
    async fn fetch_load(&self, address: &str) -> Result<f64, ProbeError>;
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    datapoints: Vec<Datapoint>,
}

/// JSON/HTTP adapter for a metrics query endpoint
pub struct HttpMetricsSource {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMetricsSource {
    pub fn new(config: &MetricsConfig) -> Result<Self, MetricsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<Datapoint>, MetricsError> {
        let response = self
            .client
            .post(format!("{}/query", self.endpoint))
            .json(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MetricsError::Request(format!(
                "{} returned {}",
                query.metric,
                response.status()
            )));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| MetricsError::InvalidResponse(e.to_string()))?;
        Ok(body.datapoints)
    }
}

/// Reads a plain-text load figure from `http://<address>:<port><path>`
pub struct HttpLoadProbe {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl HttpLoadProbe {
    pub fn new(config: &LocalProbeConfig) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ProbeError::Invalid {
                address: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            port: config.port,
            path: config.path.clone(),
        })
    }

    fn url(&self, address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address.trim_end_matches('/'), self.path)
        } else {
            format!("http://{}:{}{}", address, self.port, self.path)
        }
    }
}

#[async_trait]
impl LoadProbe for HttpLoadProbe {
    async fn fetch_load(&self, address: &str) -> Result<f64, ProbeError> {
        let invalid = |reason: String| ProbeError::Invalid {
            address: address.to_string(),
            reason,
        };

        let response = self.client.get(self.url(address)).send().await.map_err(|e| {
            if e.is_connect() {
                ProbeError::Connect(address.to_string())
            } else {
                invalid(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(invalid(format!("status {}", response.status())));
        }

        let text = response.text().await.map_err(|e| invalid(e.to_string()))?;
        parse_load(&text).ok_or_else(|| invalid(format!("not a number: {:?}", text.trim())))
    }
}

fn parse_load(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
