//! Provider traits and implementations
//!
//! The worker talks to the managed resource through two collaborators: a
//! read-only `MetricsProvider` and a mutating `ProvisioningProvider`. Both are
//! obtained per cycle from a `ClientFactory`, which is where credentials are
//! acquired. The HTTP implementation speaks a small JSON API; the dry-run
//! provisioner logs updates instead of applying them.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Current provisioned shape of the managed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescription {
    pub tier_name: String,
    pub capacity_units: u32,
}

impl ResourceDescription {
    pub fn new(tier_name: &str, capacity_units: u32) -> Self {
        Self {
            tier_name: tier_name.to_string(),
            capacity_units,
        }
    }
}

impl std::fmt::Display for ResourceDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.tier_name, self.capacity_units)
    }
}

/// Named usage counter reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaMetric {
    pub name: String,
    pub current_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

/// Envelope returned by the quota metrics endpoint
#[derive(Debug, Deserialize)]
struct QuotaMetricList {
    value: Vec<QuotaMetric>,
}

/// Read-only view of the managed resource
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn get_description(&self, resource_id: &str) -> Result<ResourceDescription>;

    async fn get_metrics(&self, resource_id: &str) -> Result<Vec<QuotaMetric>>;
}

/// Applies a new tier and capacity to the managed resource
#[async_trait]
pub trait ProvisioningProvider: Send + Sync {
    async fn update(&self, resource_id: &str, target: &ResourceDescription) -> Result<()>;
}

/// Provider handles for a single cycle
#[derive(Clone)]
pub struct ProviderClients {
    pub metrics: Arc<dyn MetricsProvider>,
    pub provisioning: Arc<dyn ProvisioningProvider>,
}

/// Acquires provider clients, including any credentials they need
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn acquire(&self) -> Result<ProviderClients>;
}

/// Factory handing out the same pre-built clients every cycle
pub struct FixedClients {
    clients: ProviderClients,
}

impl FixedClients {
    pub fn new(
        metrics: Arc<dyn MetricsProvider>,
        provisioning: Arc<dyn ProvisioningProvider>,
    ) -> Self {
        Self {
            clients: ProviderClients {
                metrics,
                provisioning,
            },
        }
    }
}

#[async_trait]
impl ClientFactory for FixedClients {
    async fn acquire(&self) -> Result<ProviderClients> {
        Ok(self.clients.clone())
    }
}

/// Provisioner that only logs the update it would have applied
pub struct DryRunProvisioner;

#[async_trait]
impl ProvisioningProvider for DryRunProvisioner {
    async fn update(&self, resource_id: &str, target: &ResourceDescription) -> Result<()> {
        info!(
            resource_id = %resource_id,
            tier = %target.tier_name,
            capacity_units = target.capacity_units,
            "Provisioning update skipped (dry-run mode)"
        );
        Ok(())
    }
}

/// Where the bearer token for the provider API comes from
#[derive(Debug, Clone)]
pub enum Credentials {
    Token(String),
    TokenFile(PathBuf),
    Missing,
}

impl Credentials {
    async fn resolve(&self) -> Result<String> {
        let token = match self {
            Credentials::Token(token) => token.clone(),
            Credentials::TokenFile(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read API token file {}", path.display()))?,
            Credentials::Missing => bail!("No API token or token file configured"),
        };

        let token = token.trim().to_string();
        if token.is_empty() {
            bail!("Configured API token is empty");
        }
        Ok(token)
    }
}

/// HTTP client for the provider's resource API
pub struct HttpResourceClient {
    endpoint: String,
    token: String,
    client: reqwest::Client,
}

impl HttpResourceClient {
    /// Create a new HTTP resource client
    pub fn new(endpoint: String, token: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn resource_url(&self, resource_id: &str) -> String {
        format!("{}/resources/{}", self.endpoint, resource_id)
    }

    async fn check_status(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());
        bail!("{} returned error status {}: {}", action, status, body)
    }
}

#[async_trait]
impl MetricsProvider for HttpResourceClient {
    async fn get_description(&self, resource_id: &str) -> Result<ResourceDescription> {
        let url = self.resource_url(resource_id);
        debug!(url = %url, "Fetching resource description");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Resource description request failed")?;

        Self::check_status(response, "Resource description request")
            .await?
            .json::<ResourceDescription>()
            .await
            .context("Failed to decode resource description")
    }

    async fn get_metrics(&self, resource_id: &str) -> Result<Vec<QuotaMetric>> {
        let url = format!("{}/quotaMetrics", self.resource_url(resource_id));
        debug!(url = %url, "Fetching quota metrics");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Quota metrics request failed")?;

        let list = Self::check_status(response, "Quota metrics request")
            .await?
            .json::<QuotaMetricList>()
            .await
            .context("Failed to decode quota metrics")?;

        Ok(list.value)
    }
}

#[async_trait]
impl ProvisioningProvider for HttpResourceClient {
    async fn update(&self, resource_id: &str, target: &ResourceDescription) -> Result<()> {
        let url = self.resource_url(resource_id);

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(target)
            .send()
            .await
            .context("Provisioning request failed")?;

        let response = Self::check_status(response, "Provisioning request").await?;
        info!(
            resource_id = %resource_id,
            target = %target,
            status = %response.status(),
            "Provisioning update accepted"
        );
        Ok(())
    }
}

/// Builds an `HttpResourceClient` per cycle, re-reading credentials each time
pub struct HttpClientFactory {
    endpoint: String,
    credentials: Credentials,
    timeout_secs: u64,
    dry_run: bool,
}

impl HttpClientFactory {
    pub fn new(endpoint: String, credentials: Credentials, timeout_secs: u64, dry_run: bool) -> Self {
        Self {
            endpoint,
            credentials,
            timeout_secs,
            dry_run,
        }
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    async fn acquire(&self) -> Result<ProviderClients> {
        let token = self.credentials.resolve().await?;
        let client = Arc::new(HttpResourceClient::new(
            self.endpoint.clone(),
            token,
            self.timeout_secs,
        )?);

        let provisioning: Arc<dyn ProvisioningProvider> = if self.dry_run {
            Arc::new(DryRunProvisioner)
        } else {
            client.clone()
        };

        Ok(ProviderClients {
            metrics: client,
            provisioning,
        })
    }
}
