//! Instance registry - the "is this loop active?" substrate
//!
//! The scheduler never keeps its own lock. It asks the registry whether a
//! record exists for the fixed loop identity and claims it with a
//! revision-checked write that only succeeds when no live record exists. Records carry an owner token so a continuation only renews a lease
//! it still holds. Leases expire on their own, which lets a fresh instance
//! start after the owning process has died.
//!
//! Two backends:
//! - `InMemoryInstanceRegistry` for single-process deployments and tests
//! - `NatsInstanceRegistry` on a JetStream KV bucket, shared across restarts

use anyhow::{Context, Result};
use async_nats::jetstream::{self, kv::Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registry entry for an active loop instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub owner: String,
    pub turn: u64,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "nextWakeAt")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_wake_at: Option<String>,
}

impl InstanceRecord {
    /// Record for the first turn of a freshly started instance
    pub fn first_turn(instance_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            owner: uuid::Uuid::new_v4().to_string(),
            turn: 1,
            started_at: now.to_rfc3339(),
            next_wake_at: None,
        }
    }

    /// Record handed to the continuation that wakes at `wake_at`
    pub fn continuation(&self, wake_at: DateTime<Utc>) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            owner: self.owner.clone(),
            turn: self.turn + 1,
            started_at: self.started_at.clone(),
            next_wake_at: Some(wake_at.to_rfc3339()),
        }
    }
}

#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Current record for the identity, if an instance is active
    async fn get(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    /// Atomically create the record; `false` if a live one already exists
    async fn try_claim(&self, record: &InstanceRecord) -> Result<bool>;

    /// Replace the record if `record.owner` still holds it; `false` otherwise
    async fn renew(&self, record: &InstanceRecord) -> Result<bool>;

    /// Remove the record if `record.owner` still holds it
    async fn release(&self, record: &InstanceRecord) -> Result<()>;
}

struct Lease {
    record: InstanceRecord,
    expires_at: Instant,
}

/// Process-local registry; records vanish with the process
pub struct InMemoryInstanceRegistry {
    lease: Duration,
    entries: Mutex<HashMap<String, Lease>>,
}

impl InMemoryInstanceRegistry {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn live<'a>(entries: &'a mut HashMap<String, Lease>, instance_id: &str) -> Option<&'a Lease> {
        let expired = entries
            .get(instance_id)
            .map(|lease| lease.expires_at <= Instant::now())
            .unwrap_or(false);
        if expired {
            debug!(instance_id = %instance_id, "Instance lease expired");
            entries.remove(instance_id);
        }
        entries.get(instance_id)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Instance registry lock poisoned"))
    }
}

#[async_trait]
impl InstanceRegistry for InMemoryInstanceRegistry {
    async fn get(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let mut entries = self.lock()?;
        Ok(Self::live(&mut entries, instance_id).map(|lease| lease.record.clone()))
    }

    async fn try_claim(&self, record: &InstanceRecord) -> Result<bool> {
        let mut entries = self.lock()?;
        if Self::live(&mut entries, &record.instance_id).is_some() {
            return Ok(false);
        }
        entries.insert(
            record.instance_id.clone(),
            Lease {
                record: record.clone(),
                expires_at: Instant::now() + self.lease,
            },
        );
        Ok(true)
    }

    async fn renew(&self, record: &InstanceRecord) -> Result<bool> {
        let mut entries = self.lock()?;
        let held = Self::live(&mut entries, &record.instance_id)
            .map(|lease| lease.record.owner == record.owner)
            .unwrap_or(false);
        if held {
            entries.insert(
                record.instance_id.clone(),
                Lease {
                    record: record.clone(),
                    expires_at: Instant::now() + self.lease,
                },
            );
        }
        Ok(held)
    }

    async fn release(&self, record: &InstanceRecord) -> Result<()> {
        let mut entries = self.lock()?;
        let held = Self::live(&mut entries, &record.instance_id)
            .map(|lease| lease.record.owner == record.owner)
            .unwrap_or(false);
        if held {
            entries.remove(&record.instance_id);
        }
        Ok(())
    }
}

/// JetStream KV registry; the bucket's max age is the lease
#[derive(Clone)]
pub struct NatsInstanceRegistry {
    kv_store: Store,
}

impl NatsInstanceRegistry {
    /// Connect to NATS and get or create the registry bucket
    pub async fn connect(
        nats_url: &str,
        creds_path: Option<&str>,
        bucket_name: &str,
        lease: Duration,
    ) -> Result<Self> {
        info!(
            "Connecting to NATS at {} for instance registry (bucket: {})",
            nats_url, bucket_name
        );

        let client = if let Some(creds_path) = creds_path {
            info!("Using credentials file: {}", creds_path);
            async_nats::ConnectOptions::new()
                .credentials_file(creds_path)
                .await
                .context("Failed to load NATS credentials")?
                .connect(nats_url)
                .await
                .context("Failed to connect to NATS with credentials")?
        } else {
            warn!("No NATS credentials provided, connecting without auth");
            async_nats::connect(nats_url)
                .await
                .context("Failed to connect to NATS")?
        };

        let jetstream = jetstream::new(client);

        let kv_store = match jetstream.get_key_value(bucket_name).await {
            Ok(store) => {
                info!("Using existing KV bucket: {}", bucket_name);
                match store.status().await {
                    Ok(status) if status.max_age() != lease => warn!(
                        bucket = %bucket_name,
                        bucket_max_age_secs = status.max_age().as_secs(),
                        lease_secs = lease.as_secs(),
                        "Existing bucket max age differs from configured lease; bucket value wins"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(
                        bucket = %bucket_name,
                        error = %e,
                        "Failed to read bucket status; cannot verify lease"
                    ),
                }
                store
            }
            Err(_) => {
                info!("Creating new KV bucket: {}", bucket_name);
                let config = jetstream::kv::Config {
                    bucket: bucket_name.to_string(),
                    description: "Tier autoscaler active instance leases".to_string(),
                    history: 1,
                    max_age: lease,
                    ..Default::default()
                };
                jetstream
                    .create_key_value(config)
                    .await
                    .context("Failed to create instance registry KV bucket")?
            }
        };

        Ok(Self { kv_store })
    }

    fn encode(record: &InstanceRecord) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context("Failed to serialize instance record")
    }

    /// Current record and its revision, skipping delete markers
    async fn entry(&self, instance_id: &str) -> Result<Option<(InstanceRecord, u64)>> {
        let entry = self
            .kv_store
            .entry(instance_id)
            .await
            .with_context(|| format!("Failed to read instance record {}", instance_id))?;

        match entry {
            Some(entry) if entry.operation == jetstream::kv::Operation::Put => {
                let record = serde_json::from_slice::<InstanceRecord>(&entry.value)
                    .with_context(|| format!("Failed to parse instance record {}", instance_id))?;
                Ok(Some((record, entry.revision)))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl InstanceRegistry for NatsInstanceRegistry {
    async fn get(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.entry(instance_id).await?.map(|(record, _)| record))
    }

    async fn try_claim(&self, record: &InstanceRecord) -> Result<bool> {
        let key = &record.instance_id;

        // Revision 0 only succeeds while the key has no message at all
        let payload = Self::encode(record)?;
        if self.kv_store.update(key, payload.into(), 0).await.is_ok() {
            debug!(instance_id = %key, "Claimed instance record");
            return Ok(true);
        }

        let entry = self
            .kv_store
            .entry(key.as_str())
            .await
            .with_context(|| format!("Failed to read instance record {}", key))?;

        match entry {
            Some(entry) if !matches!(entry.operation, jetstream::kv::Operation::Put) => {
                // Released or purged: claim on top of the tombstone's revision
                let payload = Self::encode(record)?;
                match self
                    .kv_store
                    .update(key, payload.into(), entry.revision)
                    .await
                {
                    Ok(_) => {
                        debug!(instance_id = %key, "Claimed released instance record");
                        Ok(true)
                    }
                    Err(e) => {
                        debug!(instance_id = %key, error = %e, "Lost claim race on released record");
                        Ok(false)
                    }
                }
            }
            Some(_) => Ok(false),
            None => {
                warn!(instance_id = %key, "Claim rejected but no record found");
                Ok(false)
            }
        }
    }

    async fn renew(&self, record: &InstanceRecord) -> Result<bool> {
        let Some((current, revision)) = self.entry(&record.instance_id).await? else {
            return Ok(false);
        };
        if current.owner != record.owner {
            return Ok(false);
        }

        let payload = Self::encode(record)?;
        match self
            .kv_store
            .update(&record.instance_id, payload.into(), revision)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(
                    instance_id = %record.instance_id,
                    error = %e,
                    "Instance record changed underneath renewal"
                );
                Ok(false)
            }
        }
    }

    async fn release(&self, record: &InstanceRecord) -> Result<()> {
        if let Some((current, _)) = self.entry(&record.instance_id).await? {
            if current.owner == record.owner {
                self.kv_store
                    .delete(&record.instance_id)
                    .await
                    .context("Failed to delete instance record")?;
            }
        }
        Ok(())
    }
}
