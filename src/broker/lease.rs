//! Lease acquisition and release.
//!
//! A lease pairs one `free` instance with one `free` volume for a session.
//! Claiming races against concurrent sessions and against the pool's
//! scale-down through the same tag compare-and-set; the loser simply
//! re-reads and retries. Nothing is ever recycled: release deletes both
//! resources, and the pool restores its reserve on the next tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cloud::types::{Tags, TAG_USER_ID};
use crate::cloud::Status;
use crate::error::{Error, Result};
use crate::events::{Event, EventLogger, EventType};
use crate::inventory::{Inventory, PoolResource, ResourceKind};
use crate::lifecycle::Lifecycle;

/// Claim attempts before giving up on a kind of resource.
const LEASE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct Lease {
    pub session_id: String,
    pub user_key: String,
    /// User-chosen box name, recorded for audit only
    pub box_name: String,
    pub instance: PoolResource,
    pub volume: PoolResource,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LeaseManager {
    inventory: Arc<Inventory>,
    lifecycle: Lifecycle,
    events: EventLogger,
}

impl LeaseManager {
    pub fn new(inventory: Arc<Inventory>, lifecycle: Lifecycle, events: EventLogger) -> Self {
        Self {
            inventory,
            lifecycle,
            events,
        }
    }

    /// Atomically claims one free instance and one free volume, LUN-attached
    /// together. `Error::Unavailable` when the pool cannot satisfy the lease
    /// after the retry budget.
    pub async fn acquire(
        &self,
        user_key: &str,
        box_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        let session_id = Uuid::new_v4().to_string();
        let instance = self.claim_instance(user_key).await?;

        let volume = match self.claim_volume(&instance, user_key, cancel).await {
            Ok(volume) => volume,
            Err(err) => {
                // The instance is already `connected` and can never return
                // to `free`; tear it down so it does not leak.
                warn!(
                    "lease: volume claim failed ({}), discarding instance {}",
                    err, instance.name
                );
                if let Err(delete_err) = self.lifecycle.delete_instance(&instance.name, cancel).await
                {
                    warn!(
                        "lease: failed to discard instance {}: {}",
                        instance.name, delete_err
                    );
                }
                return Err(err);
            }
        };

        let lease = Lease {
            session_id: session_id.clone(),
            user_key: user_key.to_string(),
            box_name: box_name.to_string(),
            instance,
            volume,
            started_at: Utc::now(),
        };
        info!(
            "lease {}: instance {} + volume {} for {}",
            lease.session_id, lease.instance.name, lease.volume.name, user_key
        );
        self.events
            .write(
                Event::new(EventType::Lease)
                    .session(&lease.session_id)
                    .boxed(&lease.instance.id)
                    .user(user_key)
                    .details(serde_json::json!({
                        "boxName": box_name,
                        "instance": lease.instance.name,
                        "volume": lease.volume.name,
                    })),
            )
            .await;
        Ok(lease)
    }

    async fn claim_instance(&self, user_key: &str) -> Result<PoolResource> {
        for attempt in 1..=LEASE_ATTEMPTS {
            let candidates = self.inventory.oldest_free(ResourceKind::Instance, 1).await?;
            let Some(candidate) = candidates.into_iter().next() else {
                warn!("lease: no free instance (attempt {})", attempt);
                continue;
            };
            let mut extra = Tags::new();
            extra.insert(TAG_USER_ID.to_string(), user_key.to_string());
            match self
                .lifecycle
                .update_instance_status(&candidate.name, Status::Free, Status::Connected, extra)
                .await
            {
                Ok(()) => return Ok(candidate),
                // Lost the tag race or the scale-down got there first:
                // re-read and try the next candidate.
                Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Unavailable(format!(
            "no free instance after {} attempts",
            LEASE_ATTEMPTS
        )))
    }

    async fn claim_volume(
        &self,
        instance: &PoolResource,
        user_key: &str,
        cancel: &CancellationToken,
    ) -> Result<PoolResource> {
        for attempt in 1..=LEASE_ATTEMPTS {
            let candidates = self.inventory.oldest_free(ResourceKind::Volume, 1).await?;
            let Some(candidate) = candidates.into_iter().next() else {
                warn!("lease: no free volume (attempt {})", attempt);
                continue;
            };
            match self.lifecycle.attach(&instance.name, &candidate.name, cancel).await {
                Ok(()) => {
                    if let Err(err) = self
                        .lifecycle
                        .clients()
                        .tags
                        .put_tag(&candidate.name, TAG_USER_ID, user_key)
                        .await
                    {
                        warn!("lease: failed to stamp {} lessee: {}", candidate.name, err);
                    }
                    return Ok(candidate);
                }
                Err(Error::Conflict(_)) | Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Unavailable(format!(
            "no free volume after {} attempts",
            LEASE_ATTEMPTS
        )))
    }

    /// Ends a session. The instance and its volume are always deleted;
    /// a leased box is never returned to the pool.
    pub async fn release(&self, lease: &Lease, cancel: &CancellationToken) -> Result<()> {
        self.lifecycle.delete_instance(&lease.instance.name, cancel).await?;
        self.lifecycle.delete_volume(&lease.volume.name, cancel).await?;
        info!("lease {}: released", lease.session_id);
        self.events
            .write(
                Event::new(EventType::Release)
                    .session(&lease.session_id)
                    .boxed(&lease.instance.id)
                    .user(&lease.user_key)
                    .details(serde_json::json!({
                        "instance": lease.instance.name,
                        "volume": lease.volume.name,
                    })),
            )
            .await;
        Ok(())
    }
}
