//! Content-addressed golden snapshot management.
//!
//! The rendered guest bootstrap script is the specification of the golden
//! image; its content hash names the snapshot, so identical configurations
//! share one image and concurrent callers converge on a single resource.
//! The `golden:stage` tag doubles as a best-effort advisory lock: the first
//! caller to set `creating` on the target name builds, everyone else polls
//! until `ready`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::{self, BootstrapParams};
use crate::cloud::types::{
    DiskSpec, SnapshotRecord, SnapshotSpec, Tags, GOLDEN_STAGE_CREATING, GOLDEN_STAGE_READY,
    GOLDEN_TAG_CONFIG_HASH, GOLDEN_TAG_CREATED, GOLDEN_TAG_PURPOSE, GOLDEN_TAG_ROLE,
    GOLDEN_TAG_STAGE,
};
use crate::cloud::{CloudClients, Role};
use crate::error::{Error, Result};
use crate::lifecycle::{InstanceConfig, Lifecycle};
use crate::naming;

/// Upper bound on waiting for another caller's in-flight build (VM create
/// plus hydration plus snapshot).
const READY_WAIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Size of the data disk baked into the golden image.
const GOLDEN_VOLUME_GB: u32 = 64;

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub name: String,
    pub resource_id: String,
    pub content_hash: String,
    pub size_gb: u32,
}

impl SnapshotInfo {
    fn from_record(record: &SnapshotRecord, content_hash: &str) -> Self {
        Self {
            name: record.name.clone(),
            resource_id: record.resource_id.clone(),
            content_hash: content_hash.to_string(),
            size_gb: record.size_gb,
        }
    }
}

/// Runs the bootstrap script on a temp host and waits until the nested
/// guest inside it reports SSH-ready. Production wires this to the QEMU
/// control plane; tests stub it.
#[async_trait]
pub trait Hydrator: Send + Sync {
    async fn hydrate(&self, host_ip: &str, script: &str, cancel: &CancellationToken) -> Result<()>;
}

pub struct GoldenManager {
    clients: CloudClients,
    lifecycle: Lifecycle,
    params: BootstrapParams,
    hydrator: Arc<dyn Hydrator>,
}

impl GoldenManager {
    pub fn new(
        clients: CloudClients,
        lifecycle: Lifecycle,
        params: BootstrapParams,
        hydrator: Arc<dyn Hydrator>,
    ) -> Self {
        Self {
            clients,
            lifecycle,
            params,
            hydrator,
        }
    }

    /// Returns the snapshot for the current bootstrap configuration,
    /// building it if this caller wins the advisory lock. Idempotent:
    /// N concurrent calls produce exactly one snapshot resource.
    pub async fn ensure_golden_snapshot(&self, cancel: &CancellationToken) -> Result<SnapshotInfo> {
        let script = bootstrap::guest_script(&self.params);
        let hash = bootstrap::content_hash(&script);
        let name = naming::golden_snapshot(&hash);

        if let Some(info) = self.ready_snapshot(&name, &hash).await? {
            return Ok(info);
        }

        let mut lock_tags = Tags::new();
        lock_tags.insert(GOLDEN_TAG_ROLE.to_string(), Role::Golden.as_str().to_string());
        lock_tags.insert(GOLDEN_TAG_PURPOSE.to_string(), "qemu-box-image".to_string());
        lock_tags.insert(GOLDEN_TAG_CREATED.to_string(), Utc::now().to_rfc3339());
        lock_tags.insert(GOLDEN_TAG_CONFIG_HASH.to_string(), hash.clone());
        let won = self
            .clients
            .tags
            .compare_and_set(&name, GOLDEN_TAG_STAGE, None, GOLDEN_STAGE_CREATING, &lock_tags)
            .await?;

        if !won {
            info!("golden: {} already being built elsewhere, waiting", name);
            return self.wait_until_ready(&name, &hash, cancel).await;
        }

        info!("golden: building snapshot {} (hash {})", name, hash);
        match self.build(&name, &hash, &script, cancel).await {
            Ok(info) => Ok(info),
            Err(err) => {
                // Drop the lock so a later caller can start over.
                if let Err(unlock_err) = self.clients.tags.remove_tags(&name).await {
                    warn!("golden: failed to release {} lock: {}", name, unlock_err);
                }
                Err(err)
            }
        }
    }

    async fn ready_snapshot(&self, name: &str, hash: &str) -> Result<Option<SnapshotInfo>> {
        if let Some(record) = self.clients.disks.get_snapshot(name).await? {
            if record.tags.get(GOLDEN_TAG_STAGE).map(String::as_str) == Some(GOLDEN_STAGE_READY) {
                return Ok(Some(SnapshotInfo::from_record(&record, hash)));
            }
        }
        Ok(None)
    }

    async fn wait_until_ready(
        &self,
        name: &str,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotInfo> {
        let deadline = tokio::time::Instant::now() + READY_WAIT_TIMEOUT;
        loop {
            if let Some(info) = self.ready_snapshot(name, hash).await? {
                return Ok(info);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "golden snapshot {} still not ready",
                    name
                )));
            }
            // Jitter spreads concurrent waiters away from each other.
            let jitter = Duration::from_millis(rand::rng().random_range(0..2000));
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Unavailable("golden wait aborted by shutdown".into()));
                }
                _ = tokio::time::sleep(READY_POLL_INTERVAL + jitter) => {}
            }
        }
    }

    /// Builds the golden image: temp host + fresh disk, hydrate, snapshot,
    /// flip the stage tag, tear the temp resources down.
    async fn build(
        &self,
        name: &str,
        hash: &str,
        script: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotInfo> {
        let temp = self
            .lifecycle
            .create_instance(
                &InstanceConfig {
                    ssh_public_key: self.params.ssh_key.clone(),
                    role: Role::Temp,
                },
                cancel,
            )
            .await?;

        let disk_name = self.lifecycle.namer().volume(&format!("temp-{}", temp.instance_id));
        let mut disk_tags = Tags::new();
        disk_tags.insert(GOLDEN_TAG_ROLE.to_string(), Role::Temp.as_str().to_string());
        disk_tags.insert(GOLDEN_TAG_CREATED.to_string(), Utc::now().to_rfc3339());

        let result = self
            .build_on(&temp.name, &temp.private_ip, &disk_name, disk_tags, name, script, cancel)
            .await;

        // Temp resources go away on success and failure alike.
        if let Err(err) = self.lifecycle.delete_instance(&temp.name, cancel).await {
            warn!("golden: failed to delete temp instance {}: {}", temp.name, err);
        }
        if let Err(err) = self.clients.disks.delete_disk(&disk_name).await {
            warn!("golden: failed to delete temp disk {}: {}", disk_name, err);
        }

        let record = result?;
        info!("golden: snapshot {} ready", name);
        Ok(SnapshotInfo::from_record(&record, hash))
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_on(
        &self,
        temp_vm: &str,
        temp_ip: &str,
        disk_name: &str,
        disk_tags: Tags,
        snapshot_name: &str,
        script: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotRecord> {
        self.clients
            .disks
            .create_disk(DiskSpec {
                name: disk_name.to_string(),
                size_gb: GOLDEN_VOLUME_GB,
                source_snapshot: None,
                tags: disk_tags,
            })
            .await?;
        self.clients
            .compute
            .attach_data_disk(temp_vm, disk_name, crate::cloud::types::DATA_DISK_LUN)
            .await?;

        self.hydrator.hydrate(temp_ip, script, cancel).await?;

        let mut snap_tags = Tags::new();
        snap_tags.insert(GOLDEN_TAG_ROLE.to_string(), Role::Golden.as_str().to_string());
        snap_tags.insert(GOLDEN_TAG_PURPOSE.to_string(), "qemu-box-image".to_string());
        let record = self
            .clients
            .disks
            .create_snapshot(SnapshotSpec {
                name: snapshot_name.to_string(),
                source_disk: disk_name.to_string(),
                tags: snap_tags,
            })
            .await?;

        let stamped = self
            .clients
            .tags
            .compare_and_set(
                snapshot_name,
                GOLDEN_TAG_STAGE,
                Some(GOLDEN_STAGE_CREATING),
                GOLDEN_STAGE_READY,
                &Tags::new(),
            )
            .await?;
        if !stamped {
            return Err(Error::Conflict(format!(
                "golden snapshot {} lost its creating stage mid-build",
                snapshot_name
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Deployment;
    use crate::naming::Namer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHydrator {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl NoopHydrator {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Hydrator for NoopHydrator {
        async fn hydrate(&self, _host_ip: &str, _script: &str, _cancel: &CancellationToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn manager(
        hydrator: Arc<NoopHydrator>,
    ) -> (Arc<crate::cloud::InMemoryCloud>, Arc<GoldenManager>) {
        let (clients, cloud) = CloudClients::in_memory();
        let namer = Namer::new(&Deployment::new("alpha", "westeurope").unwrap());
        let lifecycle = Lifecycle::new(clients.clone(), namer);
        let params = BootstrapParams::new("ssh-ed25519 AAAA test").unwrap();
        (
            cloud,
            Arc::new(GoldenManager::new(clients, lifecycle, params, hydrator)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn builds_once_and_reuses() {
        let hydrator = Arc::new(NoopHydrator::new(Duration::ZERO));
        let (cloud, manager) = manager(hydrator.clone());
        let cancel = CancellationToken::new();

        let first = manager.ensure_golden_snapshot(&cancel).await.unwrap();
        let second = manager.ensure_golden_snapshot(&cancel).await.unwrap();
        assert_eq!(first.resource_id, second.resource_id);
        assert_eq!(hydrator.calls.load(Ordering::SeqCst), 1);
        assert!(first.name.starts_with("golden-qemu-"));

        // temp host and disk were torn down
        let leftovers: Vec<_> = cloud
            .resource_names()
            .into_iter()
            .filter(|n| !n.starts_with("golden-qemu-"))
            .collect();
        assert!(leftovers.is_empty(), "temp resources leaked: {:?}", leftovers);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_converge_on_one_snapshot() {
        let hydrator = Arc::new(NoopHydrator::new(Duration::from_secs(30)));
        let (_cloud, manager) = manager(hydrator.clone());
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                manager.ensure_golden_snapshot(&cancel).await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().resource_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(hydrator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_build_releases_the_lock() {
        struct FailingHydrator;
        #[async_trait]
        impl Hydrator for FailingHydrator {
            async fn hydrate(&self, _: &str, _: &str, _: &CancellationToken) -> Result<()> {
                Err(Error::Remote("bootstrap exited 1".into()))
            }
        }

        let (clients, _cloud) = CloudClients::in_memory();
        let namer = Namer::new(&Deployment::new("alpha", "westeurope").unwrap());
        let lifecycle = Lifecycle::new(clients.clone(), namer);
        let params = BootstrapParams::new("ssh-ed25519 AAAA test").unwrap();
        let failing = GoldenManager::new(
            clients.clone(),
            lifecycle.clone(),
            params.clone(),
            Arc::new(FailingHydrator),
        );
        let cancel = CancellationToken::new();
        let err = failing.ensure_golden_snapshot(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), "remote");

        // The lock is gone, so a healthy manager can build.
        let healthy = GoldenManager::new(
            clients,
            lifecycle,
            params,
            Arc::new(NoopHydrator::new(Duration::ZERO)),
        );
        healthy.ensure_golden_snapshot(&cancel).await.unwrap();
    }
}
