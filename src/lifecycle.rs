//! Idempotent create/update/delete of pool resources.
//!
//! Every mutation flows through the retry/poll primitives with explicit
//! deadlines. Creation failures unwind already-created prefix resources
//! best-effort; deletions tolerate absence so a crashed tick can be re-run
//! verbatim.

use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bootstrap;
use crate::cloud::types::{
    DiskSpec, NicSpec, NsgRule, NsgSpec, Tags, VmSpec, DATA_DISK_LUN, TAG_CREATED, TAG_LAST_USED,
    TAG_ROLE, TAG_STATUS, TAG_VOLUME_ID,
};
use crate::cloud::{CloudClients, Role, Status};
use crate::config::{BASTION_SUBNET, GUEST_SSH_PORT, VM_CREATE_TIMEOUT, VOLUME_CREATE_TIMEOUT};
use crate::error::{Error, Result};
use crate::naming::Namer;
use crate::registry::Registry;
use crate::retry::{poll_until_done, retry, RetryOptions};

/// How long a deleted VM may stay visible before deletion is declared stuck.
const VM_DELETE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const NETWORK_OP_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const CLOUD_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Admin key installed on the host VM
    pub ssh_public_key: String,
    /// `Role::Instance` for pool members, `Role::Temp` for golden builds
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub size_gb: u32,
    /// Golden snapshot to hydrate from; `None` creates an empty disk
    pub source_snapshot: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub name: String,
    pub resource_id: String,
    pub private_ip: String,
}

#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub name: String,
    pub resource_id: String,
    pub size_gb: u32,
}

fn base_tags(role: Role, status: Status) -> Tags {
    let now = Utc::now().to_rfc3339();
    let mut tags = Tags::new();
    tags.insert(TAG_ROLE.to_string(), role.as_str().to_string());
    tags.insert(TAG_STATUS.to_string(), status.as_str().to_string());
    tags.insert(TAG_CREATED.to_string(), now.clone());
    tags.insert(TAG_LAST_USED.to_string(), now);
    tags
}

/// Legal instance transitions. Nothing ever returns to `free`: a used
/// resource is deleted, never recycled.
fn instance_transition_allowed(from: Status, to: Status) -> bool {
    matches!(
        (from, to),
        (Status::Free, Status::Connected) | (Status::Free, Status::Deallocated)
    )
}

/// Legal volume transitions.
fn volume_transition_allowed(from: Status, to: Status) -> bool {
    matches!((from, to), (Status::Free, Status::Attached))
}

#[derive(Clone)]
pub struct Lifecycle {
    clients: CloudClients,
    namer: Namer,
    registry: Registry,
}

impl Lifecycle {
    pub fn new(clients: CloudClients, namer: Namer) -> Self {
        let registry = Registry::new(clients.tables.clone());
        Self {
            clients,
            namer,
            registry,
        }
    }

    pub fn namer(&self) -> &Namer {
        &self.namer
    }

    pub fn clients(&self) -> &CloudClients {
        &self.clients
    }

    /// Inbound rules for a per-instance NSG: SSH and the guest port from the
    /// bastion subnet, ICMP from the bastion subnet, deny everything else.
    fn instance_nsg_rules() -> Vec<NsgRule> {
        vec![
            NsgRule {
                name: "allow-bastion-ssh".to_string(),
                priority: 100,
                inbound: true,
                allow: true,
                protocol: "Tcp".to_string(),
                source_prefix: BASTION_SUBNET.to_string(),
                dest_port: "22".to_string(),
            },
            NsgRule {
                name: "allow-bastion-guest-ssh".to_string(),
                priority: 110,
                inbound: true,
                allow: true,
                protocol: "Tcp".to_string(),
                source_prefix: BASTION_SUBNET.to_string(),
                dest_port: GUEST_SSH_PORT.to_string(),
            },
            NsgRule {
                name: "allow-bastion-icmp".to_string(),
                priority: 120,
                inbound: true,
                allow: true,
                protocol: "Icmp".to_string(),
                source_prefix: BASTION_SUBNET.to_string(),
                dest_port: "*".to_string(),
            },
            NsgRule {
                name: "deny-all-inbound".to_string(),
                priority: 4096,
                inbound: true,
                allow: false,
                protocol: "*".to_string(),
                source_prefix: "*".to_string(),
                dest_port: "*".to_string(),
            },
        ]
    }

    /// Creates a host VM with its NSG and NIC, tagged `free`.
    ///
    /// On failure the already-created prefix resources are deleted
    /// best-effort; a leftover is still cleaned up by a later tick because
    /// it carries no pool tags.
    pub async fn create_instance(
        &self,
        config: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<InstanceInfo> {
        if config.ssh_public_key.trim().is_empty() {
            return Err(Error::Invalid("instance config: empty ssh key".into()));
        }
        if !matches!(config.role, Role::Instance | Role::Temp) {
            return Err(Error::Invalid(format!(
                "instance config: role {} is not an instance role",
                config.role.as_str()
            )));
        }

        let instance_id = Uuid::new_v4().to_string();
        let vm_name = match config.role {
            Role::Temp => self.namer.temp_vm(&instance_id),
            _ => self.namer.box_vm(&instance_id),
        };
        let nsg_name = self.namer.nsg(&instance_id);
        let nic_name = self.namer.nic(&instance_id);
        let os_disk = self.namer.os_disk(&instance_id);

        let result = self
            .create_instance_inner(config, &instance_id, &vm_name, &nsg_name, &nic_name, &os_disk, cancel)
            .await;
        if let Err(err) = &result {
            warn!(
                "lifecycle: create_instance {} failed ({}), unwinding prefix resources",
                vm_name, err
            );
            self.cleanup_instance_prefix(&vm_name, &os_disk, &nic_name, &nsg_name)
                .await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_instance_inner(
        &self,
        config: &InstanceConfig,
        instance_id: &str,
        vm_name: &str,
        nsg_name: &str,
        nic_name: &str,
        os_disk: &str,
        cancel: &CancellationToken,
    ) -> Result<InstanceInfo> {
        let nsg_opts = RetryOptions::new(NETWORK_OP_TIMEOUT, CLOUD_RETRY_INTERVAL, "create_nsg");
        retry(&nsg_opts, cancel, || {
            self.clients.network.create_nsg(NsgSpec {
                name: nsg_name.to_string(),
                rules: Self::instance_nsg_rules(),
            })
        })
        .await?;

        let nic_opts = RetryOptions::new(NETWORK_OP_TIMEOUT, CLOUD_RETRY_INTERVAL, "create_nic");
        let nic = retry(&nic_opts, cancel, || {
            self.clients.network.create_nic(NicSpec {
                name: nic_name.to_string(),
                subnet: self.namer.boxes_subnet(),
                nsg: nsg_name.to_string(),
            })
        })
        .await?;

        let tags = base_tags(config.role, Status::Free);
        let vm_opts = RetryOptions::new(VM_CREATE_TIMEOUT, Duration::from_secs(10), "create_vm");
        let record = retry(&vm_opts, cancel, || {
            self.clients.compute.create_vm(VmSpec {
                name: vm_name.to_string(),
                computer_name: self.namer.computer_name(instance_id),
                nic: nic_name.to_string(),
                os_disk: os_disk.to_string(),
                user_data: bootstrap::host_user_data(&config.ssh_public_key),
                ssh_public_key: config.ssh_public_key.clone(),
                tags: tags.clone(),
            })
        })
        .await?;

        self.registry.record(config.role, vm_name, &tags).await;
        info!(
            "lifecycle: created {} {} at {}",
            config.role.as_str(),
            vm_name,
            nic.private_ip
        );
        Ok(InstanceInfo {
            instance_id: instance_id.to_string(),
            name: vm_name.to_string(),
            resource_id: record.resource_id,
            private_ip: record.private_ip,
        })
    }

    async fn cleanup_instance_prefix(
        &self,
        vm_name: &str,
        os_disk: &str,
        nic_name: &str,
        nsg_name: &str,
    ) {
        if let Err(err) = self.clients.compute.delete_vm(vm_name).await {
            warn!("lifecycle: cleanup of vm {} failed: {}", vm_name, err);
        }
        if let Err(err) = self.clients.disks.delete_disk(os_disk).await {
            warn!("lifecycle: cleanup of os disk {} failed: {}", os_disk, err);
        }
        if let Err(err) = self.clients.network.delete_nic(nic_name).await {
            warn!("lifecycle: cleanup of nic {} failed: {}", nic_name, err);
        }
        if let Err(err) = self.clients.network.delete_nsg(nsg_name).await {
            warn!("lifecycle: cleanup of nsg {} failed: {}", nsg_name, err);
        }
    }

    /// Deletes a box VM and everything created with it: VM first, then once
    /// the platform reports it gone, OS disk, NIC and NSG in that order.
    /// Absent resources are not errors.
    pub async fn delete_instance(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let instance_id = self
            .namer
            .instance_id(name)
            .ok_or_else(|| Error::Invalid(format!("{} is not an instance of this deployment", name)))?
            .to_string();

        let delete_opts = RetryOptions::new(VM_DELETE_TIMEOUT, CLOUD_RETRY_INTERVAL, "delete_vm");
        retry(&delete_opts, cancel, || self.clients.compute.delete_vm(name)).await?;
        poll_until_done(VM_DELETE_TIMEOUT, cancel, "delete_vm", || async {
            Ok(self.clients.compute.get_vm(name).await?.is_none())
        })
        .await?;

        let os_disk_name = self.namer.os_disk(&instance_id);
        let disk_opts = RetryOptions::new(NETWORK_OP_TIMEOUT, CLOUD_RETRY_INTERVAL, "delete_os_disk");
        retry(&disk_opts, cancel, || {
            self.clients.disks.delete_disk(&os_disk_name)
        })
        .await?;
        let nic_name = self.namer.nic(&instance_id);
        let nic_opts = RetryOptions::new(NETWORK_OP_TIMEOUT, CLOUD_RETRY_INTERVAL, "delete_nic");
        retry(&nic_opts, cancel, || {
            self.clients.network.delete_nic(&nic_name)
        })
        .await?;
        let nsg_name = self.namer.nsg(&instance_id);
        let nsg_opts = RetryOptions::new(NETWORK_OP_TIMEOUT, CLOUD_RETRY_INTERVAL, "delete_nsg");
        retry(&nsg_opts, cancel, || {
            self.clients.network.delete_nsg(&nsg_name)
        })
        .await?;

        info!("lifecycle: deleted instance {}", name);
        Ok(())
    }

    /// Powers off an idle free instance without deleting it.
    pub async fn deallocate(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.update_instance_status(name, Status::Free, Status::Deallocated, Tags::new())
            .await?;
        let opts = RetryOptions::new(NETWORK_OP_TIMEOUT, CLOUD_RETRY_INTERVAL, "deallocate_vm");
        retry(&opts, cancel, || self.clients.compute.deallocate_vm(name)).await?;
        info!("lifecycle: deallocated instance {}", name);
        Ok(())
    }

    /// Creates an empty data volume tagged `free`.
    pub async fn create_volume(
        &self,
        config: &VolumeConfig,
        cancel: &CancellationToken,
    ) -> Result<VolumeInfo> {
        if config.size_gb == 0 {
            return Err(Error::Invalid("volume config: zero size".into()));
        }
        let volume_id = Uuid::new_v4().to_string();
        let name = self.namer.volume(&volume_id);
        let mut tags = base_tags(Role::Volume, Status::Free);
        tags.insert(TAG_VOLUME_ID.to_string(), volume_id.clone());
        let opts = RetryOptions::new(VOLUME_CREATE_TIMEOUT, CLOUD_RETRY_INTERVAL, "create_volume");
        let record = retry(&opts, cancel, || {
            self.clients.disks.create_disk(DiskSpec {
                name: name.clone(),
                size_gb: config.size_gb,
                source_snapshot: config.source_snapshot.clone(),
                tags: tags.clone(),
            })
        })
        .await?;
        self.registry.record(Role::Volume, &name, &tags).await;
        info!("lifecycle: created volume {} ({} GB)", name, record.size_gb);
        Ok(VolumeInfo {
            volume_id,
            name,
            resource_id: record.resource_id,
            size_gb: record.size_gb,
        })
    }

    /// Creates a volume hydrated from the golden snapshot.
    pub async fn create_volume_from_snapshot(
        &self,
        snapshot_name: &str,
        size_gb: u32,
        cancel: &CancellationToken,
    ) -> Result<VolumeInfo> {
        self.create_volume(
            &VolumeConfig {
                size_gb,
                source_snapshot: Some(snapshot_name.to_string()),
            },
            cancel,
        )
        .await
    }

    /// Deletes a data volume. Absence is not an error.
    pub async fn delete_volume(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let opts = RetryOptions::new(NETWORK_OP_TIMEOUT, CLOUD_RETRY_INTERVAL, "delete_volume");
        retry(&opts, cancel, || self.clients.disks.delete_disk(name)).await?;
        info!("lifecycle: deleted volume {}", name);
        Ok(())
    }

    /// LUN-attaches a free volume to an instance and records the binding in
    /// both tag blobs. Rejected when either side is already bound.
    pub async fn attach(
        &self,
        instance_name: &str,
        volume_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let vm = self
            .clients
            .compute
            .get_vm(instance_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {}", instance_name)))?;
        let disk = self
            .clients
            .disks
            .get_disk(volume_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_name)))?;

        if vm.tags.contains_key(TAG_VOLUME_ID) || vm.data_disk.is_some() {
            return Err(Error::Conflict(format!(
                "instance {} already has a volume",
                instance_name
            )));
        }
        match disk.tags.get(TAG_STATUS).map(String::as_str) {
            Some("free") => {}
            other => {
                return Err(Error::Conflict(format!(
                    "volume {} is not free (status {:?})",
                    volume_name, other
                )));
            }
        }

        let opts = RetryOptions::new(NETWORK_OP_TIMEOUT, CLOUD_RETRY_INTERVAL, "attach_disk");
        retry(&opts, cancel, || {
            self.clients
                .compute
                .attach_data_disk(instance_name, volume_name, DATA_DISK_LUN)
        })
        .await?;

        let volume_id = self
            .namer
            .volume_id(volume_name)
            .unwrap_or(volume_name)
            .to_string();
        self.update_volume_status(volume_name, Status::Free, Status::Attached, Tags::new())
            .await?;
        self.clients
            .tags
            .put_tag(instance_name, TAG_VOLUME_ID, &volume_id)
            .await?;
        self.clients
            .tags
            .put_tag(instance_name, TAG_LAST_USED, &Utc::now().to_rfc3339())
            .await?;

        info!(
            "lifecycle: attached volume {} to instance {} at lun {}",
            volume_name, instance_name, DATA_DISK_LUN
        );
        Ok(())
    }

    /// Compare-and-set status transition on an instance tag blob, stamping
    /// `shellbox:lastused`. `extra` tags land in the same blob write.
    pub async fn update_instance_status(
        &self,
        name: &str,
        expected: Status,
        new: Status,
        mut extra: Tags,
    ) -> Result<()> {
        if !instance_transition_allowed(expected, new) {
            return Err(Error::Invalid(format!(
                "instance status cannot move {} -> {}",
                expected.as_str(),
                new.as_str()
            )));
        }
        if self.clients.compute.get_vm(name).await?.is_none() {
            return Err(Error::NotFound(format!("instance {}", name)));
        }
        extra.insert(TAG_LAST_USED.to_string(), Utc::now().to_rfc3339());
        let won = self
            .clients
            .tags
            .compare_and_set(
                name,
                TAG_STATUS,
                Some(expected.as_str()),
                new.as_str(),
                &extra,
            )
            .await?;
        if !won {
            return Err(Error::Conflict(format!(
                "instance {} left status {}",
                name,
                expected.as_str()
            )));
        }
        if let Some(tags) = self.clients.tags.get_tags(name).await? {
            self.registry.record(Role::Instance, name, &tags).await;
        }
        Ok(())
    }

    /// Compare-and-set status transition on a volume tag blob.
    pub async fn update_volume_status(
        &self,
        name: &str,
        expected: Status,
        new: Status,
        mut extra: Tags,
    ) -> Result<()> {
        if !volume_transition_allowed(expected, new) {
            return Err(Error::Invalid(format!(
                "volume status cannot move {} -> {}",
                expected.as_str(),
                new.as_str()
            )));
        }
        if self.clients.disks.get_disk(name).await?.is_none() {
            return Err(Error::NotFound(format!("volume {}", name)));
        }
        extra.insert(TAG_LAST_USED.to_string(), Utc::now().to_rfc3339());
        let won = self
            .clients
            .tags
            .compare_and_set(
                name,
                TAG_STATUS,
                Some(expected.as_str()),
                new.as_str(),
                &extra,
            )
            .await?;
        if !won {
            return Err(Error::Conflict(format!(
                "volume {} left status {}",
                name,
                expected.as_str()
            )));
        }
        if let Some(tags) = self.clients.tags.get_tags(name).await? {
            self.registry.record(Role::Volume, name, &tags).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::types::TAG_USER_ID;
    use crate::config::Deployment;

    const KEY: &str = "ssh-ed25519 AAAA test";

    fn setup() -> (
        std::sync::Arc<crate::cloud::InMemoryCloud>,
        Lifecycle,
        CancellationToken,
    ) {
        let (clients, cloud) = CloudClients::in_memory();
        let namer = Namer::new(&Deployment::new("alpha", "westeurope").unwrap());
        (cloud, Lifecycle::new(clients, namer), CancellationToken::new())
    }

    fn instance_config() -> InstanceConfig {
        InstanceConfig {
            ssh_public_key: KEY.to_string(),
            role: Role::Instance,
        }
    }

    #[tokio::test]
    async fn create_instance_tags_it_free() {
        let (cloud, lifecycle, cancel) = setup();
        let info = lifecycle.create_instance(&instance_config(), &cancel).await.unwrap();

        use crate::cloud::TagStore;
        let tags = cloud.get_tags(&info.name).await.unwrap().unwrap();
        assert_eq!(tags.get(TAG_ROLE).unwrap(), "instance");
        assert_eq!(tags.get(TAG_STATUS).unwrap(), "free");
        assert!(tags.contains_key(TAG_CREATED));
        assert!(info.private_ip.starts_with("10.1."));
    }

    #[tokio::test]
    async fn create_instance_rejects_empty_key() {
        let (_cloud, lifecycle, cancel) = setup();
        let err = lifecycle
            .create_instance(
                &InstanceConfig {
                    ssh_public_key: "  ".into(),
                    role: Role::Instance,
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_unwinds_prefix_resources() {
        let (cloud, lifecycle, cancel) = setup();
        // NSG and NIC succeed, the VM create keeps failing past its retries.
        for _ in 0..200 {
            cloud.inject_failure("create_vm");
        }
        let err = lifecycle.create_instance(&instance_config(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(cloud.resource_names().is_empty(), "prefix resources leaked");
    }

    #[tokio::test]
    async fn delete_instance_leaves_no_orphans() {
        let (cloud, lifecycle, cancel) = setup();
        let info = lifecycle.create_instance(&instance_config(), &cancel).await.unwrap();
        lifecycle.delete_instance(&info.name, &cancel).await.unwrap();
        assert!(cloud.resource_names().is_empty());
        // and a second delete is a no-op
        lifecycle.delete_instance(&info.name, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn attach_binds_both_tag_blobs() {
        let (cloud, lifecycle, cancel) = setup();
        let instance = lifecycle.create_instance(&instance_config(), &cancel).await.unwrap();
        let volume = lifecycle
            .create_volume(
                &VolumeConfig {
                    size_gb: 64,
                    source_snapshot: None,
                },
                &cancel,
            )
            .await
            .unwrap();

        lifecycle.attach(&instance.name, &volume.name, &cancel).await.unwrap();

        use crate::cloud::TagStore;
        let vm_tags = cloud.get_tags(&instance.name).await.unwrap().unwrap();
        assert_eq!(vm_tags.get(TAG_VOLUME_ID).unwrap(), &volume.volume_id);
        let disk_tags = cloud.get_tags(&volume.name).await.unwrap().unwrap();
        assert_eq!(disk_tags.get(TAG_STATUS).unwrap(), "attached");
    }

    #[tokio::test]
    async fn attach_rejects_bound_sides() {
        let (_cloud, lifecycle, cancel) = setup();
        let instance = lifecycle.create_instance(&instance_config(), &cancel).await.unwrap();
        let other = lifecycle.create_instance(&instance_config(), &cancel).await.unwrap();
        let volume = lifecycle
            .create_volume(
                &VolumeConfig {
                    size_gb: 64,
                    source_snapshot: None,
                },
                &cancel,
            )
            .await
            .unwrap();
        let second = lifecycle
            .create_volume(
                &VolumeConfig {
                    size_gb: 64,
                    source_snapshot: None,
                },
                &cancel,
            )
            .await
            .unwrap();

        lifecycle.attach(&instance.name, &volume.name, &cancel).await.unwrap();
        let err = lifecycle.attach(&other.name, &volume.name, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let err = lifecycle.attach(&instance.name, &second.name, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn status_cas_loses_cleanly() {
        let (_cloud, lifecycle, cancel) = setup();
        let info = lifecycle.create_instance(&instance_config(), &cancel).await.unwrap();

        let mut extra = Tags::new();
        extra.insert(TAG_USER_ID.to_string(), "SHA256:one".to_string());
        lifecycle
            .update_instance_status(&info.name, Status::Free, Status::Connected, extra)
            .await
            .unwrap();

        let err = lifecycle
            .update_instance_status(&info.name, Status::Free, Status::Connected, Tags::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn status_updates_on_missing_resources_are_not_found() {
        let (_cloud, lifecycle, _cancel) = setup();
        let name = lifecycle.namer().box_vm("ghost");
        let err = lifecycle
            .update_instance_status(&name, Status::Free, Status::Connected, Tags::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn no_path_returns_to_free() {
        let (_cloud, lifecycle, _cancel) = setup();
        let err = lifecycle
            .update_instance_status("any", Status::Connected, Status::Free, Tags::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
        let err = lifecycle
            .update_volume_status("any", Status::Attached, Status::Free, Tags::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }

    #[tokio::test]
    async fn deallocate_powers_off_a_free_instance() {
        let (cloud, lifecycle, cancel) = setup();
        let info = lifecycle.create_instance(&instance_config(), &cancel).await.unwrap();
        lifecycle.deallocate(&info.name, &cancel).await.unwrap();

        use crate::cloud::types::PowerState;
        use crate::cloud::{ComputeApi, TagStore};
        let vm = cloud.get_vm(&info.name).await.unwrap().unwrap();
        assert_eq!(vm.power_state, PowerState::Deallocated);
        let tags = cloud.get_tags(&info.name).await.unwrap().unwrap();
        assert_eq!(tags.get(TAG_STATUS).unwrap(), "deallocated");
    }

    #[tokio::test]
    async fn deallocate_requires_free() {
        let (_cloud, lifecycle, cancel) = setup();
        let info = lifecycle.create_instance(&instance_config(), &cancel).await.unwrap();
        lifecycle
            .update_instance_status(&info.name, Status::Free, Status::Connected, Tags::new())
            .await
            .unwrap();
        let err = lifecycle.deallocate(&info.name, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }
}
