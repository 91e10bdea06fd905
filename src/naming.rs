//! Deterministic names for every cloud object in a deployment.
//!
//! All callers obtain names through `Namer`, never by string concatenation,
//! so that the `name -> id` extraction functions stay in lockstep with the
//! constructors and two deployments can never collide.

use crate::config::Deployment;

/// Common prefix of every deployment-scoped resource.
const PREFIX: &str = "shellbox";

/// Storage-account names are capped by the cloud at 24 chars, `[a-z0-9]`.
const STORAGE_ACCOUNT_SUFFIX_LEN: usize = 22;

/// The cloud "computer name" keeps only this many chars of the `box-<id>`
/// payload.
const COMPUTER_NAME_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct Namer {
    suffix: String,
}

impl Namer {
    pub fn new(deployment: &Deployment) -> Self {
        Self {
            suffix: deployment.suffix.clone(),
        }
    }

    fn scoped(&self, rest: &str) -> String {
        format!("{}-{}-{}", PREFIX, self.suffix, rest)
    }

    pub fn resource_group(&self) -> String {
        self.scoped("rg")
    }

    pub fn vnet(&self) -> String {
        self.scoped("vnet")
    }

    pub fn bastion_subnet(&self) -> String {
        self.scoped("subnet-bastion")
    }

    pub fn boxes_subnet(&self) -> String {
        self.scoped("subnet-boxes")
    }

    pub fn bastion_vm(&self) -> String {
        self.scoped("bastion")
    }

    pub fn bastion_nic(&self) -> String {
        self.scoped("bastion-nic")
    }

    pub fn bastion_nsg(&self) -> String {
        self.scoped("bastion-nsg")
    }

    pub fn box_vm(&self, instance_id: &str) -> String {
        self.scoped(&format!("box-{}", instance_id))
    }

    pub fn temp_vm(&self, instance_id: &str) -> String {
        self.scoped(&format!("temp-{}", instance_id))
    }

    pub fn nic(&self, instance_id: &str) -> String {
        self.scoped(&format!("nic-{}", instance_id))
    }

    pub fn nsg(&self, instance_id: &str) -> String {
        self.scoped(&format!("nsg-{}", instance_id))
    }

    pub fn os_disk(&self, instance_id: &str) -> String {
        self.scoped(&format!("osdisk-{}", instance_id))
    }

    pub fn volume(&self, volume_id: &str) -> String {
        self.scoped(&format!("vol-{}", volume_id))
    }

    /// Guest-visible hostname. The cloud caps computer names well below
    /// resource-name length, so only the first 8 chars of `box-<id>` survive.
    pub fn computer_name(&self, instance_id: &str) -> String {
        let payload = format!("box-{}", instance_id);
        payload.chars().take(COMPUTER_NAME_LEN).collect()
    }

    /// Storage-account name: `sb` + the first 22 alphanumeric chars of the
    /// suffix (dashes dropped), satisfying the cloud's `[a-z0-9]{3,24}` rule.
    pub fn storage_account(&self) -> String {
        let compressed: String = self
            .suffix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(STORAGE_ACCOUNT_SUFFIX_LEN)
            .collect();
        format!("sb{}", compressed)
    }

    /// Listing prefix for box VMs.
    pub fn box_prefix(&self) -> String {
        self.scoped("box-")
    }

    /// Listing prefix for temp VMs (golden-image builds).
    pub fn temp_prefix(&self) -> String {
        self.scoped("temp-")
    }

    /// Listing prefix for data volumes.
    pub fn volume_prefix(&self) -> String {
        self.scoped("vol-")
    }

    /// Inverts `box_vm` / `temp_vm`.
    pub fn instance_id<'a>(&self, name: &'a str) -> Option<&'a str> {
        let boxes = format!("{}-{}-box-", PREFIX, self.suffix);
        let temps = format!("{}-{}-temp-", PREFIX, self.suffix);
        name.strip_prefix(boxes.as_str())
            .or_else(|| name.strip_prefix(temps.as_str()))
            .filter(|id| !id.is_empty())
    }

    /// Inverts `volume`.
    pub fn volume_id<'a>(&self, name: &'a str) -> Option<&'a str> {
        let vols = format!("{}-{}-vol-", PREFIX, self.suffix);
        name.strip_prefix(vols.as_str()).filter(|id| !id.is_empty())
    }

    /// True when `name` belongs to this deployment.
    pub fn owns(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-{}-", PREFIX, self.suffix))
    }
}

/// Golden snapshots are shared across deployments and rebuilds: they carry
/// no suffix and are keyed only by content hash.
pub fn golden_snapshot(content_hash: &str) -> String {
    format!("golden-qemu-{}", content_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn namer(suffix: &str) -> Namer {
        Namer::new(&Deployment::new(suffix, "westeurope").unwrap())
    }

    #[test]
    fn names_are_deterministic() {
        let n = namer("alpha");
        assert_eq!(n.box_vm("42"), n.box_vm("42"));
        assert_eq!(n.volume("v1"), n.volume("v1"));
        assert_eq!(n.storage_account(), n.storage_account());
    }

    #[test]
    fn names_are_unique_across_roles() {
        let n = namer("alpha");
        let names = [
            n.resource_group(),
            n.vnet(),
            n.bastion_subnet(),
            n.boxes_subnet(),
            n.bastion_vm(),
            n.bastion_nic(),
            n.bastion_nsg(),
            n.box_vm("id1"),
            n.temp_vm("id1"),
            n.nic("id1"),
            n.nsg("id1"),
            n.os_disk("id1"),
            n.volume("id1"),
        ];
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn suffixes_isolate_deployments() {
        let a = namer("alpha");
        let b = namer("beta");
        assert_ne!(a.box_vm("same-id"), b.box_vm("same-id"));
        assert_ne!(a.volume("same-id"), b.volume("same-id"));
        assert!(a.owns(&a.box_vm("x")));
        assert!(!a.owns(&b.box_vm("x")));
    }

    #[test]
    fn instance_id_round_trip() {
        let n = namer("alpha");
        let id = "3fd2a8e0-aaaa-bbbb-cccc-0123456789ab";
        assert_eq!(n.instance_id(&n.box_vm(id)), Some(id));
        assert_eq!(n.instance_id(&n.temp_vm(id)), Some(id));
        assert_eq!(n.volume_id(&n.volume(id)), Some(id));
        assert_eq!(n.instance_id(&n.volume(id)), None);
        assert_eq!(n.volume_id(&n.box_vm(id)), None);
    }

    #[test]
    fn extraction_ignores_foreign_deployments() {
        let a = namer("alpha");
        let b = namer("beta");
        assert_eq!(a.instance_id(&b.box_vm("id")), None);
    }

    #[test]
    fn storage_account_fits_cloud_constraint() {
        let n = namer("a-very-long-deployment-suffix-00");
        let account = n.storage_account();
        assert!(account.len() <= 24);
        assert!(account.starts_with("sb"));
        assert!(account.chars().all(|c| c.is_ascii_alphanumeric()));
        // dashes are dropped, not replaced
        assert!(!account.contains('-'));
    }

    #[test]
    fn computer_name_truncates_payload() {
        let n = namer("alpha");
        let name = n.computer_name("0123456789abcdef");
        assert_eq!(name, "box-0123");
        assert!(name.len() <= 8);
    }
}
