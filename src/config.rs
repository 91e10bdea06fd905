use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Network layout assumed by the broker's trust argument: boxes are only
/// reachable from the bastion subnet, enforced by per-instance NSG rules.
pub const BASTION_SUBNET: &str = "10.0.0.0/24";
pub const BOXES_SUBNET: &str = "10.1.0.0/16";

/// Public SSH port of the bastion and forwarded SSH port of the guest.
pub const BROKER_PORT: u16 = 2222;
pub const GUEST_SSH_PORT: u16 = 2222;

/// Mount point of the user data disk inside the host VM.
pub const WORK_DIR: &str = "/mnt/userdata";

/// Size of pool data volumes, matching the golden image's disk.
pub const VOLUME_SIZE_GB: u32 = 64;

/// Default wall-clock bounds for cloud and SSH operations.
pub const VM_CREATE_TIMEOUT: Duration = Duration::from_secs(25 * 60);
pub const VOLUME_CREATE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const SSH_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const SSH_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// An immutable `(suffix, region)` pair scoping every named cloud object.
///
/// Two deployments with different suffixes never collide: all resource names
/// embed the suffix (see `naming`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub suffix: String,
    pub region: String,
}

impl Deployment {
    /// Validates and builds a deployment scope.
    ///
    /// The suffix feeds resource names and the storage-account compression,
    /// so it is restricted to lowercase alphanumerics and dashes, at most
    /// 32 characters.
    pub fn new(suffix: &str, region: &str) -> Result<Self> {
        if suffix.is_empty() || suffix.len() > 32 {
            return Err(Error::Invalid(format!(
                "deployment suffix must be 1-32 characters, got {:?}",
                suffix
            )));
        }
        if !suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::Invalid(format!(
                "deployment suffix must match [a-z0-9-], got {:?}",
                suffix
            )));
        }
        if region.is_empty() {
            return Err(Error::Invalid("deployment region must not be empty".into()));
        }
        Ok(Self {
            suffix: suffix.to_string(),
            region: region.to_string(),
        })
    }

    /// Short fingerprint of this deployment's identity, stamped into audit
    /// rows so deployments sharing one event table can be told apart.
    /// Distinct suffixes (or regions) always hash differently.
    pub fn config_hash(&self) -> String {
        let digest = Sha256::digest(format!("{}\n{}", self.suffix, self.region).as_bytes());
        hex::encode(digest)[..12].to_string()
    }
}

/// Sizing and cadence of one reconciliation loop (instances or volumes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Lower bound of free resources the loop restores on each tick
    pub min_free: usize,
    /// Upper bound of free resources before a scale-down is considered
    pub max_free: usize,
    /// Hard cap on total resources, free or leased
    pub max_total: usize,
    /// Sleep between reconciliation ticks
    pub check_interval: Duration,
    /// Minimum quiet period between scale-down steps
    pub scale_down_cooldown: Duration,
}

impl PoolConfig {
    /// Validates `min_free <= max_free <= max_total`.
    pub fn validate(&self) -> Result<()> {
        if self.min_free > self.max_free {
            return Err(Error::Invalid(format!(
                "min_free ({}) exceeds max_free ({})",
                self.min_free, self.max_free
            )));
        }
        if self.max_free > self.max_total {
            return Err(Error::Invalid(format!(
                "max_free ({}) exceeds max_total ({})",
                self.max_free, self.max_total
            )));
        }
        Ok(())
    }

    /// Production instance pool: a comfortable reserve, hourly-scale churn.
    pub fn instance_production() -> Self {
        Self {
            min_free: 3,
            max_free: 6,
            max_total: 20,
            check_interval: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
        }
    }

    /// Development instance pool: smaller and faster-cycling.
    pub fn instance_development() -> Self {
        Self {
            min_free: 1,
            max_free: 2,
            max_total: 4,
            check_interval: Duration::from_secs(10),
            scale_down_cooldown: Duration::from_secs(30),
        }
    }

    /// Production volume pool. Volumes hydrate faster than instances boot,
    /// so the reserve is slightly deeper than the instance pool's.
    pub fn volume_production() -> Self {
        Self {
            min_free: 4,
            max_free: 8,
            max_total: 24,
            check_interval: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
        }
    }

    /// Development volume pool.
    pub fn volume_development() -> Self {
        Self {
            min_free: 1,
            max_free: 2,
            max_total: 4,
            check_interval: Duration::from_secs(10),
            scale_down_cooldown: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_accepts_well_formed_suffix() {
        let dep = Deployment::new("alpha-2", "westeurope").unwrap();
        assert_eq!(dep.suffix, "alpha-2");
        assert_eq!(dep.region, "westeurope");
    }

    #[test]
    fn deployment_rejects_malformed_suffix() {
        assert!(Deployment::new("", "westeurope").is_err());
        assert!(Deployment::new("Has-Caps", "westeurope").is_err());
        assert!(Deployment::new("under_score", "westeurope").is_err());
        assert!(Deployment::new(&"x".repeat(33), "westeurope").is_err());
        assert!(Deployment::new("ok", "").is_err());
    }

    #[test]
    fn config_hash_distinguishes_deployments() {
        let alpha = Deployment::new("alpha", "westeurope").unwrap();
        let beta = Deployment::new("beta", "westeurope").unwrap();
        assert_ne!(alpha.config_hash(), beta.config_hash());

        let elsewhere = Deployment::new("alpha", "northeurope").unwrap();
        assert_ne!(alpha.config_hash(), elsewhere.config_hash());

        let again = Deployment::new("alpha", "westeurope").unwrap();
        assert_eq!(alpha.config_hash(), again.config_hash());
        assert_eq!(alpha.config_hash().len(), 12);
        assert!(alpha.config_hash().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn presets_are_internally_consistent() {
        for cfg in [
            PoolConfig::instance_production(),
            PoolConfig::instance_development(),
            PoolConfig::volume_production(),
            PoolConfig::volume_development(),
        ] {
            cfg.validate().unwrap();
        }
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let mut cfg = PoolConfig::instance_development();
        cfg.min_free = 5;
        cfg.max_free = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = PoolConfig::instance_development();
        cfg.max_free = 99;
        assert!(cfg.validate().is_err());
    }
}
