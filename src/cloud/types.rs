//! Resource records, creation specs and the tag schema.
//!
//! Tags are the source of truth for pool membership and lifecycle state;
//! every record carries its tag blob verbatim so callers can parse state
//! without extra round-trips.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tag keys in the deployment namespace.
pub const TAG_ROLE: &str = "shellbox:role";
pub const TAG_STATUS: &str = "shellbox:status";
pub const TAG_CREATED: &str = "shellbox:created";
pub const TAG_LAST_USED: &str = "shellbox:lastused";
pub const TAG_VOLUME_ID: &str = "shellbox:volumeid";
pub const TAG_USER_ID: &str = "shellbox:userid";

/// Tag keys in the golden-snapshot namespace (deployment independent).
pub const GOLDEN_TAG_ROLE: &str = "golden:role";
pub const GOLDEN_TAG_PURPOSE: &str = "golden:purpose";
pub const GOLDEN_TAG_CREATED: &str = "golden:created";
pub const GOLDEN_TAG_STAGE: &str = "golden:stage";
pub const GOLDEN_TAG_CONFIG_HASH: &str = "golden:confighash";

pub const GOLDEN_STAGE_CREATING: &str = "creating";
pub const GOLDEN_STAGE_READY: &str = "ready";

/// Largest page the inventory queries will return.
pub const MAX_QUERY_RESULTS: usize = 10;

/// Data disks attach at LUN 0; the guest bootstrap expects it there.
pub const DATA_DISK_LUN: u8 = 0;

pub type Tags = BTreeMap<String, String>;

/// Pool membership classification carried in `shellbox:role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Instance,
    Volume,
    Bastion,
    Temp,
    Golden,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Instance => "instance",
            Role::Volume => "volume",
            Role::Bastion => "bastion",
            Role::Temp => "temp",
            Role::Golden => "golden",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "instance" => Ok(Role::Instance),
            "volume" => Ok(Role::Volume),
            "bastion" => Ok(Role::Bastion),
            "temp" => Ok(Role::Temp),
            "golden" => Ok(Role::Golden),
            other => Err(Error::Invalid(format!("unknown role tag {:?}", other))),
        }
    }
}

/// Lifecycle state carried in `shellbox:status`.
///
/// Instances move `free -> connected` (or `free -> deallocated`) and are then
/// deleted; volumes move `free -> attached` and are then deleted. Nothing
/// ever returns to `free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Free,
    Connected,
    Attached,
    Deallocated,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Free => "free",
            Status::Connected => "connected",
            Status::Attached => "attached",
            Status::Deallocated => "deallocated",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(Status::Free),
            "connected" => Ok(Status::Connected),
            "attached" => Ok(Status::Attached),
            "deallocated" => Ok(Status::Deallocated),
            other => Err(Error::Invalid(format!("unknown status tag {:?}", other))),
        }
    }
}

/// Power state reported by the compute API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Deallocated,
}

/// Specification for a new VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    /// Guest-visible hostname, truncated by the namer
    pub computer_name: String,
    /// NIC the VM boots with
    pub nic: String,
    /// Name the platform gives the OS disk, chosen by us so deletion can find it
    pub os_disk: String,
    /// cloud-init user data (the host bootstrap script)
    pub user_data: String,
    /// Admin SSH public key installed on the host
    pub ssh_public_key: String,
    pub tags: Tags,
}

/// A VM as reported by the compute API.
#[derive(Debug, Clone)]
pub struct VmRecord {
    pub name: String,
    pub resource_id: String,
    pub private_ip: String,
    pub power_state: PowerState,
    /// Name of the data disk attached at LUN 0, if any
    pub data_disk: Option<String>,
    pub tags: Tags,
}

/// One inbound/outbound rule of a network security group.
#[derive(Debug, Clone)]
pub struct NsgRule {
    pub name: String,
    pub priority: u16,
    pub inbound: bool,
    pub allow: bool,
    /// "Tcp", "Icmp" or "*"
    pub protocol: String,
    pub source_prefix: String,
    pub dest_port: String,
}

#[derive(Debug, Clone)]
pub struct NsgSpec {
    pub name: String,
    pub rules: Vec<NsgRule>,
}

#[derive(Debug, Clone)]
pub struct NicSpec {
    pub name: String,
    pub subnet: String,
    pub nsg: String,
}

#[derive(Debug, Clone)]
pub struct NicRecord {
    pub name: String,
    pub resource_id: String,
    pub private_ip: String,
}

/// Specification for a managed disk, empty or hydrated from a snapshot.
#[derive(Debug, Clone)]
pub struct DiskSpec {
    pub name: String,
    pub size_gb: u32,
    pub source_snapshot: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone)]
pub struct DiskRecord {
    pub name: String,
    pub resource_id: String,
    pub size_gb: u32,
    /// VM the disk is LUN-attached to, if any
    pub attached_to: Option<String>,
    pub lun: Option<u8>,
    pub tags: Tags,
}

#[derive(Debug, Clone)]
pub struct SnapshotSpec {
    pub name: String,
    pub source_disk: String,
    pub tags: Tags,
}

#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub name: String,
    pub resource_id: String,
    pub size_gb: u32,
    pub tags: Tags,
}

/// One row of a blob-table (events, registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,
    pub body: serde_json::Value,
}

/// Opaque continuation token for paginated listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken(pub(crate) usize);

/// One page of a listing, at most `MAX_QUERY_RESULTS` items.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}
