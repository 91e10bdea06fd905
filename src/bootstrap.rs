//! Rendering and content-hashing of the pinned shell templates.
//!
//! The guest bootstrap script *is* the specification of the golden image:
//! the first 12 hex chars of its SHA-256 name the snapshot, so identical
//! configurations share one image and any template edit rolls a new one.
//! Templates are checked-in files with no incidental whitespace; rendering
//! is plain placeholder substitution, deliberately formatter-proof.

use sha2::{Digest, Sha256};

use crate::config::{GUEST_SSH_PORT, WORK_DIR};
use crate::error::{Error, Result};

const HOST_TEMPLATE: &str = include_str!("../scripts/host-bootstrap.sh");
const GUEST_TEMPLATE: &str = include_str!("../scripts/guest-bootstrap.sh");

/// Length of the hash prefix embedded in golden snapshot names.
const CONTENT_HASH_LEN: usize = 12;

/// Parameter bundle for the guest bootstrap template.
#[derive(Debug, Clone)]
pub struct BootstrapParams {
    /// Public key injected into the guest image
    pub ssh_key: String,
    pub work_dir: String,
    pub guest_port: u16,
    pub mount_data_disk: bool,
}

impl BootstrapParams {
    pub fn new(ssh_key: &str) -> Result<Self> {
        if ssh_key.trim().is_empty() {
            return Err(Error::Invalid("bootstrap ssh key must not be empty".into()));
        }
        Ok(Self {
            ssh_key: ssh_key.trim().to_string(),
            work_dir: WORK_DIR.to_string(),
            guest_port: GUEST_SSH_PORT,
            mount_data_disk: true,
        })
    }
}

pub(crate) fn render(template: &str, substitutions: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (placeholder, value) in substitutions {
        out = out.replace(&format!("{{{{{}}}}}", placeholder), value);
    }
    out
}

/// The canonical guest bootstrap script text for a parameter bundle.
pub fn guest_script(params: &BootstrapParams) -> String {
    render(
        GUEST_TEMPLATE,
        &[
            ("SSH_KEY", params.ssh_key.clone()),
            ("WORK_DIR", params.work_dir.clone()),
            ("GUEST_PORT", params.guest_port.to_string()),
            ("MOUNT_DATA_DISK", params.mount_data_disk.to_string()),
        ],
    )
}

/// cloud-init user data for a pool host VM.
pub fn host_user_data(ssh_key: &str) -> String {
    render(
        HOST_TEMPLATE,
        &[
            ("SSH_KEY", ssh_key.trim().to_string()),
            ("WORK_DIR", WORK_DIR.to_string()),
        ],
    )
}

/// First 12 hex chars of SHA-256 over the given script text.
pub fn content_hash(script: &str) -> String {
    let digest = Sha256::digest(script.as_bytes());
    hex::encode(digest)[..CONTENT_HASH_LEN].to_string()
}

/// Content hash of the rendered guest bootstrap for a parameter bundle.
pub fn config_hash(params: &BootstrapParams) -> String {
    content_hash(&guest_script(params))
}
