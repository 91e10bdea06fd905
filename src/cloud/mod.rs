pub mod api;
pub mod mock;
pub mod types;

// Re-export commonly used types
pub use api::{ComputeApi, DiskApi, NetworkApi, TableApi, TagStore};
pub use mock::InMemoryCloud;
pub use types::{Page, PageToken, Role, Status, Tags};

use std::sync::Arc;

use crate::error::{Error, Result};

/// The dependency bundle handed to every subsystem at startup.
///
/// Constructed once in `main` and treated as an immutable capability object;
/// nothing in the process holds cloud state outside these clients.
#[derive(Clone)]
pub struct CloudClients {
    pub compute: Arc<dyn ComputeApi>,
    pub network: Arc<dyn NetworkApi>,
    pub disks: Arc<dyn DiskApi>,
    pub tables: Arc<dyn TableApi>,
    pub tags: Arc<dyn TagStore>,
}

impl CloudClients {
    /// Bundle backed by the in-memory cloud (tests, `memory` backend).
    pub fn in_memory() -> (Self, Arc<InMemoryCloud>) {
        let cloud = Arc::new(InMemoryCloud::new());
        (Self::from_impl(cloud.clone()), cloud)
    }

    fn from_impl(cloud: Arc<InMemoryCloud>) -> Self {
        Self {
            compute: cloud.clone(),
            network: cloud.clone(),
            disks: cloud.clone(),
            tables: cloud.clone(),
            tags: cloud,
        }
    }

    /// Selects a backend from `SHELLBOX_CLOUD`. The in-tree build knows
    /// `memory`; production deployments wire the real SDK shim in place of
    /// this constructor.
    pub fn from_env() -> Result<Self> {
        match std::env::var("SHELLBOX_CLOUD").as_deref() {
            Ok("memory") | Err(_) => Ok(Self::in_memory().0),
            Ok(other) => Err(Error::Unavailable(format!(
                "unknown cloud backend {:?} (supported: memory)",
                other
            ))),
        }
    }
}
