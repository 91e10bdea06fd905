pub mod controller;
pub mod target;

// Re-export commonly used types
pub use controller::PoolController;
pub use target::{InstancePoolTarget, PoolTarget, VolumePoolTarget};
