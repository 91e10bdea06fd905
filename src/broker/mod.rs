pub mod command;
pub mod lease;
pub mod proxy;
pub mod server;

// Re-export commonly used types
pub use command::{parse_args, Command};
pub use lease::{Lease, LeaseManager};
pub use proxy::{GuestInput, PtySpec};
pub use server::{Broker, BrokerState};
