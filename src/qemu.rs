//! Remote lifecycle of the nested QEMU guest on a leased host.
//!
//! Each operation is one shell script, rendered from a pinned template and
//! executed over SSH against the host VM. The commands are fire-and-forget
//! from the broker's point of view: the broker only waits for its own SSH
//! dial into the guest to succeed afterwards.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::bootstrap::render;
use crate::config::{GUEST_SSH_PORT, SSH_COMMAND_TIMEOUT, WORK_DIR};
use crate::error::{Error, Result};
use crate::golden::Hydrator;

const START_TEMPLATE: &str = include_str!("../scripts/qemu-start.sh");
const SAVE_TEMPLATE: &str = include_str!("../scripts/qemu-save.sh");
const STOP_TEMPLATE: &str = include_str!("../scripts/qemu-stop.sh");

/// SSH port of the host VM itself (not the forwarded guest port).
const HOST_SSH_PORT: u16 = 22;

/// Admin user the host bootstrap installs the deployment key for.
const HOST_USER: &str = "root";

/// Ceiling for a golden-image hydration run (virt-builder plus guest boot).
const HYDRATE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Executes one shell script on a host VM. Production runs it over SSH with
/// the deployment key; tests capture the rendered script instead.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    async fn run(&self, host_ip: &str, script: &str, timeout: Duration) -> Result<()>;
}

/// ssh2-backed executor. The library is blocking, so each command runs on
/// the blocking thread pool with a strict 30 s connection timeout; the
/// session timeout is the per-operation deadline.
pub struct SshExecutor {
    private_key_pem: String,
}

impl SshExecutor {
    pub fn new(private_key_pem: String) -> Self {
        Self { private_key_pem }
    }

    fn exec_blocking(key_pem: &str, host_ip: &str, script: &str, timeout: Duration) -> Result<()> {
        let addr = format!("{}:{}", host_ip, HOST_SSH_PORT)
            .parse()
            .map_err(|err| Error::Invalid(format!("host address {}: {}", host_ip, err)))?;
        let tcp = TcpStream::connect_timeout(&addr, SSH_COMMAND_TIMEOUT)
            .map_err(|err| Error::Remote(format!("dial {}: {}", addr, err)))?;
        let mut session = ssh2::Session::new()?;
        session.set_timeout(timeout.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_pubkey_memory(HOST_USER, None, key_pem, None)?;

        let mut channel = session.channel_session()?;
        channel.exec(script)?;
        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        channel.wait_close()?;
        let status = channel.exit_status()?;
        if status != 0 {
            return Err(Error::Remote(format!(
                "host command exited {}: {}",
                status,
                output.trim()
            )));
        }
        debug!("host {}: command ok", host_ip);
        Ok(())
    }
}

#[async_trait]
impl HostExecutor for SshExecutor {
    async fn run(&self, host_ip: &str, script: &str, timeout: Duration) -> Result<()> {
        let key = self.private_key_pem.clone();
        let host = host_ip.to_string();
        let script = script.to_string();
        tokio::task::spawn_blocking(move || Self::exec_blocking(&key, &host, &script, timeout))
            .await
            .map_err(|err| Error::Remote(format!("ssh task panicked: {}", err)))?
    }
}

/// Control plane over the nested guest of one host.
#[derive(Clone)]
pub struct QemuControl {
    executor: Arc<dyn HostExecutor>,
}

impl QemuControl {
    pub fn new(executor: Arc<dyn HostExecutor>) -> Self {
        Self { executor }
    }

    fn base_substitutions() -> Vec<(&'static str, String)> {
        vec![
            ("WORK_DIR", WORK_DIR.to_string()),
            ("GUEST_PORT", GUEST_SSH_PORT.to_string()),
        ]
    }

    /// Boots the guest from the data volume attached at LUN 0, resuming the
    /// saved `ssh-ready` state when present.
    pub async fn start_with_volume(&self, host_ip: &str, volume_name: &str) -> Result<()> {
        let script = render(START_TEMPLATE, &Self::base_substitutions());
        info!("qemu: starting guest on {} from {}", host_ip, volume_name);
        self.executor.run(host_ip, &script, SSH_COMMAND_TIMEOUT).await
    }

    /// Saves the guest's full in-memory state under `state_name`.
    pub async fn save_state(&self, host_ip: &str, state_name: &str) -> Result<()> {
        if state_name.is_empty()
            || !state_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Invalid(format!(
                "state name {:?} must match [A-Za-z0-9_-]+",
                state_name
            )));
        }
        let mut substitutions = Self::base_substitutions();
        substitutions.push(("STATE_NAME", state_name.to_string()));
        let script = render(SAVE_TEMPLATE, &substitutions);
        info!("qemu: saving state {} on {}", state_name, host_ip);
        self.executor.run(host_ip, &script, SSH_COMMAND_TIMEOUT).await
    }

    /// Stops the guest via its monitor socket.
    pub async fn stop(&self, host_ip: &str) -> Result<()> {
        let script = render(STOP_TEMPLATE, &Self::base_substitutions());
        info!("qemu: stopping guest on {}", host_ip);
        self.executor.run(host_ip, &script, SSH_COMMAND_TIMEOUT).await
    }
}

/// Golden-image hydrator that runs the guest bootstrap script on the temp
/// host. Hydration builds a full image, so it gets a long deadline instead
/// of the 30 s command budget.
pub struct HostHydrator {
    executor: Arc<dyn HostExecutor>,
}

impl HostHydrator {
    pub fn new(executor: Arc<dyn HostExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Hydrator for HostHydrator {
    async fn hydrate(&self, host_ip: &str, script: &str, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Unavailable("hydration aborted by shutdown".into())),
            result = self.executor.run(host_ip, script, HYDRATE_TIMEOUT) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        runs: Mutex<Vec<(String, String, Duration)>>,
    }

    #[async_trait]
    impl HostExecutor for RecordingExecutor {
        async fn run(&self, host_ip: &str, script: &str, timeout: Duration) -> Result<()> {
            self.runs
                .lock()
                .unwrap()
                .push((host_ip.to_string(), script.to_string(), timeout));
            Ok(())
        }
    }

    fn control() -> (Arc<RecordingExecutor>, QemuControl) {
        let executor = Arc::new(RecordingExecutor::default());
        (executor.clone(), QemuControl::new(executor))
    }

    #[tokio::test]
    async fn start_renders_the_full_boot_script() {
        let (executor, control) = control();
        control.start_with_volume("10.1.0.4", "shellbox-alpha-vol-1").await.unwrap();

        let runs = executor.runs.lock().unwrap();
        let (host, script, timeout) = &runs[0];
        assert_eq!(host, "10.1.0.4");
        assert_eq!(*timeout, SSH_COMMAND_TIMEOUT);
        assert!(script.contains("-loadvm ssh-ready"));
        assert!(script.contains("hostfwd=tcp::2222-:22"));
        assert!(script.contains("monitor.sock"));
        assert!(script.contains("/mnt/userdata"));
        assert!(!script.contains("{{"));
    }

    #[tokio::test]
    async fn save_validates_the_state_name() {
        let (executor, control) = control();
        control.save_state("10.1.0.4", "ssh-ready").await.unwrap();
        let err = control.save_state("10.1.0.4", "bad name").await.unwrap_err();
        assert_eq!(err.kind(), "invalid");
        let err = control.save_state("10.1.0.4", "").await.unwrap_err();
        assert_eq!(err.kind(), "invalid");

        let runs = executor.runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].1.contains("STATE_NAME=ssh-ready"));
        assert!(runs[0].1.contains("savevm $STATE_NAME"));
    }

    #[tokio::test]
    async fn stop_sends_quit_to_the_monitor() {
        let (executor, control) = control();
        control.stop("10.1.0.4").await.unwrap();
        let runs = executor.runs.lock().unwrap();
        assert!(runs[0].1.contains("quit"));
        assert!(runs[0].1.contains("UNIX-CONNECT"));
    }

    #[tokio::test]
    async fn hydration_uses_the_long_deadline() {
        let executor = Arc::new(RecordingExecutor::default());
        let hydrator = HostHydrator::new(executor.clone());
        let cancel = CancellationToken::new();
        hydrator.hydrate("10.1.0.9", "#!/bin/bash\ntrue\n", &cancel).await.unwrap();
        let runs = executor.runs.lock().unwrap();
        assert_eq!(runs[0].2, HYDRATE_TIMEOUT);
    }
}
