//! Transparent byte proxy between a broker session and the guest's SSH.
//!
//! The broker dials the guest with the deployment key, mirrors the client's
//! PTY request, and then copies stdin, stdout, stderr and window-change
//! events both ways until either side closes. The guest's exit status is
//! the session's exit status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use russh::client::AuthResult;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{GUEST_SSH_PORT, SSH_DIAL_TIMEOUT};
use crate::error::{Error, Result};

/// User the guest image trusts the deployment key for.
const GUEST_USER: &str = "root";

/// How long a freshly started guest may take to accept SSH.
const GUEST_READY_TIMEOUT: Duration = Duration::from_secs(120);
const GUEST_DIAL_INTERVAL: Duration = Duration::from_secs(3);

/// PTY parameters mirrored from the client session.
#[derive(Debug, Clone)]
pub struct PtySpec {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

/// Input flowing from the client session into the guest.
#[derive(Debug)]
pub enum GuestInput {
    Data(Vec<u8>),
    WindowChange {
        cols: u32,
        rows: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Eof,
}

/// Output flowing from the guest back to the client session.
#[async_trait]
pub trait SessionOutput: Send + Sync {
    async fn stdout(&self, data: &[u8]);
    async fn stderr(&self, data: &[u8]);
}

/// Host-key verifier for guest dials: accepts everything.
///
/// Guests are ephemeral VMs whose host keys are generated at first boot and
/// cannot be pinned ahead of time. They are reachable only on the private
/// boxes subnet, and every instance's NSG admits traffic exclusively from
/// the bastion subnet, so there is no network position from which a
/// man-in-the-middle could sit between the broker and a guest. Skipping
/// verification here is a deliberate, documented trust decision resting on
/// that network isolation. Do not "fix" it by pinning random keys.
struct AcceptAllHostKeys;

impl russh::client::Handler for AcceptAllHostKeys {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool> {
        Ok(true)
    }
}

/// Dials the guest's forwarded SSH port until it accepts or the readiness
/// window closes. A guest restored from the `ssh-ready` state answers on
/// the first try; a cold boot needs a few attempts.
async fn dial_guest(
    host_ip: &str,
    cancel: &CancellationToken,
) -> Result<russh::client::Handle<AcceptAllHostKeys>> {
    let config = Arc::new(russh::client::Config::default());
    let deadline = tokio::time::Instant::now() + GUEST_READY_TIMEOUT;
    loop {
        let attempt = tokio::time::timeout(
            SSH_DIAL_TIMEOUT,
            russh::client::connect(
                config.clone(),
                (host_ip.to_string(), GUEST_SSH_PORT),
                AcceptAllHostKeys,
            ),
        )
        .await;
        match attempt {
            Ok(Ok(handle)) => return Ok(handle),
            Ok(Err(err)) => debug!("proxy: guest {} not ready: {}", host_ip, err),
            Err(_) => debug!("proxy: guest {} dial timed out", host_ip),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "guest {}:{} never accepted ssh",
                host_ip, GUEST_SSH_PORT
            )));
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Unavailable("guest dial aborted by shutdown".into()));
            }
            _ = tokio::time::sleep(GUEST_DIAL_INTERVAL) => {}
        }
    }
}

/// Runs the proxy until the guest session ends, returning its exit status.
pub async fn run_proxy(
    host_ip: &str,
    key: Arc<PrivateKey>,
    pty: Option<PtySpec>,
    mut input: mpsc::Receiver<GuestInput>,
    output: Arc<dyn SessionOutput>,
    cancel: &CancellationToken,
) -> Result<u32> {
    let mut handle = dial_guest(host_ip, cancel).await?;

    let auth = handle
        .authenticate_publickey(GUEST_USER, PrivateKeyWithHashAlg::new(key, None))
        .await?;
    if !matches!(auth, AuthResult::Success) {
        return Err(Error::Remote(format!(
            "guest {} rejected the deployment key",
            host_ip
        )));
    }

    let mut channel = handle.channel_open_session().await?;
    if let Some(pty) = &pty {
        channel
            .request_pty(
                true,
                &pty.term,
                pty.cols,
                pty.rows,
                pty.pix_width,
                pty.pix_height,
                &[],
            )
            .await?;
    }
    channel.request_shell(true).await?;

    let mut exit_status: Option<u32> = None;
    let mut input_open = true;
    loop {
        tokio::select! {
            event = input.recv(), if input_open => match event {
                Some(GuestInput::Data(bytes)) => {
                    channel.data(&bytes[..]).await?;
                }
                Some(GuestInput::WindowChange { cols, rows, pix_width, pix_height }) => {
                    channel.window_change(cols, rows, pix_width, pix_height).await?;
                }
                Some(GuestInput::Eof) | None => {
                    input_open = false;
                    if let Err(err) = channel.eof().await {
                        warn!("proxy: eof to guest {} failed: {}", host_ip, err);
                    }
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => output.stdout(&data).await,
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => output.stderr(&data).await,
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status);
                }
                Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => break,
                Some(other) => debug!("proxy: ignoring {:?}", other),
            },
            _ = cancel.cancelled() => {
                // Shutdown: drop both ends; the release path deletes the box.
                break;
            }
        }
    }

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "session ended", "")
        .await;
    Ok(exit_status.unwrap_or(0))
}
