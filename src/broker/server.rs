//! The public SSH listener on the bastion.
//!
//! Any public key authenticates; the SHA-256 fingerprint of the offered key
//! is the session's identity and lands in every audit event. The session
//! executes exactly one command. For `spinup`/`connect` the handler leases
//! a box, boots its guest and hands the channel over to the proxy; session
//! end always tears the leased resources down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::keys::{HashAlg, PrivateKey};
use russh::server::{self, Auth, Msg, Server, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::command::{self, Command};
use super::lease::LeaseManager;
use super::proxy::{self, GuestInput, PtySpec, SessionOutput};
use crate::error::{Error, Result};
use crate::events::{Event, EventLogger, EventType};
use crate::qemu::QemuControl;

/// Shared dependencies of every broker session.
pub struct BrokerState {
    pub lease_manager: LeaseManager,
    pub qemu: QemuControl,
    pub events: EventLogger,
    /// Deployment private key used to dial guests
    pub client_key: Arc<PrivateKey>,
    pub cancel: CancellationToken,
}

pub struct Broker {
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(state: Arc<BrokerState>) -> Self {
        Self { state }
    }

    fn server_config(server_key: PrivateKey) -> Arc<server::Config> {
        Arc::new(server::Config {
            keys: vec![server_key],
            inactivity_timeout: Some(Duration::from_secs(3600)),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        })
    }

    /// Listens on the given port until cancelled.
    pub async fn run(mut self, server_key: PrivateKey, port: u16) -> Result<()> {
        let cancel = self.state.cancel.clone();
        let config = Self::server_config(server_key);
        info!("broker: listening on 0.0.0.0:{}", port);
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("broker: listener stopped");
                Ok(())
            }
            result = self.run_on_address(config, ("0.0.0.0", port)) => {
                result.map_err(|err| Error::Unavailable(format!("ssh listener failed: {}", err)))
            }
        }
    }

    /// Serves an already-bound listener (tests bind port 0 and read the
    /// local address back).
    pub async fn serve(mut self, server_key: PrivateKey, listener: TcpListener) -> Result<()> {
        let cancel = self.state.cancel.clone();
        let config = Self::server_config(server_key);
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = self.run_on_socket(config, &listener) => {
                result.map_err(|err| Error::Unavailable(format!("ssh listener failed: {}", err)))
            }
        }
    }
}

impl Server for Broker {
    type Handler = SessionHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SessionHandler {
        debug!("broker: connection from {:?}", peer);
        SessionHandler {
            state: self.state.clone(),
            user_key: None,
            pty: None,
            input: None,
        }
    }

    fn handle_session_error(&mut self, error: Error) {
        warn!("broker: session error: {}", error);
    }
}

pub struct SessionHandler {
    state: Arc<BrokerState>,
    /// Fingerprint of the authenticated key
    user_key: Option<String>,
    pty: Option<PtySpec>,
    /// Wired to the guest proxy once a box session launches
    input: Option<mpsc::Sender<GuestInput>>,
}

impl SessionHandler {
    fn identity(&self) -> Result<String> {
        self.user_key
            .clone()
            .ok_or_else(|| Error::Invalid("session has no authenticated key".into()))
    }

    fn finish(
        session: &mut Session,
        channel: ChannelId,
        status: u32,
    ) -> std::result::Result<(), russh::Error> {
        session.exit_status_request(channel, status)?;
        session.eof(channel)?;
        session.close(channel)
    }

    fn reply_and_exit(
        session: &mut Session,
        channel: ChannelId,
        stdout: Option<String>,
        stderr: Option<String>,
        status: u32,
    ) -> std::result::Result<(), russh::Error> {
        if let Some(text) = stdout {
            session.data(channel, CryptoVec::from_slice(text.as_bytes()))?;
        }
        if let Some(text) = stderr {
            session.extended_data(channel, 1, CryptoVec::from_slice(text.as_bytes()))?;
        }
        Self::finish(session, channel, status)
    }

    fn launch_box_session(&mut self, channel: ChannelId, session: &mut Session, box_name: String) -> Result<()> {
        let user_key = self.identity()?;
        let (tx, rx) = mpsc::channel(64);
        self.input = Some(tx);
        let handle = session.handle();
        let state = self.state.clone();
        let pty = self.pty.clone();
        tokio::spawn(async move {
            run_box_session(state, handle, channel, user_key, box_name, pty, rx).await;
        });
        Ok(())
    }
}

impl server::Handler for SessionHandler {
    type Error = Error;

    /// All keys are trusted into the deployment; the fingerprint is the
    /// identity and the event log is the audit trail.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
        debug!("broker: accepted key {} (login name {:?})", fingerprint, user);
        self.user_key = Some(fingerprint);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        self.pty = Some(PtySpec {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
            pix_width,
            pix_height,
        });
        session.channel_success(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<()> {
        if let Some(tx) = &self.input {
            let _ = tx
                .send(GuestInput::WindowChange {
                    cols: col_width,
                    rows: row_height,
                    pix_width,
                    pix_height,
                })
                .await;
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(&mut self, _channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<()> {
        if let Some(tx) = &self.input {
            let _ = tx.send(GuestInput::Data(data.to_vec())).await;
        }
        Ok(())
    }

    async fn channel_eof(&mut self, _channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(tx) = &self.input {
            let _ = tx.send(GuestInput::Eof).await;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let line = String::from_utf8_lossy(data).to_string();
        session.channel_success(channel)?;
        match command::parse_args(&line) {
            Err(parse_err) => {
                Self::reply_and_exit(
                    session,
                    channel,
                    None,
                    Some(format!("{}\n", parse_err)),
                    1,
                )?;
            }
            Ok(Command::Help) => {
                Self::reply_and_exit(session, channel, Some(command::usage().to_string()), None, 0)?;
            }
            Ok(Command::Version) => {
                Self::reply_and_exit(
                    session,
                    channel,
                    Some(format!("shellbox {}\n", command::version())),
                    None,
                    0,
                )?;
            }
            Ok(Command::Whoami) => {
                let identity = self.identity()?;
                Self::reply_and_exit(session, channel, Some(format!("{}\n", identity)), None, 0)?;
            }
            Ok(Command::Spinup { box_name }) | Ok(Command::Connect { box_name }) => {
                self.launch_box_session(channel, session, box_name)?;
            }
        }
        Ok(())
    }

    /// A bare `ssh bastion` with no command gets the usage text; commands
    /// run once per connection via exec.
    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        session.channel_success(channel)?;
        Self::reply_and_exit(
            session,
            channel,
            None,
            Some(format!("specify a command\n{}", command::usage())),
            1,
        )?;
        Ok(())
    }
}

struct ServerOutput {
    handle: server::Handle,
    channel: ChannelId,
}

#[async_trait]
impl SessionOutput for ServerOutput {
    async fn stdout(&self, data: &[u8]) {
        let _ = self.handle.data(self.channel, CryptoVec::from_slice(data)).await;
    }

    async fn stderr(&self, data: &[u8]) {
        let _ = self
            .handle
            .extended_data(self.channel, 1, CryptoVec::from_slice(data))
            .await;
    }
}

async fn fail_session(
    state: &BrokerState,
    handle: &server::Handle,
    channel: ChannelId,
    user_key: &str,
    err: &Error,
) {
    // One line on stderr, no stack traces over SSH.
    let message = format!("Error connecting to box: {}\n", err.kind());
    let _ = handle
        .extended_data(channel, 1, CryptoVec::from_slice(message.as_bytes()))
        .await;
    let _ = handle.exit_status_request(channel, 1).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
    state
        .events
        .write(
            Event::new(EventType::Failure)
                .user(user_key)
                .details(serde_json::json!({
                    "kind": err.kind(),
                    "error": err.to_string(),
                })),
        )
        .await;
}

async fn run_box_session(
    state: Arc<BrokerState>,
    handle: server::Handle,
    channel: ChannelId,
    user_key: String,
    box_name: String,
    pty: Option<PtySpec>,
    input: mpsc::Receiver<GuestInput>,
) {
    let cancel = state.cancel.clone();
    state
        .events
        .write(
            Event::new(EventType::SessionStart)
                .user(&user_key)
                .details(serde_json::json!({ "boxName": box_name })),
        )
        .await;

    let lease = match state.lease_manager.acquire(&user_key, &box_name, &cancel).await {
        Ok(lease) => lease,
        Err(err) => {
            warn!("broker: lease failed for {}: {}", user_key, err);
            fail_session(&state, &handle, channel, &user_key, &err).await;
            return;
        }
    };
    let host_ip = lease.instance.private_ip.clone().unwrap_or_default();

    if let Err(err) = state.qemu.start_with_volume(&host_ip, &lease.volume.name).await {
        warn!("broker: guest start failed on {}: {}", host_ip, err);
        fail_session(&state, &handle, channel, &user_key, &err).await;
        if let Err(release_err) = state.lease_manager.release(&lease, &cancel).await {
            warn!("broker: release after failed start: {}", release_err);
        }
        return;
    }

    let output = Arc::new(ServerOutput {
        handle: handle.clone(),
        channel,
    });
    let proxied = proxy::run_proxy(
        &host_ip,
        state.client_key.clone(),
        pty,
        input,
        output,
        &cancel,
    )
    .await;
    let status = match proxied {
        Ok(status) => status,
        Err(err) => {
            warn!("broker: proxy to {} ended with {}: {}", host_ip, err.kind(), err);
            let message = format!("Error connecting to box: {}\n", err.kind());
            let _ = handle
                .extended_data(channel, 1, CryptoVec::from_slice(message.as_bytes()))
                .await;
            1
        }
    };

    if let Err(err) = state.qemu.stop(&host_ip).await {
        debug!("broker: guest stop on {} failed: {}", host_ip, err);
    }
    if let Err(err) = state.lease_manager.release(&lease, &cancel).await {
        warn!("broker: release of {} failed: {}", lease.session_id, err);
        state
            .events
            .write(
                Event::new(EventType::Failure)
                    .session(&lease.session_id)
                    .user(&user_key)
                    .details(serde_json::json!({
                        "kind": err.kind(),
                        "error": format!("release failed: {}", err),
                    })),
            )
            .await;
    }

    let _ = handle.exit_status_request(channel, status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}
