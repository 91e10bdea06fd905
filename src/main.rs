use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use shellbox::bootstrap::BootstrapParams;
use shellbox::broker::{Broker, BrokerState, LeaseManager};
use shellbox::cloud::CloudClients;
use shellbox::config::{Deployment, PoolConfig, BROKER_PORT, VOLUME_SIZE_GB};
use shellbox::events::{Event, EventLogger, EventType};
use shellbox::golden::GoldenManager;
use shellbox::inventory::Inventory;
use shellbox::lifecycle::Lifecycle;
use shellbox::naming::Namer;
use shellbox::pool::{InstancePoolTarget, PoolController, VolumePoolTarget};
use shellbox::qemu::{HostHydrator, QemuControl, SshExecutor};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    shellbox::logging::init();
    if let Err(err) = run().await {
        error!("startup failed: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let suffix = args.next().context("usage: shellbox <deployment-suffix>")?;
    if args.next().is_some() {
        bail!("usage: shellbox <deployment-suffix>");
    }
    let region = std::env::var("SHELLBOX_REGION").unwrap_or_else(|_| "westeurope".to_string());
    let deployment = Deployment::new(&suffix, &region)?;

    shellbox::logging::print_banner(&format!("shellbox · {}", deployment.suffix), |s| s.cyan());

    // Two separate secrets: the admin key whose public half is installed on
    // every host and guest (and whose private half dials them), and the
    // listener's own host key shown to anonymous clients. A leaked host key
    // must never open root on a box.
    let key_path = std::env::var("SHELLBOX_KEY_PATH")
        .unwrap_or_else(|_| "/etc/shellbox/deploy_key".to_string());
    let deploy_key = russh::keys::load_secret_key(&key_path, None)
        .with_context(|| format!("loading deployment admin key from {}", key_path))?;
    let public_key = deploy_key
        .public_key()
        .to_openssh()
        .context("encoding deployment public key")?;
    let key_pem = std::fs::read_to_string(&key_path)
        .with_context(|| format!("reading deployment admin key from {}", key_path))?;

    let host_key_path = std::env::var("SHELLBOX_HOST_KEY_PATH")
        .unwrap_or_else(|_| "/etc/shellbox/host_key".to_string());
    let host_key = russh::keys::load_secret_key(&host_key_path, None)
        .with_context(|| format!("loading broker host key from {}", host_key_path))?;

    let clients = CloudClients::from_env()?;
    let namer = Namer::new(&deployment);
    let inventory = Arc::new(Inventory::new(clients.clone(), namer.clone()));
    let lifecycle = Lifecycle::new(clients.clone(), namer);
    let events = EventLogger::new(Some(clients.tables.clone()))?;

    let executor = Arc::new(SshExecutor::new(key_pem));
    let qemu = QemuControl::new(executor.clone());
    let golden = Arc::new(GoldenManager::new(
        clients.clone(),
        lifecycle.clone(),
        BootstrapParams::new(&public_key)?,
        Arc::new(HostHydrator::new(executor)),
    ));

    let production = matches!(std::env::var("SHELLBOX_ENV").as_deref(), Ok("production"));
    let (instance_cfg, volume_cfg) = if production {
        (PoolConfig::instance_production(), PoolConfig::volume_production())
    } else {
        (PoolConfig::instance_development(), PoolConfig::volume_development())
    };
    info!(
        "starting deployment {} in {} ({} preset)",
        deployment.suffix,
        deployment.region,
        if production { "production" } else { "development" }
    );

    let cancel = CancellationToken::new();
    let instance_pool = PoolController::new(
        Arc::new(InstancePoolTarget::new(
            inventory.clone(),
            lifecycle.clone(),
            public_key.clone(),
        )),
        instance_cfg,
        events.clone(),
    )?;
    let volume_pool = PoolController::new(
        Arc::new(VolumePoolTarget::new(
            inventory.clone(),
            lifecycle.clone(),
            golden,
            VOLUME_SIZE_GB,
        )),
        volume_cfg,
        events.clone(),
    )?;

    events
        .write(Event::new(EventType::ServerStart).details(serde_json::json!({
            "suffix": deployment.suffix,
            "region": deployment.region,
            "configHash": deployment.config_hash(),
        })))
        .await;

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(instance_pool.run(cancel.clone())));
    tasks.push(tokio::spawn(volume_pool.run(cancel.clone())));

    let state = Arc::new(BrokerState {
        lease_manager: LeaseManager::new(inventory, lifecycle, events.clone()),
        qemu,
        events,
        client_key: Arc::new(deploy_key),
        cancel: cancel.clone(),
    });
    let broker = Broker::new(state);
    tasks.push(tokio::spawn(async move {
        if let Err(err) = broker.run(host_key, BROKER_PORT).await {
            error!("broker exited: {}", err);
        }
    }));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested, draining tasks");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
