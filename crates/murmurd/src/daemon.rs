//! Daemon orchestration: owns storage, the friend/message stores, the peer
//! registry, every transport, and the scheduler loop. A struct built once at
//! startup, a `run()` that drives background tasks behind a shutdown
//! broadcast, and a `shutdown()` that signals them to stop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use murmur_net::lan::LanTransport;
use murmur_net::{PeerRegistry, Transport, TransportEvent};

use crate::adapters::{NoopNotifications, Notifications, Telemetry, TracingTelemetry};
use crate::config::{AppConfig, Config};
use crate::error::StorageError;
use crate::exchange::{ExchangeResponder, ResponderHandler};
use crate::friends::FriendStore;
use crate::history::ExchangeHistory;
use crate::scheduler::{DispatchMode, Scheduler};
use crate::storage::Storage;
use crate::store::MessageStore;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("transport error: {0}")]
    Transport(#[from] murmur_net::TransportError),
}

/// Everything the daemon owns before any transport is bound: storage and the
/// process-local stores. Binding sockets is async, so it stays out of the
/// (sync) constructor and happens in [`Daemon::run`] instead.
pub struct Daemon {
    config: Arc<dyn Config>,
    storage: Arc<Storage>,
    friend_store: Arc<FriendStore>,
    message_store: Arc<MessageStore>,
    history: Arc<ExchangeHistory>,
    peer_registry: Arc<PeerRegistry>,
    responder: Arc<ExchangeResponder>,
    notifications: Arc<dyn Notifications>,
    telemetry: Arc<dyn Telemetry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    pub fn new(config: AppConfig) -> Result<Self, DaemonError> {
        Self::with_adapters(config, Arc::new(NoopNotifications), Arc::new(TracingTelemetry))
    }

    pub fn with_adapters(
        config: AppConfig,
        notifications: Arc<dyn Notifications>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, DaemonError> {
        let config: Arc<dyn Config> = Arc::new(config);
        let storage = Arc::new(Storage::open(config.data_dir())?);
        let friend_store = Arc::new(FriendStore::open(storage.clone())?);
        let message_store = Arc::new(MessageStore::new(storage.clone()));
        let history = Arc::new(ExchangeHistory::new(storage.clone()));
        let peer_registry = PeerRegistry::new();
        let responder = Arc::new(ExchangeResponder::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            storage,
            friend_store,
            message_store,
            history,
            peer_registry,
            responder,
            notifications,
            telemetry,
            shutdown_tx,
        })
    }

    pub fn device_id(&self) -> String {
        self.friend_store.device_id()
    }

    /// Bind every transport, spawn the discovery-intake and scheduler-tick
    /// background tasks, and block until a shutdown signal arrives.
    pub async fn run(self, tcp_port: u16) -> Result<(), DaemonError> {
        let handler = Arc::new(ResponderHandler::new(
            self.responder.clone(),
            self.config.clone(),
            self.friend_store.clone(),
            self.message_store.clone(),
        ));
        let lan = LanTransport::bind(self.device_id(), tcp_port, handler).await?;
        let transports: Vec<Arc<dyn Transport>> = vec![lan.clone()];

        let scheduler = Arc::new(Scheduler::new(
            self.config.clone(),
            self.friend_store.clone(),
            self.message_store.clone(),
            self.history.clone(),
            self.peer_registry.clone(),
            self.responder.clone(),
            self.telemetry.clone(),
            transports.clone(),
        ));

        info!(device_id = %self.device_id(), tcp_port, "murmurd starting");

        let discovery_handle = spawn_discovery_intake(transports.clone(), self.peer_registry.clone(), &self.shutdown_tx);
        let scheduler_handle = spawn_scheduler_tick(scheduler, self.config.scheduler_tick_ms(), self.notifications.clone(), &self.shutdown_tx);
        let retention_handle = spawn_retention_tick(self.message_store.clone(), self.config.clone(), &self.shutdown_tx);

        let broadcast_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)), murmur_net::lan::LAN_DISCOVERY_PORT);
        if let Err(err) = lan.announce(broadcast_addr).await {
            warn!(%err, "initial LAN announce failed");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        shutdown_rx.recv().await.ok();

        info!("murmurd shutting down");
        discovery_handle.abort();
        scheduler_handle.abort();
        retention_handle.abort();
        self.storage.flush()?;
        Ok(())
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

fn spawn_discovery_intake(
    transports: Vec<Arc<dyn Transport>>,
    peer_registry: Arc<PeerRegistry>,
    shutdown_tx: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(1_000));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for transport in &transports {
                        for event in transport.poll_events().await {
                            if let TransportEvent::PeerDiscovered(discovery) = event {
                                let Some(public_id) = discovery.public_id_hint else { continue };
                                peer_registry.report_peer(
                                    &public_id,
                                    transport.kind(),
                                    discovery.address,
                                    discovery.signal_strength,
                                    discovery.port,
                                );
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

/// Periodically runs the store's retention passes: `cleanup_by_hearts`
/// always, `delete_outdated_or_irrelevant` when enabled, then
/// `prune_tombstones` to cap the tombstone set.
fn spawn_retention_tick(
    message_store: Arc<MessageStore>,
    config: Arc<dyn Config>,
    shutdown_tx: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(config.retention_tick_ms()));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now_ms = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64;
                    match message_store.cleanup_by_hearts(now_ms) {
                        Ok(removed) if removed > 0 => debug!(removed, "retention: pruned by heart-age bucket"),
                        Ok(_) => {}
                        Err(err) => warn!(%err, "retention: cleanup_by_hearts failed"),
                    }
                    match message_store.delete_outdated_or_irrelevant(
                        config.delete_outdated_enabled(),
                        config.delete_outdated_trust_threshold(),
                        config.delete_outdated_age_days(),
                        now_ms,
                    ) {
                        Ok(removed) if removed > 0 => debug!(removed, "retention: pruned outdated/irrelevant"),
                        Ok(_) => {}
                        Err(err) => warn!(%err, "retention: delete_outdated_or_irrelevant failed"),
                    }
                    match message_store.prune_tombstones(config.max_tombstones()) {
                        Ok(removed) if removed > 0 => debug!(removed, "retention: pruned tombstones"),
                        Ok(_) => {}
                        Err(err) => warn!(%err, "retention: prune_tombstones failed"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

fn spawn_scheduler_tick(
    scheduler: Arc<Scheduler>,
    tick_ms: u64,
    notifications: Arc<dyn Notifications>,
    shutdown_tx: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(tick_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = scheduler.run_cycle(DispatchMode::Normal).await;
                    debug!(?stats, "exchange cycle complete");
                    if stats.messages_received > 0 {
                        notifications.show_new_messages(stats.messages_received as usize);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}
