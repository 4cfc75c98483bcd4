use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::api::SnapshotApi;
use crate::bus::{BroadcastBus, BusSubscription};
use crate::config::Settings;
use crate::protocol::{MessageKind, RelayPayload};
use crate::subscription::{ScopedUpdate, SubscriptionRegistry};
use crate::upstream::{ConnectionManager, ManagerHandle};

use super::shared::{RelayTask, SharedRelay};

const EVENT_BUFFER_SIZE: usize = 64;

/// Composition root for the distribution layer.
///
/// Owns the bus, the shared relay, and the connection manager task; their
/// lifetime is exactly `init()` to `shutdown()`. There is deliberately no
/// lazily-constructed global instance.
pub struct RelayService {
    bus: Arc<BroadcastBus>,
    relay: Arc<SharedRelay>,
    manager: ManagerHandle,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    _subscribe_bridge: BusSubscription,
}

impl RelayService {
    /// Build and start the relay: spawns the connection manager and the
    /// relay event loop. The upstream connection is established
    /// immediately.
    pub fn init(settings: &Settings, api: Arc<dyn SnapshotApi>) -> Self {
        let bus = Arc::new(BroadcastBus::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (manager, manager_handle) = ConnectionManager::new(
            settings.upstream.clone(),
            api.clone(),
            events_tx,
            shutdown_tx.subscribe(),
        );

        let relay = Arc::new(SharedRelay::new(
            bus.clone(),
            api,
            settings.relay.clone(),
        ));

        // Subscribe requests travel over the same channel as everything
        // else; bridge them from the bus into the relay loop.
        let (subscribes_tx, subscribes_rx) = mpsc::unbounded_channel();
        let subscribe_bridge = bus.subscribe(MessageKind::Subscribe, move |message| {
            if let RelayPayload::Subscribe(request) = &message.payload {
                let _ = subscribes_tx.send(request.clone());
            }
        });

        let relay_task = RelayTask::new(
            relay.clone(),
            events_rx,
            subscribes_rx,
            manager_handle.state_changes(),
            shutdown_tx.subscribe(),
        );

        let tasks = vec![
            tokio::spawn(manager.run()),
            tokio::spawn(relay_task.run()),
        ];

        tracing::info!("Relay service initialized");

        Self {
            bus,
            relay,
            manager: manager_handle,
            shutdown_tx,
            tasks,
            _subscribe_bridge: subscribe_bridge,
        }
    }

    pub fn bus(&self) -> Arc<BroadcastBus> {
        self.bus.clone()
    }

    pub fn relay(&self) -> Arc<SharedRelay> {
        self.relay.clone()
    }

    pub fn manager(&self) -> &ManagerHandle {
        &self.manager
    }

    /// Open a consumer-side registry on this service's bus.
    pub fn open_registry(
        &self,
    ) -> (
        SubscriptionRegistry,
        mpsc::UnboundedReceiver<ScopedUpdate>,
    ) {
        SubscriptionRegistry::attach(&self.bus)
    }

    /// Stop the manager and relay tasks, then close the bus.
    pub async fn shutdown(self) {
        tracing::info!("Relay service shutting down");

        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Relay task join failed");
            }
        }

        self.bus.close();
        tracing::info!("Relay service shutdown complete");
    }
}
