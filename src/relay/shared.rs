use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use uuid::Uuid;

use crate::api::{ApiError, SnapshotApi};
use crate::bus::BroadcastBus;
use crate::config::RelayConfig;
use crate::protocol::{
    AdminPanelUpdate, DivisionScopedData, GamesAdded, MatchUpdate, RelayMessage, RelayPayload,
    SubscribeRequest, TournamentDataError, TournamentDataIncremental, TournamentDataRefresh,
    TournamentDataResponse, UpstreamEvent,
};
use crate::upstream::ConnectionState;

/// Handle for one attached consumer port
struct PortHandle {
    sender: mpsc::Sender<RelayMessage>,
    attached_at: DateTime<Utc>,
}

/// Consumer end of a private relay port.
pub struct RelayPort {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<RelayMessage>,
}

/// Last known state replayed to late-joining ports.
#[derive(Default)]
struct RelayCache {
    last_match: Option<RelayMessage>,
    last_scoped: Option<RelayMessage>,
}

/// Statistics for the shared relay
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Messages accepted and relayed onward
    pub relayed: AtomicU64,
    /// Snapshot fetches performed
    pub fetches: AtomicU64,
    /// Snapshot fetches that failed
    pub fetch_errors: AtomicU64,
    /// Ports attached over the relay's lifetime
    pub ports_attached: AtomicU64,
    /// Messages dropped because a port buffer was full
    pub port_drops: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            relayed: self.relayed.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            ports_attached: self.ports_attached.load(Ordering::Relaxed),
            port_drops: self.port_drops.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatsSnapshot {
    pub relayed: u64,
    pub fetches: u64,
    pub fetch_errors: u64,
    pub ports_attached: u64,
    pub port_drops: u64,
}

/// The one execution context that owns the upstream connection on behalf
/// of every consumer.
///
/// Accepted events go to the broadcast bus and to each attached port; the
/// relay also answers subscribe requests with scoped snapshot fetches and
/// turns admin/game events into refresh/incremental envelopes.
pub struct SharedRelay {
    bus: Arc<BroadcastBus>,
    api: Arc<dyn SnapshotApi>,
    config: RelayConfig,
    ports: DashMap<Uuid, PortHandle>,
    cache: RwLock<RelayCache>,
    stats: RelayStats,
}

impl SharedRelay {
    pub fn new(bus: Arc<BroadcastBus>, api: Arc<dyn SnapshotApi>, config: RelayConfig) -> Self {
        Self {
            bus,
            api,
            config,
            ports: DashMap::new(),
            cache: RwLock::new(RelayCache::default()),
            stats: RelayStats::default(),
        }
    }

    /// Attach a consumer and replay cached state so a late-joining overlay
    /// renders immediately instead of waiting for the next push.
    pub async fn attach(&self) -> RelayPort {
        let (tx, rx) = mpsc::channel(self.config.port_buffer_size);
        let id = Uuid::new_v4();
        self.ports.insert(
            id,
            PortHandle {
                sender: tx.clone(),
                attached_at: Utc::now(),
            },
        );
        self.stats.ports_attached.fetch_add(1, Ordering::Relaxed);

        tracing::info!(port_id = %id, ports = self.ports.len(), "Relay port attached");

        let cache = self.cache.read().await;
        if let Some(message) = &cache.last_match {
            let _ = tx.send(message.clone()).await;
        }
        if let Some(message) = &cache.last_scoped {
            let _ = tx.send(message.clone()).await;
        }

        RelayPort { id, receiver: rx }
    }

    /// Detach a consumer port. Safe to call for an already-removed id.
    pub fn detach(&self, port_id: Uuid) {
        if let Some((_, port)) = self.ports.remove(&port_id) {
            let attached_secs = (Utc::now() - port.attached_at).num_seconds();
            tracing::info!(
                port_id = %port_id,
                ports = self.ports.len(),
                attached_secs = attached_secs,
                "Relay port detached"
            );
        }
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Fetch the current pairing context after a (re)connect so fresh
    /// consumers have match state without waiting for the next push.
    pub(crate) async fn on_connected(&self) {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        match self.api.current_match().await {
            Ok(current) => {
                let message = RelayMessage::untimed(RelayPayload::MatchUpdate(MatchUpdate {
                    current,
                    timestamp: None,
                }));
                self.publish(message).await;
            }
            Err(e) => {
                self.stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Current match fetch after connect failed");
            }
        }
    }

    pub(crate) async fn handle_event(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Ping(ping) => {
                let timestamp = ping.timestamp;
                self.publish(RelayMessage::new(
                    RelayPayload::Ping(ping),
                    Some(timestamp),
                ))
                .await;
            }
            UpstreamEvent::MatchUpdate(update) => {
                let timestamp = update.timestamp;
                let message = RelayMessage::new(RelayPayload::MatchUpdate(update), timestamp);
                if self.publish(message.clone()).await {
                    self.cache.write().await.last_match = Some(message);
                }
            }
            UpstreamEvent::AdminPanelUpdate(update) => {
                let message = RelayMessage::new(
                    RelayPayload::AdminPanelUpdate(update.clone()),
                    Some(update.timestamp),
                );
                if self.publish(message).await {
                    self.refresh_scoped(update).await;
                }
            }
            UpstreamEvent::GamesAdded(games) => {
                let message = RelayMessage::new(
                    RelayPayload::GamesAdded(games.clone()),
                    Some(games.timestamp),
                );
                if self.publish(message).await {
                    self.publish_incremental(games).await;
                }
            }
        }
    }

    /// Answer a subscribe request with a scoped snapshot, or a scoped
    /// error the requesting consumer will recognize.
    pub(crate) async fn handle_subscribe(&self, request: SubscribeRequest) {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);

        match self.fetch_scoped(&request).await {
            Ok(data) => {
                let division_id = data.division.id;
                let message = RelayMessage::untimed(RelayPayload::TournamentDataResponse(
                    TournamentDataResponse {
                        user_id: request.user_id,
                        tournament_id: request.tournament_id,
                        division_id,
                        data,
                    },
                ));
                if self.publish(message.clone()).await {
                    self.cache.write().await.last_scoped = Some(message);
                }
            }
            Err(e) => {
                self.stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    user_id = request.user_id,
                    tournament_id = request.tournament_id,
                    error = %e,
                    "Scoped snapshot fetch failed"
                );
                self.publish(RelayMessage::untimed(RelayPayload::TournamentDataError(
                    TournamentDataError {
                        user_id: request.user_id,
                        tournament_id: request.tournament_id,
                        error: e.to_string(),
                    },
                )))
                .await;
            }
        }
    }

    async fn fetch_scoped(&self, request: &SubscribeRequest) -> Result<DivisionScopedData, ApiError> {
        if let Some(division_id) = request.division_id {
            return self
                .api
                .tournament_division(request.user_id, request.tournament_id, division_id)
                .await;
        }

        let name = request
            .division_name
            .as_deref()
            .ok_or_else(|| ApiError::DivisionNotFound("(unspecified)".to_string()))?;

        let tournament = self
            .api
            .tournament(request.user_id, request.tournament_id)
            .await?;
        DivisionScopedData::scoped_to_name(&tournament, name)
            .ok_or_else(|| ApiError::DivisionNotFound(name.to_string()))
    }

    /// Operator switched tournament/division: push a full replacement
    /// snapshot for the newly selected division.
    async fn refresh_scoped(&self, update: AdminPanelUpdate) {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);

        match self
            .api
            .tournament_division(update.user_id, update.tournament_id, update.division_id)
            .await
        {
            Ok(data) => {
                let message = RelayMessage::new(
                    RelayPayload::TournamentDataRefresh(TournamentDataRefresh {
                        user_id: update.user_id,
                        tournament_id: update.tournament_id,
                        division_id: update.division_id,
                        data,
                    }),
                    Some(update.timestamp),
                );
                if self.publish(message.clone()).await {
                    self.cache.write().await.last_scoped = Some(message);
                }
            }
            Err(e) => {
                self.stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    tournament_id = update.tournament_id,
                    division_id = update.division_id,
                    error = %e,
                    "Refresh fetch failed"
                );
                self.publish(RelayMessage::untimed(RelayPayload::TournamentDataError(
                    TournamentDataError {
                        user_id: update.user_id,
                        tournament_id: update.tournament_id,
                        error: e.to_string(),
                    },
                )))
                .await;
            }
        }
    }

    /// New games landed: forward the delta only. Consumers merge it into
    /// their existing snapshot.
    async fn publish_incremental(&self, games: GamesAdded) {
        let added_count = games.changes.added_count();
        let updated_count = games.changes.updated_count();

        self.publish(RelayMessage::new(
            RelayPayload::TournamentDataIncremental(TournamentDataIncremental {
                user_id: games.user_id,
                tournament_id: games.tournament_id,
                division_id: games.division_id,
                changes: games.changes,
                added_count,
                updated_count,
            }),
            Some(games.timestamp),
        ))
        .await;
    }

    /// Publish on the bus; on acceptance, forward to every attached port.
    /// Returns whether the message was accepted.
    async fn publish(&self, message: RelayMessage) -> bool {
        if !self.bus.publish(&message) {
            return false;
        }
        self.stats.relayed.fetch_add(1, Ordering::Relaxed);
        self.forward_to_ports(&message).await;
        true
    }

    async fn forward_to_ports(&self, message: &RelayMessage) {
        if self.ports.is_empty() {
            return;
        }

        // Collect senders first; sending must not hold map shards.
        let targets: Vec<(Uuid, mpsc::Sender<RelayMessage>)> = self
            .ports
            .iter()
            .map(|entry| (*entry.key(), entry.value().sender.clone()))
            .collect();

        for (id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.port_drops.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(port_id = %id, "Port buffer full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::info!(port_id = %id, "Removing dead relay port");
                    self.ports.remove(&id);
                }
            }
        }
    }
}

/// Event loop gluing the connection manager, the bus, and the relay.
pub struct RelayTask {
    relay: Arc<SharedRelay>,
    events: mpsc::Receiver<UpstreamEvent>,
    subscribes: mpsc::UnboundedReceiver<SubscribeRequest>,
    state_changes: watch::Receiver<ConnectionState>,
    shutdown: broadcast::Receiver<()>,
}

impl RelayTask {
    pub fn new(
        relay: Arc<SharedRelay>,
        events: mpsc::Receiver<UpstreamEvent>,
        subscribes: mpsc::UnboundedReceiver<SubscribeRequest>,
        state_changes: watch::Receiver<ConnectionState>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            relay,
            events,
            subscribes,
            state_changes,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Relay task started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Relay task received shutdown signal");
                    break;
                }
                changed = self.state_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = self.state_changes.borrow_and_update().clone();
                    if state.is_connected() {
                        self.relay.on_connected().await;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.relay.handle_event(event).await,
                    None => break,
                },
                request = self.subscribes.recv() => match request {
                    Some(request) => self.relay.handle_subscribe(request).await,
                    None => break,
                },
            }
        }

        tracing::info!("Relay task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::protocol::{
        CurrentMatch, Division, Game, GameChanges, MessageKind, PingEvent, Tournament,
    };
    use async_trait::async_trait;

    struct StaticApi {
        tournament: Tournament,
    }

    #[async_trait]
    impl SnapshotApi for StaticApi {
        async fn current_match(&self) -> Result<CurrentMatch, ApiError> {
            Ok(CurrentMatch {
                user_id: 1,
                tournament_id: self.tournament.id,
                division_id: 0,
                division_name: "A".to_string(),
                round: 1,
                pairing_id: 1,
            })
        }

        async fn tournament(&self, _user_id: i64, _tournament_id: i64) -> Result<Tournament, ApiError> {
            Ok(self.tournament.clone())
        }

        async fn tournament_division(
            &self,
            _user_id: i64,
            _tournament_id: i64,
            division_id: i64,
        ) -> Result<DivisionScopedData, ApiError> {
            DivisionScopedData::scoped_to_id(&self.tournament, division_id)
                .ok_or(ApiError::DivisionNotFound(division_id.to_string()))
        }
    }

    fn sample_tournament() -> Tournament {
        Tournament {
            id: 100,
            user_id: 1,
            name: "Test Open".to_string(),
            divisions: vec![Division {
                id: 0,
                name: "A".to_string(),
                players: vec![],
                games: vec![],
            }],
        }
    }

    fn test_relay() -> (Arc<SharedRelay>, Arc<BroadcastBus>) {
        let bus = Arc::new(BroadcastBus::new());
        let api = Arc::new(StaticApi {
            tournament: sample_tournament(),
        });
        let relay = Arc::new(SharedRelay::new(
            bus.clone(),
            api,
            RelayConfig::default(),
        ));
        (relay, bus)
    }

    fn game(id: i64) -> Game {
        Game {
            id,
            division_id: 0,
            round: 1,
            player1_id: 1,
            player2_id: 2,
            player1_score: 420,
            player2_score: 380,
            pairing_id: None,
        }
    }

    #[tokio::test]
    async fn test_ports_receive_relayed_events() {
        let (relay, _bus) = test_relay();
        let mut port = relay.attach().await;

        relay
            .handle_event(UpstreamEvent::Ping(PingEvent {
                message_id: 1,
                timestamp: 10,
            }))
            .await;

        let message = port.receiver.recv().await.unwrap();
        assert_eq!(message.kind(), MessageKind::Ping);
    }

    #[tokio::test]
    async fn test_duplicate_event_not_forwarded_to_ports() {
        let (relay, _bus) = test_relay();
        let mut port = relay.attach().await;

        let ping = UpstreamEvent::Ping(PingEvent {
            message_id: 1,
            timestamp: 10,
        });
        relay.handle_event(ping.clone()).await;
        relay.handle_event(ping).await;

        assert!(port.receiver.recv().await.is_some());
        assert!(port.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_port_gets_cached_match() {
        let (relay, _bus) = test_relay();

        relay
            .handle_event(UpstreamEvent::MatchUpdate(MatchUpdate {
                current: CurrentMatch {
                    user_id: 1,
                    tournament_id: 100,
                    division_id: 0,
                    division_name: "A".to_string(),
                    round: 3,
                    pairing_id: 12,
                },
                timestamp: Some(50),
            }))
            .await;

        let mut port = relay.attach().await;
        let replayed = port.receiver.recv().await.unwrap();
        match replayed.payload {
            RelayPayload::MatchUpdate(update) => assert_eq!(update.current.round, 3),
            other => panic!("Expected cached match update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_produces_scoped_response() {
        let (relay, bus) = test_relay();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _tap = bus.subscribe(MessageKind::TournamentDataResponse, move |message| {
            seen_clone.lock().unwrap().push(message.clone());
        });

        relay
            .handle_subscribe(SubscribeRequest {
                user_id: 1,
                tournament_id: 100,
                division_id: Some(0),
                division_name: None,
            })
            .await;

        let messages = seen.lock().unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0].payload {
            RelayPayload::TournamentDataResponse(response) => {
                assert_eq!(response.division_id, 0);
                assert_eq!(response.data.tournament.id, 100);
            }
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_by_name_resolves_division() {
        let (relay, bus) = test_relay();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _tap = bus.subscribe(MessageKind::TournamentDataResponse, move |message| {
            seen_clone.lock().unwrap().push(message.clone());
        });

        relay
            .handle_subscribe(SubscribeRequest {
                user_id: 1,
                tournament_id: 100,
                division_id: None,
                division_name: Some("a".to_string()),
            })
            .await;

        let messages = seen.lock().unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_division_yields_scoped_error() {
        let (relay, bus) = test_relay();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _tap = bus.subscribe(MessageKind::TournamentDataError, move |message| {
            seen_clone.lock().unwrap().push(message.clone());
        });

        relay
            .handle_subscribe(SubscribeRequest {
                user_id: 1,
                tournament_id: 100,
                division_id: Some(42),
                division_name: None,
            })
            .await;

        let messages = seen.lock().unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0].payload {
            RelayPayload::TournamentDataError(error) => {
                assert_eq!(error.tournament_id, 100);
                assert!(!error.error.is_empty());
            }
            other => panic!("Expected error, got {other:?}"),
        }
        assert_eq!(relay.stats().fetch_errors, 1);
    }

    #[tokio::test]
    async fn test_games_added_produces_delta_only_incremental() {
        let (relay, _bus) = test_relay();
        let mut port = relay.attach().await;

        relay
            .handle_event(UpstreamEvent::GamesAdded(GamesAdded {
                user_id: 1,
                tournament_id: 100,
                division_id: 0,
                changes: GameChanges {
                    added: vec![game(1), game(2)],
                    updated: vec![],
                },
                timestamp: 70,
            }))
            .await;

        // Raw event first, then the derived incremental.
        let raw = port.receiver.recv().await.unwrap();
        assert_eq!(raw.kind(), MessageKind::GamesAdded);

        let derived = port.receiver.recv().await.unwrap();
        match derived.payload {
            RelayPayload::TournamentDataIncremental(delta) => {
                assert_eq!(delta.added_count, 2);
                assert_eq!(delta.updated_count, 0);
                assert_eq!(delta.changes.added.len(), 2);
            }
            other => panic!("Expected incremental, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let (relay, _bus) = test_relay();
        let port = relay.attach().await;
        assert_eq!(relay.port_count(), 1);

        relay.detach(port.id);
        assert_eq!(relay.port_count(), 0);
    }
}
