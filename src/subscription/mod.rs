use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::bus::{BroadcastBus, BusSubscription};
use crate::error::{RelayError, Result};
use crate::protocol::{
    DivisionScopedData, GameChanges, MessageKind, RelayMessage, RelayPayload, SubscribeRequest,
};

/// The data slice one consumer cares about. Replaced wholesale whenever any
/// field changes; lives exactly as long as the owning overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub user_id: i64,
    pub tournament_id: i64,
    pub division_id: Option<i64>,
    pub division_name: Option<String>,
}

impl Subscription {
    /// A subscription needs a user, a tournament, and at least one way to
    /// name the division. Checked before any network traffic.
    pub fn validate(&self) -> Result<()> {
        if self.user_id <= 0 {
            return Err(RelayError::MissingParameter("userId"));
        }
        if self.tournament_id <= 0 {
            return Err(RelayError::MissingParameter("tournamentId"));
        }
        if self.division_id.is_none() && self.division_name.is_none() {
            return Err(RelayError::MissingParameter("divisionId or divisionName"));
        }
        Ok(())
    }

    /// Relevance test for division-scoped messages. A subscription without
    /// a division id accepts any division of its tournament.
    pub fn matches(&self, user_id: i64, tournament_id: i64, division_id: Option<i64>) -> bool {
        if self.user_id != user_id || self.tournament_id != tournament_id {
            return false;
        }
        match self.division_id {
            None => true,
            Some(expected) => division_id == Some(expected),
        }
    }

    /// Relevance test for error messages, which carry no division.
    pub fn matches_tournament(&self, user_id: i64, tournament_id: i64) -> bool {
        self.user_id == user_id && self.tournament_id == tournament_id
    }

    fn request(&self) -> SubscribeRequest {
        SubscribeRequest {
            user_id: self.user_id,
            tournament_id: self.tournament_id,
            division_id: self.division_id,
            division_name: self.division_name.clone(),
        }
    }
}

/// Scoped updates surfaced to the consumer, already filtered against its
/// subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopedUpdate {
    /// Answer to an explicit subscribe; replaces state unconditionally.
    Response(DivisionScopedData),
    /// Admin-originated change; replaces state unconditionally.
    Refresh(DivisionScopedData),
    /// Delta to merge into existing state; never a full snapshot.
    Incremental {
        changes: GameChanges,
        added_count: usize,
        updated_count: usize,
    },
    /// Scoped fetch failed; message text verbatim. The consumer keeps its
    /// last good snapshot.
    Error(String),
}

/// Per-consumer subscription tracking.
///
/// Registers filtering handlers on the broadcast bus and forwards only the
/// messages relevant to the consumer's current tuple. Dropping the
/// registry removes its handlers synchronously.
pub struct SubscriptionRegistry {
    bus: Arc<BroadcastBus>,
    current: watch::Sender<Option<Subscription>>,
    _guards: Vec<BusSubscription>,
}

impl SubscriptionRegistry {
    /// Attach a consumer to the bus. Returns the registry plus the channel
    /// on which filtered [`ScopedUpdate`]s arrive.
    pub fn attach(bus: &Arc<BroadcastBus>) -> (Self, mpsc::UnboundedReceiver<ScopedUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (current_tx, _) = watch::channel(None::<Subscription>);

        let mut guards = Vec::with_capacity(4);

        guards.push(bus.subscribe(MessageKind::TournamentDataResponse, {
            let current = current_tx.subscribe();
            let updates = updates_tx.clone();
            move |message: &RelayMessage| {
                if let RelayPayload::TournamentDataResponse(response) = &message.payload {
                    let relevant = current.borrow().as_ref().is_some_and(|s| {
                        s.matches(
                            response.user_id,
                            response.tournament_id,
                            Some(response.division_id),
                        )
                    });
                    if relevant {
                        let _ = updates.send(ScopedUpdate::Response(response.data.clone()));
                    }
                }
            }
        }));

        guards.push(bus.subscribe(MessageKind::TournamentDataRefresh, {
            let current = current_tx.subscribe();
            let updates = updates_tx.clone();
            move |message: &RelayMessage| {
                if let RelayPayload::TournamentDataRefresh(refresh) = &message.payload {
                    let relevant = current.borrow().as_ref().is_some_and(|s| {
                        s.matches(
                            refresh.user_id,
                            refresh.tournament_id,
                            Some(refresh.division_id),
                        )
                    });
                    if relevant {
                        let _ = updates.send(ScopedUpdate::Refresh(refresh.data.clone()));
                    }
                }
            }
        }));

        guards.push(bus.subscribe(MessageKind::TournamentDataIncremental, {
            let current = current_tx.subscribe();
            let updates = updates_tx.clone();
            move |message: &RelayMessage| {
                if let RelayPayload::TournamentDataIncremental(delta) = &message.payload {
                    let relevant = current.borrow().as_ref().is_some_and(|s| {
                        s.matches(delta.user_id, delta.tournament_id, Some(delta.division_id))
                    });
                    if relevant {
                        let _ = updates.send(ScopedUpdate::Incremental {
                            changes: delta.changes.clone(),
                            added_count: delta.added_count,
                            updated_count: delta.updated_count,
                        });
                    }
                }
            }
        }));

        guards.push(bus.subscribe(MessageKind::TournamentDataError, {
            let current = current_tx.subscribe();
            let updates = updates_tx.clone();
            move |message: &RelayMessage| {
                if let RelayPayload::TournamentDataError(error) = &message.payload {
                    let relevant = current
                        .borrow()
                        .as_ref()
                        .is_some_and(|s| s.matches_tournament(error.user_id, error.tournament_id));
                    if relevant {
                        let _ = updates.send(ScopedUpdate::Error(error.error.clone()));
                    }
                }
            }
        }));

        let registry = Self {
            bus: bus.clone(),
            current: current_tx,
            _guards: guards,
        };

        (registry, updates_rx)
    }

    /// Record the consumer's slice and request a fresh snapshot for it.
    ///
    /// Replaces any previous subscription. Operators switching the live
    /// tournament/division call this again; the relay never pushes data
    /// for a tuple nobody asked for.
    pub fn subscribe(&self, subscription: Subscription) -> Result<()> {
        subscription.validate()?;

        tracing::info!(
            user_id = subscription.user_id,
            tournament_id = subscription.tournament_id,
            division_id = ?subscription.division_id,
            division_name = ?subscription.division_name,
            "Subscribing to tournament slice"
        );

        let request = subscription.request();
        self.current.send_replace(Some(subscription));

        self.bus
            .publish(&RelayMessage::untimed(RelayPayload::Subscribe(request)));
        Ok(())
    }

    /// The currently recorded subscription, if any.
    pub fn current(&self) -> Option<Subscription> {
        self.current.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        Division, TournamentDataError, TournamentDataIncremental, TournamentDataRefresh,
        TournamentMeta,
    };

    fn scoped_data(user_id: i64, tournament_id: i64, division_id: i64) -> DivisionScopedData {
        DivisionScopedData {
            tournament: TournamentMeta {
                id: tournament_id,
                user_id,
                name: "Test Open".to_string(),
            },
            division: Division {
                id: division_id,
                name: format!("D{division_id}"),
                players: vec![],
                games: vec![],
            },
        }
    }

    fn refresh_message(user_id: i64, tournament_id: i64, division_id: i64) -> RelayMessage {
        RelayMessage::untimed(RelayPayload::TournamentDataRefresh(TournamentDataRefresh {
            user_id,
            tournament_id,
            division_id,
            data: scoped_data(user_id, tournament_id, division_id),
        }))
    }

    fn subscription(user_id: i64, tournament_id: i64, division_id: Option<i64>) -> Subscription {
        Subscription {
            user_id,
            tournament_id,
            division_id,
            division_name: None,
        }
    }

    #[test]
    fn test_validation_requires_division_id_or_name() {
        let missing = Subscription {
            user_id: 1,
            tournament_id: 5,
            division_id: None,
            division_name: None,
        };
        assert!(matches!(
            missing.validate(),
            Err(RelayError::MissingParameter(_))
        ));

        let by_id = subscription(1, 5, Some(0));
        assert!(by_id.validate().is_ok());

        let by_name = Subscription {
            user_id: 1,
            tournament_id: 5,
            division_id: None,
            division_name: Some("A".to_string()),
        };
        assert!(by_name.validate().is_ok());
    }

    #[test]
    fn test_validation_requires_user_and_tournament() {
        let no_user = subscription(0, 5, Some(1));
        assert!(matches!(
            no_user.validate(),
            Err(RelayError::MissingParameter("userId"))
        ));

        let no_tournament = subscription(1, 0, Some(1));
        assert!(matches!(
            no_tournament.validate(),
            Err(RelayError::MissingParameter("tournamentId"))
        ));
    }

    #[test]
    fn test_matching_rule() {
        let sub = subscription(1, 5, Some(2));

        assert!(sub.matches(1, 5, Some(2)));
        assert!(!sub.matches(1, 5, Some(3)));
        assert!(!sub.matches(1, 6, Some(2)));
        assert!(!sub.matches(2, 5, Some(2)));

        // Division left open: any division of the tournament matches.
        let open = subscription(1, 5, None);
        assert!(open.matches(1, 5, Some(2)));
        assert!(open.matches(1, 5, Some(9)));
        assert!(!open.matches(1, 6, Some(2)));
    }

    #[tokio::test]
    async fn test_refresh_delivered_only_to_matching_consumer() {
        let bus = Arc::new(BroadcastBus::new());
        let (registry, mut updates) = SubscriptionRegistry::attach(&bus);
        let (other_registry, mut other_updates) = SubscriptionRegistry::attach(&bus);

        registry.subscribe(subscription(1, 5, Some(2))).unwrap();
        other_registry.subscribe(subscription(1, 5, Some(3))).unwrap();

        bus.publish(&refresh_message(1, 5, 2));

        match updates.try_recv().unwrap() {
            ScopedUpdate::Refresh(data) => assert_eq!(data.division.id, 2),
            other => panic!("Expected refresh, got {other:?}"),
        }
        assert!(other_updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_publishes_request_and_replaces_tuple() {
        let bus = Arc::new(BroadcastBus::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _tap = bus.subscribe(MessageKind::Subscribe, move |message| {
            if let RelayPayload::Subscribe(request) = &message.payload {
                seen_clone.lock().unwrap().push(request.clone());
            }
        });

        let (registry, mut updates) = SubscriptionRegistry::attach(&bus);
        registry.subscribe(subscription(1, 5, Some(2))).unwrap();
        registry.subscribe(subscription(1, 6, Some(0))).unwrap();

        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].tournament_id, 6);
        assert_eq!(registry.current().unwrap().tournament_id, 6);

        // The old tuple no longer matches after replacement.
        bus.publish(&refresh_message(1, 5, 2));
        assert!(updates.try_recv().is_err());

        bus.publish(&refresh_message(1, 6, 0));
        assert!(matches!(
            updates.try_recv().unwrap(),
            ScopedUpdate::Refresh(_)
        ));
    }

    #[tokio::test]
    async fn test_incremental_and_error_filtering() {
        let bus = Arc::new(BroadcastBus::new());
        let (registry, mut updates) = SubscriptionRegistry::attach(&bus);
        registry.subscribe(subscription(1, 100, Some(0))).unwrap();

        bus.publish(&RelayMessage::untimed(
            RelayPayload::TournamentDataIncremental(TournamentDataIncremental {
                user_id: 1,
                tournament_id: 100,
                division_id: 0,
                changes: GameChanges::default(),
                added_count: 2,
                updated_count: 0,
            }),
        ));

        match updates.try_recv().unwrap() {
            ScopedUpdate::Incremental { added_count, .. } => assert_eq!(added_count, 2),
            other => panic!("Expected incremental, got {other:?}"),
        }

        // Error for another tournament is ignored; matching one surfaces.
        bus.publish(&RelayMessage::untimed(RelayPayload::TournamentDataError(
            TournamentDataError {
                user_id: 1,
                tournament_id: 999,
                error: "fetch failed".to_string(),
            },
        )));
        assert!(updates.try_recv().is_err());

        bus.publish(&RelayMessage::untimed(RelayPayload::TournamentDataError(
            TournamentDataError {
                user_id: 1,
                tournament_id: 100,
                error: "fetch failed".to_string(),
            },
        )));
        assert_eq!(
            updates.try_recv().unwrap(),
            ScopedUpdate::Error("fetch failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_dropped_registry_removes_handlers() {
        let bus = Arc::new(BroadcastBus::new());
        {
            let (_registry, _updates) = SubscriptionRegistry::attach(&bus);
            assert_eq!(bus.handler_count(MessageKind::TournamentDataRefresh), 1);
        }
        assert_eq!(bus.handler_count(MessageKind::TournamentDataRefresh), 0);
    }
}
