use serde::{Deserialize, Serialize};

use super::data::{CurrentMatch, DivisionScopedData, GameChanges};

/// Closed set of message kinds carried on the broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    MatchUpdate,
    AdminPanelUpdate,
    GamesAdded,
    Ping,
    Subscribe,
    TournamentDataResponse,
    TournamentDataRefresh,
    TournamentDataIncremental,
    TournamentDataError,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::MatchUpdate => "matchUpdate",
            MessageKind::AdminPanelUpdate => "AdminPanelUpdate",
            MessageKind::GamesAdded => "GamesAdded",
            MessageKind::Ping => "Ping",
            MessageKind::Subscribe => "SUBSCRIBE",
            MessageKind::TournamentDataResponse => "TOURNAMENT_DATA_RESPONSE",
            MessageKind::TournamentDataRefresh => "TOURNAMENT_DATA_REFRESH",
            MessageKind::TournamentDataIncremental => "TOURNAMENT_DATA_INCREMENTAL",
            MessageKind::TournamentDataError => "TOURNAMENT_DATA_ERROR",
        };
        f.write_str(name)
    }
}

/// Server heartbeat carrying the upstream sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingEvent {
    pub message_id: u64,
    pub timestamp: i64,
}

/// Live pairing context pushed on every match change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchUpdate {
    #[serde(flatten)]
    pub current: CurrentMatch,
    /// Absent when the update came from a fallback poll.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Operator switched the live tournament/division in the admin panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminPanelUpdate {
    pub user_id: i64,
    pub tournament_id: i64,
    pub division_id: i64,
    pub division_name: String,
    pub round: i32,
    pub pairing_id: i64,
    pub timestamp: i64,
}

/// New or corrected game results landed for one division.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GamesAdded {
    pub user_id: i64,
    pub tournament_id: i64,
    pub division_id: i64,
    pub changes: GameChanges,
    pub timestamp: i64,
}

/// Consumer-declared data slice: which tournament and which division.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub user_id: i64,
    pub tournament_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub division_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub division_name: Option<String>,
}

/// Full snapshot answering an explicit subscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentDataResponse {
    pub user_id: i64,
    pub tournament_id: i64,
    pub division_id: i64,
    pub data: DivisionScopedData,
}

/// Full snapshot pushed after an admin-originated change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentDataRefresh {
    pub user_id: i64,
    pub tournament_id: i64,
    pub division_id: i64,
    pub data: DivisionScopedData,
}

/// Delta-only update; consumers merge it into their existing snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentDataIncremental {
    pub user_id: i64,
    pub tournament_id: i64,
    pub division_id: i64,
    pub changes: GameChanges,
    pub added_count: usize,
    pub updated_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentDataError {
    pub user_id: i64,
    pub tournament_id: i64,
    pub error: String,
}

/// Domain events decoded off the upstream push connection. Transport-level
/// connect/disconnect/error are surfaced as connection-state transitions,
/// not events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UpstreamEvent {
    #[serde(rename = "Ping", alias = "ping")]
    Ping(PingEvent),
    #[serde(rename = "matchUpdate")]
    MatchUpdate(MatchUpdate),
    #[serde(rename = "AdminPanelUpdate")]
    AdminPanelUpdate(AdminPanelUpdate),
    #[serde(rename = "GamesAdded")]
    GamesAdded(GamesAdded),
}

impl UpstreamEvent {
    /// Upstream sequence timestamp, when the event carries one.
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            UpstreamEvent::Ping(p) => Some(p.timestamp),
            UpstreamEvent::MatchUpdate(m) => m.timestamp,
            UpstreamEvent::AdminPanelUpdate(a) => Some(a.timestamp),
            UpstreamEvent::GamesAdded(g) => Some(g.timestamp),
        }
    }
}

/// Typed payload of a broadcast envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RelayPayload {
    #[serde(rename = "matchUpdate")]
    MatchUpdate(MatchUpdate),
    #[serde(rename = "AdminPanelUpdate")]
    AdminPanelUpdate(AdminPanelUpdate),
    #[serde(rename = "GamesAdded")]
    GamesAdded(GamesAdded),
    #[serde(rename = "Ping")]
    Ping(PingEvent),
    #[serde(rename = "SUBSCRIBE")]
    Subscribe(SubscribeRequest),
    #[serde(rename = "TOURNAMENT_DATA_RESPONSE")]
    TournamentDataResponse(TournamentDataResponse),
    #[serde(rename = "TOURNAMENT_DATA_REFRESH")]
    TournamentDataRefresh(TournamentDataRefresh),
    #[serde(rename = "TOURNAMENT_DATA_INCREMENTAL")]
    TournamentDataIncremental(TournamentDataIncremental),
    #[serde(rename = "TOURNAMENT_DATA_ERROR")]
    TournamentDataError(TournamentDataError),
}

impl RelayPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            RelayPayload::MatchUpdate(_) => MessageKind::MatchUpdate,
            RelayPayload::AdminPanelUpdate(_) => MessageKind::AdminPanelUpdate,
            RelayPayload::GamesAdded(_) => MessageKind::GamesAdded,
            RelayPayload::Ping(_) => MessageKind::Ping,
            RelayPayload::Subscribe(_) => MessageKind::Subscribe,
            RelayPayload::TournamentDataResponse(_) => MessageKind::TournamentDataResponse,
            RelayPayload::TournamentDataRefresh(_) => MessageKind::TournamentDataRefresh,
            RelayPayload::TournamentDataIncremental(_) => MessageKind::TournamentDataIncremental,
            RelayPayload::TournamentDataError(_) => MessageKind::TournamentDataError,
        }
    }
}

/// Envelope posted on the broadcast channel: `{ type, data, timestamp }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(flatten)]
    pub payload: RelayPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl RelayMessage {
    pub fn new(payload: RelayPayload, timestamp: Option<i64>) -> Self {
        Self { payload, timestamp }
    }

    /// Envelope for a locally produced message with no upstream sequence.
    pub fn untimed(payload: RelayPayload) -> Self {
        Self {
            payload,
            timestamp: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

impl From<UpstreamEvent> for RelayMessage {
    fn from(event: UpstreamEvent) -> Self {
        let timestamp = event.timestamp();
        let payload = match event {
            UpstreamEvent::Ping(p) => RelayPayload::Ping(p),
            UpstreamEvent::MatchUpdate(m) => RelayPayload::MatchUpdate(m),
            UpstreamEvent::AdminPanelUpdate(a) => RelayPayload::AdminPanelUpdate(a),
            UpstreamEvent::GamesAdded(g) => RelayPayload::GamesAdded(g),
        };
        Self { payload, timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_admin_panel_update_event() {
        let json = r#"{
            "type": "AdminPanelUpdate",
            "data": {
                "userId": 1,
                "tournamentId": 100,
                "divisionId": 2,
                "divisionName": "A",
                "round": 7,
                "pairingId": 31,
                "timestamp": 1720000000000
            }
        }"#;

        let event: UpstreamEvent = serde_json::from_str(json).unwrap();
        match &event {
            UpstreamEvent::AdminPanelUpdate(update) => {
                assert_eq!(update.tournament_id, 100);
                assert_eq!(update.division_name, "A");
            }
            other => panic!("Expected AdminPanelUpdate, got {other:?}"),
        }
        assert_eq!(event.timestamp(), Some(1_720_000_000_000));
    }

    #[test]
    fn test_parse_ping_event_lowercase_alias() {
        let json = r#"{"type": "ping", "data": {"messageId": 4, "timestamp": 99}}"#;
        let event: UpstreamEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, UpstreamEvent::Ping(_)));
    }

    #[test]
    fn test_subscribe_envelope_wire_shape() {
        let message = RelayMessage::untimed(RelayPayload::Subscribe(SubscribeRequest {
            user_id: 1,
            tournament_id: 100,
            division_id: Some(0),
            division_name: None,
        }));

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "SUBSCRIBE");
        assert_eq!(json["data"]["userId"], 1);
        assert_eq!(json["data"]["tournamentId"], 100);
        assert!(json["data"].get("divisionName").is_none());
        assert!(json.get("timestamp").is_none());
    }

    #[test]
    fn test_upstream_event_into_relay_message_keeps_timestamp() {
        let event = UpstreamEvent::Ping(PingEvent {
            message_id: 8,
            timestamp: 1234,
        });

        let message = RelayMessage::from(event);
        assert_eq!(message.kind(), MessageKind::Ping);
        assert_eq!(message.timestamp, Some(1234));
    }
}
