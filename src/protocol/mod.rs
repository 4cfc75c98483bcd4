// Wire and broadcast message shapes shared by every component.

pub mod data;
pub mod message;

pub use data::{
    CurrentMatch, Division, DivisionScopedData, Game, GameChanges, Player, Tournament,
    TournamentMeta,
};
pub use message::{
    AdminPanelUpdate, GamesAdded, MatchUpdate, MessageKind, PingEvent, RelayMessage,
    RelayPayload, SubscribeRequest, TournamentDataError, TournamentDataIncremental,
    TournamentDataRefresh, TournamentDataResponse, UpstreamEvent,
};

/// Fixed, origin-scoped channel name shared by relay and overlays.
pub const BROADCAST_CHANNEL_NAME: &str = "tournament-updates";
