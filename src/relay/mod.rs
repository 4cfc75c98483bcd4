pub mod service;
pub mod shared;

pub use service::RelayService;
pub use shared::{RelayPort, RelayStatsSnapshot, RelayTask, SharedRelay};
