// Upstream push-connection ownership: exactly one live socket per manager,
// with reconnect policy, idle watchdog, and HTTP polling fallback.

pub mod backoff;
pub mod manager;
pub mod state;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use manager::{ConnectionManager, ManagerHandle};
pub use state::ConnectionState;
