pub mod settings;

pub use settings::{ApiConfig, RelayConfig, Settings, UpstreamConfig};
