pub mod api;
pub mod bridge;
pub mod config;
pub mod fulfillment;
pub mod metrics;
pub mod platform;
pub mod protocol;
pub mod sandbox;
mod timer;
pub mod upstream;

pub use config::Config;
pub use config::LogLevel;
pub use metrics::Metric;
pub use metrics::Metrics;
pub use platform::Platform;
