pub mod buffer;
pub mod clock;
pub mod config;
pub mod context;
pub mod crypto;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod feature;
pub mod instance;
pub mod mux;
pub mod net;
pub mod policy;
pub mod protocol;
pub mod proxy;
pub mod proxyman;
pub mod ray;
pub mod signal;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use config::{Config, Registry};
pub use context::DispatchContext;
pub use error::PolyrayError;
pub use instance::Instance;
pub use net::{AsyncStream, Destination, Network, Result, TargetAddr};

/// Installs the process logger. Level defaults to `info` and is
/// overridden by `POLYRAY_LOG_LEVEL`.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("POLYRAY_LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Builds, starts and runs an instance until the task is cancelled or
/// the process ends.
pub async fn run(config: Config) -> Result<()> {
    let instance = Instance::new(config).await?;
    instance.start().await?;
    tracing::info!("polyray {} is up", env!("CARGO_PKG_VERSION"));

    tokio::signal::ctrl_c().await?;
    instance.close().await?;
    Ok(())
}
