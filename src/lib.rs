pub mod bridge;
pub mod config;
pub mod error;
pub mod models;
pub mod relay;
pub mod state;

use std::sync::Arc;

pub use config::EngineConfig;
pub use error::{AppError, AppResult};
pub use relay::dispatch::Dispatcher;
pub use relay::orchestrator::Orchestrator;

use bridge::surface::BridgeSurface;
use relay::api::{CredentialStore, OpenAiCompatClient};

/// Install the global logger. Debug builds log at debug level, release
/// builds at info; `RUST_LOG` overrides either.
pub fn init_logging() {
    let level = if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    // A logger installed by the host application wins
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init();
}

/// An orchestrator driving responders through bridge processes, with direct
/// API access for responders that have credentials.
///
/// Bridges are attached to the returned surface per responder instance.
pub fn orchestrator_with_bridges(
    config: EngineConfig,
    credentials: Option<Arc<dyn CredentialStore>>,
) -> AppResult<(Orchestrator, Arc<BridgeSurface>)> {
    let surface = Arc::new(BridgeSurface::new(config.bridge_script.clone()));
    let mut dispatcher = Dispatcher::new(config.clone(), surface.clone());
    if let Some(credentials) = credentials {
        let client = OpenAiCompatClient::new(config.api_timeout())?;
        dispatcher = dispatcher.with_api(credentials, Arc::new(client));
    }
    log::info!("Orchestrator ready (config: {:?})", config);
    Ok((Orchestrator::new(dispatcher), surface))
}
