use std::time::Instant;

use halo_core::config::AppConfig;
use halo_llm::ChatDispatcher;

/// Shared state for every request handler.
pub struct AppState {
    pub config: AppConfig,
    pub dispatcher: ChatDispatcher,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let dispatcher = ChatDispatcher::new(&config);
        Self::with_dispatcher(config, dispatcher)
    }

    pub fn with_dispatcher(config: AppConfig, dispatcher: ChatDispatcher) -> Self {
        Self {
            config,
            dispatcher,
            started_at: Instant::now(),
        }
    }
}
