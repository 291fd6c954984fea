use crate::config::AppConfig;
use crate::registry::Registry;
use std::sync::Arc;

/// Global application context shared by the HTTP layer, the lifecycle
/// engine and the reaper. The registry is the single source of truth for
/// which streams are running; nothing else holds process records.
pub struct AppState {
    pub config: AppConfig,
    pub registry: Registry,
}

pub type SharedState = Arc<AppState>;
