use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::store::SharedStore;
use crate::ws::hub::Hub;

/// Runtime knobs for the hub, resolved from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_frame_bytes: usize,
    pub store_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            max_frame_bytes: 16 * 1024,
            store_timeout: Duration::from_secs(10),
        }
    }
}

impl HubSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            max_frame_bytes: config.max_frame_bytes,
            store_timeout: Duration::from_secs(config.store_timeout_secs),
        }
    }
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Live connections and topic subscriptions for this server instance
    pub hub: Arc<Hub>,
    /// External prediction store
    pub store: SharedStore,
    pub settings: HubSettings,
    /// HS256 secret for session-token credentials; token logins are refused
    /// when unset
    pub jwt_secret: Option<Arc<[u8]>>,
    /// Connection actors, awaited on shutdown so queued frames get written
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(store: SharedStore, settings: HubSettings) -> Self {
        Self {
            hub: Arc::new(Hub::new()),
            store,
            settings,
            jwt_secret: None,
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_jwt_secret(mut self, secret: Vec<u8>) -> Self {
        self.jwt_secret = Some(Arc::from(secret));
        self
    }
}
