//! Process-wide shared state: the Store, Registry, and live config, wired
//! together and threaded through the HTTP layer and the background loops
//! via `Arc`, plus the cancellation token that drives graceful shutdown.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::registry::Registry;
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub registry: Registry,
    pub config: RwLock<Config>,
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(store: Store, config: Config) -> SharedState {
        Arc::new(Self {
            store,
            registry: Registry::new(),
            config: RwLock::new(config),
            shutdown: CancellationToken::new(),
        })
    }
}
