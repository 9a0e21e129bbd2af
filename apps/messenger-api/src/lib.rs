pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod push;
pub mod repo;
pub mod routes;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use gateway::call_hub::CallHub;
use gateway::chat_hub::ChatHub;
use push::PushNotifier;
use repo::ChatRepository;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KeyValueStore>,
    pub config: Arc<Config>,
    pub chat_hub: Arc<ChatHub>,
    pub call_hub: Arc<CallHub>,
}

impl AppState {
    /// Build both hubs from `config` around the given collaborators.
    pub fn new(
        config: Config,
        repo: Arc<dyn ChatRepository>,
        push: Arc<dyn PushNotifier>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        let chat_hub = Arc::new(ChatHub::new(repo, push, config.hub_settings()));
        let call_hub = Arc::new(CallHub::new(config.call_settings()));
        Self {
            kv,
            config: Arc::new(config),
            chat_hub,
            call_hub,
        }
    }
}
