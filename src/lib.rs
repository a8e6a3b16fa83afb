use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

pub mod auth;
pub mod client;
pub mod config;
pub mod database;
pub mod error;
pub mod keys;
pub mod list;
pub mod models;
pub mod network;
pub mod resources;
pub mod sync;
pub mod transport;

pub use auth::{AuthEvent, AuthManager, SecretBox, SessionStore};
pub use client::ApiClient;
pub use config::ClientConfig;
pub use database::Database;
pub use error::ApiError;
pub use list::{fetch_list_with_cache, CachedList, ListCache, PagedList};
pub use models::{DrainReport, DrainSkip, HttpMethod, OfflineAck, PendingOperation, QueueStats};
pub use network::{check_online_status, Connectivity, ConnectivityEvent};
pub use resources::Resource;
pub use sync::OfflineQueue;
pub use transport::{ApiRequest, ApiResponse, RequestOptions, ReqwestTransport, Transport};

#[cfg(test)]
mod tests;

/// Инициализация логирования: по умолчанию info (если RUST_LOG не задан), чтобы [AUTH]/[SYNC] были видны.
/// Повторный вызов (тесты, встраивание) не паникует.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Фоновые задачи клиента: probe связи и drain очереди по событию `online`
pub struct BackgroundTasks {
    probe: JoinHandle<()>,
    drain: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        self.probe.abort();
        self.drain.abort();
        info!("[SYNC] Background tasks stopped");
    }
}

/// Запустить фоновые задачи. Требует работающего tokio runtime
pub fn start_background_tasks(client: &ApiClient) -> BackgroundTasks {
    let config = client.config();
    // Подписка на online создаётся до первого probe, чтобы не пропустить переход
    let drain = sync::spawn_drain_on_online(client.queue().clone());
    let probe = network::spawn_probe_loop(
        client.connectivity().clone(),
        config.probe_urls.clone(),
        Duration::from_secs(config.probe_interval_secs.max(1)),
    );
    info!(
        "[SYNC] Background tasks started (probe every {}s, {} pending operations)",
        config.probe_interval_secs,
        client.queue().len()
    );
    BackgroundTasks { probe, drain }
}

/// Клиент из окружения (`CONDO_*`) с запущенными фоновыми задачами
pub fn connect_from_env() -> Result<(Arc<ApiClient>, BackgroundTasks), ApiError> {
    let client = Arc::new(ApiClient::from_config(ClientConfig::from_env())?);
    let tasks = start_background_tasks(&client);
    Ok((client, tasks))
}
