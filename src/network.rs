use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::keys::events;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Сигнал online/offline платформы.
/// Точечная проверка: запрос может упасть по сети и после того, как guard пропустил его.
pub struct Connectivity {
    online: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new()
    }
}

impl Connectivity {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            online: AtomicBool::new(true),
            events,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Событие шлётся только при смене состояния
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::AcqRel);
        if previous == online {
            return;
        }
        let event = if online {
            info!("[NET] Connectivity event: {}", events::ONLINE);
            ConnectivityEvent::Online
        } else {
            warn!("[NET] Connectivity event: {}", events::OFFLINE);
            ConnectivityEvent::Offline
        };
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

/// Проверка online статуса через легковесный HTTP запрос.
/// Первый URL, ответивший 2xx (или 204), означает online.
pub async fn check_online_status(urls: &[String], timeout: Duration) -> bool {
    let client = match Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    for url in urls {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => debug!("[NET] Probe {} answered {}", url, response.status()),
            Err(e) => debug!("[NET] Probe {} failed: {}", url, e),
        }
    }
    false
}

/// Периодическая проверка связи: источник online/offline сигнала вне браузера
pub fn spawn_probe_loop(
    connectivity: Arc<Connectivity>,
    urls: Vec<String>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Jitter 0-1s, чтобы несколько клиентов не били в probe одновременно
        let jitter_ms: u64 = rand::random::<u32>() as u64 % 1000;
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let online = check_online_status(&urls, Duration::from_secs(2)).await;
            connectivity.set_online(online);
        }
    })
}
