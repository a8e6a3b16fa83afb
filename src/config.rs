use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Конфигурация клиента (api_url, таймауты, app_version, хранилище)
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Origin бэкенда, с `/api` на конце или без. None => относительный `/api` через page_origin
    pub api_url: Option<String>,
    /// Origin, с которого обслуживается приложение (dev server проксирует `/api`)
    pub page_origin: String,
    pub http_timeout_secs: u64,
    /// App version sent in X-App-Version header for debugging version skew
    pub app_version: String,
    pub data_dir: PathBuf,
    pub login_route: String,
    pub probe_urls: Vec<String>,
    pub probe_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            page_origin: "http://localhost:3000".to_string(),
            http_timeout_secs: 120,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from(".condo"),
            login_route: "/login".to_string(),
            probe_urls: vec![
                "https://www.cloudflare.com/cdn-cgi/trace".to_string(),
                "https://www.google.com/generate_204".to_string(),
            ],
            probe_interval_secs: 15,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: var("CONDO_API_URL").filter(|v| !v.trim().is_empty()),
            page_origin: var("CONDO_PAGE_ORIGIN").unwrap_or(defaults.page_origin),
            http_timeout_secs: try_load("CONDO_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            app_version: defaults.app_version,
            data_dir: var("CONDO_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            login_route: defaults.login_route,
            probe_urls: defaults.probe_urls,
            probe_interval_secs: try_load(
                "CONDO_PROBE_INTERVAL_SECS",
                defaults.probe_interval_secs,
            ),
        }
    }

    /// Итоговый base URL API.
    /// Mixed content: страница по https + бэкенд по голому http => относительный `/api`,
    /// соединение с бэкендом делает прокси (rewrite), а не клиент напрямую.
    pub fn resolved_base_url(&self) -> String {
        let page_origin = trim_trailing_slash(&self.page_origin);
        let relative = format!("{}/api", page_origin);

        let origin = self.api_url.as_deref().map(|raw| {
            let raw = trim_trailing_slash(raw.trim());
            raw.strip_suffix("/api").unwrap_or(raw).to_string()
        });

        let base = match origin {
            Some(o) if !o.is_empty() => format!("{}/api", trim_trailing_slash(&o)),
            _ => relative.clone(),
        };

        if page_origin.starts_with("https://") && base.starts_with("http://") {
            warn!(
                "[CONFIG] Backend {} is plain HTTP behind an HTTPS page; using relative {} instead",
                base, relative
            );
            return relative;
        }
        base
    }

    /// Относительный путь склеивается с base URL; абсолютный URL возвращается как есть.
    /// Base вычисляется заново при каждом вызове; для потока запросов см. [`join_url`].
    pub fn resolve_url(&self, path: &str) -> String {
        join_url(&self.resolved_base_url(), path)
    }
}

/// Склеить уже вычисленный base URL с путём запроса
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", trim_trailing_slash(base), path.trim_start_matches('/'))
}

fn trim_trailing_slash(v: &str) -> &str {
    v.trim_end_matches('/')
}

fn var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) => Some(v),
        Err(_) => {
            info!("[CONFIG] {key} not set, using default");
            None
        }
    }
}

fn try_load<T: FromStr + Display>(key: &str, default: T) -> T
where
    T::Err: Display,
{
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("[CONFIG] Invalid {key} value {raw:?}: {e}; using default {default}");
            default
        }),
        None => default,
    }
}
