use crate::client::ApiClient;
use crate::database::Database;
use crate::error::ApiError;
use crate::models::ListPayload;
use crate::transport::RequestOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Пагинированный список административного раздела (DRF `page` / `page_size`)
#[derive(Debug, Clone)]
pub struct PagedList {
    endpoint: String,
    page: u32,
    page_size: u32,
    filters: BTreeMap<String, String>,
    items: Vec<Value>,
    count: u64,
    error: Option<String>,
}

impl PagedList {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            filters: BTreeMap::new(),
            items: Vec::new(),
            count: 0,
            error: None,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_filters(mut self, filters: BTreeMap<String, String>) -> Self {
        self.filters = filters;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn filters(&self) -> &BTreeMap<String, String> {
        &self.filters
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_page(&mut self, page: u32) {
        self.page = page.max(1);
    }

    /// Смена фильтра всегда возвращает на первую страницу
    pub fn set_filter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.page = 1;
        self.filters.insert(key.into(), value.into());
    }

    /// Параметры запроса: пустые фильтры не отправляются
    pub fn query(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("page".to_string(), self.page.to_string()),
            ("page_size".to_string(), self.page_size.to_string()),
        ];
        params.extend(
            self.filters
                .iter()
                .filter(|(_, v)| !v.trim().is_empty())
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        params
    }

    /// Загрузить текущую страницу. При ошибке элементы остаются прежними, `error` заполняется
    pub async fn fetch(&mut self, client: &ApiClient) -> Result<(), ApiError> {
        self.error = None;
        let result = client
            .get(&self.endpoint, self.query(), RequestOptions::default())
            .await;

        match result {
            Ok(response) => {
                let payload = ListPayload::from_value(&response.body);
                debug!(
                    "[HTTP] {} page {}: {} items of {}",
                    self.endpoint,
                    self.page,
                    payload.items.len(),
                    payload.count
                );
                self.items = payload.items;
                self.count = payload.count;
                Ok(())
            }
            Err(e) => {
                warn!("[HTTP] Failed to load {}: {}", self.endpoint, e);
                self.error = Some(e.detail());
                Err(e)
            }
        }
    }

    pub async fn refresh(&mut self, client: &ApiClient) -> Result<(), ApiError> {
        self.fetch(client).await
    }

    /// Слить поля `partial` в элемент с данным `id`
    pub fn update_item(&mut self, id: &Value, partial: &Value) {
        let Some(fields) = partial.as_object() else {
            return;
        };
        for item in self.items.iter_mut().filter(|it| it.get("id") == Some(id)) {
            if let Some(obj) = item.as_object_mut() {
                for (k, v) in fields {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
    }

    pub fn remove_item(&mut self, id: &Value) {
        self.items.retain(|it| it.get("id") != Some(id));
        self.count = self.count.saturating_sub(1);
    }

    pub fn add_item(&mut self, item: Value) {
        self.items.insert(0, item);
        self.count += 1;
    }
}

// ============================================
// LIST CACHE
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    data: Value,
    /// Unix millis
    ts: i64,
}

/// Последняя удачно загруженная копия списка (`{data, ts}` под ключом кэша)
pub struct ListCache {
    db: Arc<Database>,
    key: String,
}

impl ListCache {
    pub fn new(db: Arc<Database>, key: impl Into<String>) -> Self {
        Self {
            db,
            key: key.into(),
        }
    }

    /// Ошибки кэша не мешают основному сценарию: только лог
    pub fn store(&self, data: &Value) {
        let entry = CacheEntry {
            data: data.clone(),
            ts: chrono::Utc::now().timestamp_millis(),
        };
        let result = serde_json::to_string(&entry)
            .map_err(ApiError::from)
            .and_then(|raw| self.db.set_item(&self.key, &raw).map_err(ApiError::from));
        if let Err(e) = result {
            warn!("[DB] Failed to cache '{}': {}", self.key, e);
        }
    }

    /// Данные и время сохранения; нечитаемая запись = нет кэша
    pub fn load(&self) -> Option<(Value, i64)> {
        let raw = match self.db.get_item(&self.key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("[DB] Failed to read cache '{}': {}", self.key, e);
                return None;
            }
        };
        let entry: CacheEntry = serde_json::from_str(&raw).ok()?;
        if entry.data.is_null() {
            return None;
        }
        Some((entry.data, entry.ts))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedList {
    pub items: Vec<Value>,
    /// Данные взяты из кэша, а не с сервера
    pub stale: bool,
    pub error: Option<String>,
}

/// Загрузить список; при неудаче вернуть кэшированную копию с сообщением об ошибке
pub async fn fetch_list_with_cache(
    client: &ApiClient,
    endpoint: &str,
    query: Vec<(String, String)>,
    cache: &ListCache,
) -> CachedList {
    match client.get(endpoint, query, RequestOptions::default()).await {
        Ok(response) => {
            let items = ListPayload::from_value(&response.body).items;
            cache.store(&Value::Array(items.clone()));
            CachedList {
                items,
                stale: false,
                error: None,
            }
        }
        Err(e) => {
            let cached = cache.load().map(|(data, ts)| {
                debug!("[DB] Using cached {} from {}", endpoint, ts);
                ListPayload::from_value(&data).items
            });
            CachedList {
                stale: cached.is_some(),
                items: cached.unwrap_or_default(),
                error: Some(e.detail()),
            }
        }
    }
}
