use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// HTTP-метод. В очереди хранится в нижнем регистре, читается в любом
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "get",
            HttpMethod::Post => "post",
            HttpMethod::Put => "put",
            HttpMethod::Patch => "patch",
            HttpMethod::Delete => "delete",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "get" => Some(HttpMethod::Get),
            "post" => Some(HttpMethod::Post),
            "put" => Some(HttpMethod::Put),
            "patch" => Some(HttpMethod::Patch),
            "delete" => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

impl Serialize for HttpMethod {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HttpMethod {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        HttpMethod::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown HTTP method: {}", raw)))
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Отложенный мутирующий запрос (элемент `pendingOperations`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Пусто до enqueue; очередь назначает id из timestamp
    #[serde(default)]
    pub id: String,
    pub url: String,
    pub method: HttpMethod,
    /// `data`: имя поля в старом формате очереди
    #[serde(default, alias = "data")]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Unix time, миллисекунды. 0 => назначается при enqueue
    #[serde(default)]
    pub timestamp: i64,
}

impl PendingOperation {
    pub fn new(method: HttpMethod, url: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            id: String::new(),
            url: url.into(),
            method,
            body,
            headers: BTreeMap::new(),
            timestamp: 0,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Синтетический ответ для запроса, отложенного в очередь
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAck {
    pub success: bool,
    pub offline_operation: bool,
    pub pending_sync: bool,
}

impl Default for OfflineAck {
    fn default() -> Self {
        Self {
            success: true,
            offline_operation: true,
            pending_sync: true,
        }
    }
}

/// Ответ `POST /token/`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Результат обновления токена (`POST /token/refresh/`)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRefreshResult {
    pub access: String,
    /// Только при ротации refresh-токена на сервере
    #[serde(default)]
    pub refresh: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl SessionUser {
    /// Консоль администрирования: любой вошедший пользователь: admin
    pub fn admin(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            role: Some("admin".to_string()),
            is_admin: true,
            permissions: vec![
                "dashboard".to_string(),
                "analytics".to_string(),
                "management".to_string(),
            ],
        }
    }
}

/// Список в ответе бэкенда: страница DRF `{count, next, previous, results}`,
/// голый массив или неизвестный формат
#[derive(Debug, Clone, PartialEq)]
pub struct ListPayload {
    pub items: Vec<Value>,
    pub count: u64,
}

impl ListPayload {
    pub fn from_value(data: &Value) -> Self {
        if let Some(results) = data.get("results").and_then(|r| r.as_array()) {
            let count = data
                .get("count")
                .and_then(|c| c.as_u64())
                .filter(|c| *c > 0)
                .unwrap_or(results.len() as u64);
            return Self {
                items: results.clone(),
                count,
            };
        }
        if let Some(items) = data.as_array() {
            return Self {
                items: items.clone(),
                count: items.len() as u64,
            };
        }
        Self {
            items: Vec::new(),
            count: 0,
        }
    }
}

/// Почему drain не выполнялся
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DrainSkip {
    Offline,
    AlreadyRunning,
}

/// Итог одного прохода drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<DrainSkip>,
}

/// Статистика очереди
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub pending_by_method: HashMap<String, usize>,
    pub oldest_timestamp: Option<i64>,
}
