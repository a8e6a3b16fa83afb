use crate::config::{join_url, ClientConfig};
use crate::error::ApiError;
use crate::models::HttpMethod;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Опции запроса, которые задаёт вызывающий код
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Запрос допускает отложенное выполнение через offline-очередь
    pub offline_support: bool,
    /// Переопределение таймаута по умолчанию (например, распознавание номеров)
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// `withOfflineSupport`: запрос уйдёт в очередь, если сети нет
    pub fn offline() -> Self {
        Self {
            offline_support: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Описание исходящего запроса. Проходит через pipeline клиента и мутирует по дороге
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Как передал вызывающий: относительный путь или абсолютный URL
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub options: RequestOptions,
    /// Выставляется connectivity guard: запрос ушёл при offline
    pub(crate) offline_request: bool,
    /// One-shot флаг 401-retry
    pub(crate) retried: bool,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            body: None,
            headers: BTreeMap::new(),
            options: RequestOptions::default(),
            offline_request: false,
            retried: false,
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_offline_request(&self) -> bool {
        self.offline_request
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers.get("Authorization").map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// Ответ синтезирован клиентом: запрос лежит в offline-очереди
    pub offline_operation: bool,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            offline_operation: false,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_error(self) -> ApiError {
        ApiError::Http {
            status: self.status,
            body: self.body,
        }
    }
}

/// Сырая отправка запроса без interceptors.
/// `Ok` для ЛЮБОГО HTTP-статуса; `Err(ApiError::Network)` только если ответа не было.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError>;
}

/// Production transport поверх reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
    /// Вычисляется один раз: mixed-content предупреждение логируется при создании
    base_url: String,
    app_version: String,
}

impl ReqwestTransport {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| ApiError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.resolved_base_url(),
            app_version: config.app_version,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.url_for(&request.url);
        debug!("[HTTP] {} {}", request.method, url);

        let mut builder = self
            .client
            .request(request.method.into(), &url)
            .header("X-App-Version", &self.app_version);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = &request.body {
            // .json() сам выставляет Content-Type: application/json
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(ApiError::from)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(ApiError::from)?;
        Ok(ApiResponse::new(status, parse_body(&text)))
    }
}

/// Пустое тело => null, не-JSON => строка
pub(crate) fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
