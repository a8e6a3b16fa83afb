use crate::auth::{AuthManager, SecretBox, SessionStore};
use crate::config::ClientConfig;
use crate::database::Database;
use crate::error::ApiError;
use crate::models::{DrainReport, HttpMethod, OfflineAck, PendingOperation};
use crate::network::Connectivity;
use crate::sync::OfflineQueue;
use crate::transport::{ApiRequest, ApiResponse, RequestOptions, ReqwestTransport, Transport};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Клиент API: authenticated transport + connectivity guard + offline-очередь.
///
/// Pipeline одного запроса:
/// 1. `Authorization: Bearer <access>` из storage (если токен есть);
/// 2. guard: offline и запрос не допускает очереди => `ApiError::Offline` без сети;
/// 3. отправка;
/// 4. при ошибке: разрыв сети у offline-запроса => очередь + синтетический успех
///    (раньше ветки 401); 401 => один refresh и один повтор; иначе ошибка как есть.
pub struct ApiClient {
    config: ClientConfig,
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    auth: Arc<AuthManager>,
    connectivity: Arc<Connectivity>,
    queue: Arc<OfflineQueue>,
}

impl ApiClient {
    pub fn new(
        config: ClientConfig,
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        secret: SecretBox,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        let session = Arc::new(SessionStore::new(db.clone(), secret));
        let auth = Arc::new(AuthManager::new(
            transport.clone(),
            session.clone(),
            config.login_route.clone(),
        ));
        let queue = Arc::new(OfflineQueue::new(
            db.clone(),
            transport.clone(),
            session,
            connectivity.clone(),
        ));
        Self {
            config,
            db,
            transport,
            auth,
            connectivity,
            queue,
        }
    }

    /// Production-сборка: SQLite в `data_dir`, reqwest transport, ключ шифрования из env/файла
    pub fn from_config(config: ClientConfig) -> Result<Self, ApiError> {
        let db = Database::open_with_recovery(&config.data_dir)
            .map_err(|e| ApiError::Storage(format!("Failed to initialize storage: {}", e)))?;
        let secret = SecretBox::new(Some(&config.data_dir)).map_err(ApiError::Crypto)?;
        let transport = ReqwestTransport::new(config.clone())?;
        info!("[HTTP] API client ready, base URL {}", transport.base_url());
        Ok(Self::new(
            config,
            Arc::new(db),
            Arc::new(transport),
            secret,
            Arc::new(Connectivity::new()),
        ))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Durable key/value storage (кэши списков, сессия, очередь)
    pub fn storage(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    /// Request interceptor: токен из storage. Отсутствие токена: не ошибка
    fn authorize(&self, request: &mut ApiRequest) {
        match self.auth.session().access_token() {
            Ok(Some(token)) => {
                request
                    .headers
                    .insert("Authorization".to_string(), format!("Bearer {}", token));
            }
            Ok(None) => {}
            Err(e) => warn!("[AUTH] Could not read access token: {}", e),
        }
    }

    /// Connectivity guard
    fn guard(&self, request: &mut ApiRequest) -> Result<(), ApiError> {
        if self.connectivity.is_online() {
            return Ok(());
        }
        if !request.options.offline_support {
            debug!(
                "[HTTP] Offline, cancelling {} {}",
                request.method, request.url
            );
            return Err(ApiError::Offline);
        }
        request.offline_request = true;
        Ok(())
    }

    /// Разрыв сети у запроса, допускающего очередь
    fn should_defer(&self, request: &ApiRequest, err: &ApiError) -> bool {
        if !request.options.offline_support || err.is_offline_cancel() {
            return false;
        }
        err.is_disconnection() || (!self.connectivity.is_online() && err.status().is_none())
    }

    fn defer(&self, request: &ApiRequest) -> ApiResponse {
        let operation = PendingOperation::new(request.method, request.url.clone(), request.body.clone())
            .with_headers(request.headers.clone());
        let id = self.queue.enqueue(operation);
        info!(
            "[HTTP] {} {} deferred as pending operation {}",
            request.method, request.url, id
        );
        let body = serde_json::to_value(OfflineAck::default()).unwrap_or(Value::Null);
        ApiResponse {
            status: 200,
            body,
            offline_operation: true,
        }
    }

    /// Выполнить запрос через полный pipeline
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut request = request;
        loop {
            self.authorize(&mut request);
            self.guard(&mut request)?;

            let err = match self.transport.send(&request).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => response.into_error(),
                Err(e) => e,
            };

            if self.should_defer(&request, &err) {
                return Ok(self.defer(&request));
            }

            if err.status() == Some(401) {
                if !request.retried {
                    request.retried = true;
                    info!(
                        "[AUTH] Token expired (401) on {} {}, refreshing",
                        request.method, request.url
                    );
                    let stale = request
                        .authorization()
                        .and_then(|h| h.strip_prefix("Bearer "))
                        .map(str::to_string);
                    match self.auth.refresh_if_stale(stale.as_deref()).await {
                        Ok(_) => continue,
                        Err(refresh_err) => {
                            warn!("[AUTH] Failed to refresh token: {}", refresh_err);
                        }
                    }
                } else {
                    warn!(
                        "[AUTH] {} {} still unauthorized after refresh",
                        request.method, request.url
                    );
                }
                self.auth.force_logout();
            }
            return Err(err);
        }
    }

    pub async fn get(
        &self,
        url: &str,
        query: Vec<(String, String)>,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.execute(
            ApiRequest::new(HttpMethod::Get, url)
                .query(query)
                .options(options),
        )
        .await
    }

    pub async fn post(
        &self,
        url: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.execute(
            ApiRequest::new(HttpMethod::Post, url)
                .json(body)
                .options(options),
        )
        .await
    }

    pub async fn put(
        &self,
        url: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.execute(
            ApiRequest::new(HttpMethod::Put, url)
                .json(body)
                .options(options),
        )
        .await
    }

    pub async fn patch(
        &self,
        url: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.execute(
            ApiRequest::new(HttpMethod::Patch, url)
                .json(body)
                .options(options),
        )
        .await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::new(HttpMethod::Delete, url).options(options))
            .await
    }

    /// Явно поставить операцию в очередь; при online: сразу попытаться синхронизировать
    pub async fn add_pending_operation(&self, operation: PendingOperation) -> String {
        let id = self.queue.enqueue(operation);
        if self.connectivity.is_online() {
            self.queue.drain().await;
        }
        id
    }

    pub async fn sync_pending_operations(&self) -> DrainReport {
        self.queue.drain().await
    }
}
