use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::error::ApiError;
use crate::keys::{endpoints, events, storage};
use crate::models::{HttpMethod, SessionUser, TokenPair, TokenRefreshResult};
use crate::transport::{ApiRequest, Transport};

// ============================================
// TOKEN ENCRYPTION
// ============================================

const ENCRYPTED_PREFIX: &str = "enc:v1:";
const KEY_FILE: &str = "storage.key";

/// Шифрование токенов перед сохранением в local storage (AES-256-GCM).
/// Ключ: `CONDO_ENCRYPTION_KEY` (64 hex) или случайный ключ в `{data_dir}/storage.key`.
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    pub fn new(data_dir: Option<&Path>) -> Result<Self, String> {
        let key = match std::env::var("CONDO_ENCRYPTION_KEY") {
            Ok(hex_key) => hex::decode(hex_key.trim())
                .map_err(|e| format!("CONDO_ENCRYPTION_KEY is not valid hex: {}", e))?,
            Err(_) => match data_dir {
                Some(dir) => Self::load_or_create_key_file(dir)?,
                None => return Err("No encryption key source available".to_string()),
            },
        };
        Self::from_key(&key)
    }

    pub fn from_key(key: &[u8]) -> Result<Self, String> {
        let key_array: [u8; 32] = key
            .try_into()
            .map_err(|_| "Encryption key must be 32 bytes".to_string())?;
        Ok(Self {
            cipher: Aes256Gcm::new(&key_array.into()),
        })
    }

    fn load_or_create_key_file(dir: &Path) -> Result<Vec<u8>, String> {
        let path = dir.join(KEY_FILE);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            return hex::decode(raw.trim())
                .map_err(|e| format!("Corrupted key file {}: {}", path.display(), e));
        }
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        let mut key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        std::fs::write(&path, hex::encode(&key))
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
        info!("[AUTH] Generated new storage key at {}", path.display());
        Ok(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("Encryption failed: {}", e))?;

        // nonce + ciphertext, base64
        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(format!(
            "{}{}",
            ENCRYPTED_PREFIX,
            general_purpose::STANDARD.encode(&result)
        ))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, String> {
        let encoded = encrypted
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or_else(|| "Value is not encrypted".to_string())?;
        let data = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| format!("Base64 decode failed: {}", e))?;

        if data.len() < 12 {
            return Err("Invalid encrypted data length".to_string());
        }

        let nonce = Nonce::from_slice(&data[..12]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &data[12..])
            .map_err(|e| format!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| format!("UTF-8 decode failed: {}", e))
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }
}

// ============================================
// SESSION STORAGE
// ============================================

/// Токены и пользователь в durable storage.
/// Access token перезаписывает только AuthManager (login / refresh).
pub struct SessionStore {
    db: Arc<Database>,
    secret: SecretBox,
}

impl SessionStore {
    pub fn new(db: Arc<Database>, secret: SecretBox) -> Self {
        Self { db, secret }
    }

    fn read_secret(&self, key: &str) -> Result<Option<String>, ApiError> {
        let Some(stored) = self.db.get_item(key)? else {
            return Ok(None);
        };
        if !SecretBox::is_encrypted(&stored) {
            // Записано в открытом виде (другим инструментом): принимаем и шифруем
            warn!("[AUTH] Plaintext value under '{}', re-encrypting", key);
            self.write_secret(key, &stored)?;
            return Ok(Some(stored));
        }
        self.secret
            .decrypt(&stored)
            .map(Some)
            .map_err(ApiError::Crypto)
    }

    fn write_secret(&self, key: &str, value: &str) -> Result<(), ApiError> {
        let encrypted = self.secret.encrypt(value).map_err(ApiError::Crypto)?;
        self.db.set_item(key, &encrypted)?;
        Ok(())
    }

    pub fn access_token(&self) -> Result<Option<String>, ApiError> {
        self.read_secret(storage::ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Result<Option<String>, ApiError> {
        self.read_secret(storage::REFRESH_TOKEN)
    }

    pub(crate) fn set_tokens(&self, access: &str, refresh: &str) -> Result<(), ApiError> {
        self.write_secret(storage::ACCESS_TOKEN, access)?;
        self.write_secret(storage::REFRESH_TOKEN, refresh)
    }

    pub(crate) fn set_access_token(&self, access: &str) -> Result<(), ApiError> {
        self.write_secret(storage::ACCESS_TOKEN, access)
    }

    pub(crate) fn set_refresh_token(&self, refresh: &str) -> Result<(), ApiError> {
        self.write_secret(storage::REFRESH_TOKEN, refresh)
    }

    pub fn user(&self) -> Result<Option<SessionUser>, ApiError> {
        match self.db.get_item(storage::USER)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_user(&self, user: &SessionUser) -> Result<(), ApiError> {
        self.db.set_item(storage::USER, &serde_json::to_string(user)?)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), ApiError> {
        self.db.remove_items(&storage::SESSION_KEYS)?;
        Ok(())
    }
}

// ============================================
// AUTH MANAGER
// ============================================

/// События сессии (аналог глобального `auth:logout`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    LoggedIn {
        username: String,
    },
    TokenRefreshed,
    LoggedOut {
        forced: bool,
        /// Куда перенаправить UI; None: уже на странице логина или logout явный
        redirect: Option<String>,
    },
}

/// Менеджер аутентификации: login/logout, refresh, принудительный logout
pub struct AuthManager {
    transport: Arc<dyn Transport>,
    session: Arc<SessionStore>,
    events: broadcast::Sender<AuthEvent>,
    login_route: String,
    current_route: Mutex<String>,
    /// Single-flight refresh: параллельные 401 не отправляют один refresh token дважды
    refresh_lock: tokio::sync::Mutex<()>,
}

impl AuthManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: Arc<SessionStore>,
        login_route: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            transport,
            session,
            events,
            login_route: login_route.into(),
            current_route: Mutex::new("/".to_string()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AuthEvent) {
        // Нет подписчиков: не ошибка
        let _ = self.events.send(event);
    }

    pub fn set_current_route(&self, route: impl Into<String>) {
        if let Ok(mut current) = self.current_route.lock() {
            *current = route.into();
        }
    }

    pub fn current_route(&self) -> String {
        self.current_route
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// `POST /token/`: сохраняет оба токена и пользователя
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionUser, ApiError> {
        let request = ApiRequest::new(HttpMethod::Post, endpoints::TOKEN)
            .json(json!({ "username": username, "password": password }));
        let response = self.transport.send(&request).await?;
        if !response.is_success() {
            warn!("[AUTH] Login failed with status {}", response.status);
            return Err(response.into_error());
        }
        let tokens: TokenPair = serde_json::from_value(response.body)?;
        self.session.set_tokens(&tokens.access, &tokens.refresh)?;

        let user = SessionUser::admin(username);
        self.session.set_user(&user)?;
        info!("[AUTH] Logged in as {}", username);
        self.emit(AuthEvent::LoggedIn {
            username: username.to_string(),
        });
        Ok(user)
    }

    /// Сохранённая сессия: есть access token и пользователь
    pub fn restore_session(&self) -> Result<Option<SessionUser>, ApiError> {
        if self.session.access_token()?.is_none() {
            return Ok(None);
        }
        self.session.user()
    }

    /// Обновить access token через refresh token.
    /// Идёт напрямую через transport, минуя interceptors клиента.
    pub async fn refresh(&self) -> Result<TokenRefreshResult, ApiError> {
        let refresh_token = self
            .session
            .refresh_token()?
            .ok_or_else(|| ApiError::Auth("No refresh token available".to_string()))?;

        let request = ApiRequest::new(HttpMethod::Post, endpoints::TOKEN_REFRESH)
            .json(json!({ "refresh": refresh_token }));
        let response = self.transport.send(&request).await?;
        if !response.is_success() {
            return Err(ApiError::Auth(format!(
                "Token refresh failed with status: {}",
                response.status
            )));
        }

        let result: TokenRefreshResult = serde_json::from_value(response.body)
            .map_err(|e| ApiError::Auth(format!("Failed to parse refresh response: {}", e)))?;
        self.session.set_access_token(&result.access)?;
        if let Some(rotated) = result.refresh.as_deref() {
            self.session.set_refresh_token(rotated)?;
        }
        info!(
            "[AUTH] Access token refreshed (length {})",
            result.access.len()
        );
        self.emit(AuthEvent::TokenRefreshed);
        Ok(result)
    }

    /// Refresh после 401 на запросе, ушедшем с токеном `stale`.
    /// Если за время ожидания другой запрос уже обновил access token, сеть не трогается.
    pub async fn refresh_if_stale(&self, stale: Option<&str>) -> Result<(), ApiError> {
        let _guard = self.refresh_lock.lock().await;
        if let (Some(current), Some(stale)) = (self.session.access_token()?, stale) {
            if current != stale {
                debug!("[AUTH] Access token already refreshed by a concurrent request");
                return Ok(());
            }
        }
        self.refresh().await.map(|_| ())
    }

    /// Явный выход пользователя
    pub fn logout(&self) -> Result<(), ApiError> {
        self.session.clear()?;
        info!("[AUTH] Logged out");
        self.emit(AuthEvent::LoggedOut {
            forced: false,
            redirect: None,
        });
        Ok(())
    }

    /// Принудительный выход (refresh не удался).
    /// Возвращает маршрут редиректа, если текущий маршрут не страница логина.
    pub fn force_logout(&self) -> Option<String> {
        if let Err(e) = self.session.clear() {
            error!("[AUTH] Failed to clear session on forced logout: {}", e);
        }

        let redirect = if self.current_route().contains(&self.login_route) {
            None
        } else {
            self.set_current_route(self.login_route.clone());
            Some(self.login_route.clone())
        };

        warn!(
            "[AUTH] Session expired, emitting {} (redirect: {:?})",
            events::AUTH_LOGOUT,
            redirect
        );
        self.emit(AuthEvent::LoggedOut {
            forced: true,
            redirect: redirect.clone(),
        });
        redirect
    }
}
