use serde_json::Value;
use thiserror::Error;

/// Ошибки клиента API (для разбора и логирования)
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// Запрос не отправлялся: платформа offline, а запрос не допускает отложенного выполнения
    #[error("Operation cancelled: no internet connection")]
    Offline,

    /// Ответа не было вовсе (DNS, connect, reset, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// Сессии нет или её не удалось продлить
    #[error("Auth: {0}")]
    Auth(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: Value },

    #[error("Storage: {0}")]
    Storage(String),

    #[error("Serialization: {0}")]
    Serialization(String),

    #[error("Crypto: {0}")]
    Crypto(String),

    #[error("Config: {0}")]
    Config(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_offline_cancel(&self) -> bool {
        matches!(self, ApiError::Offline)
    }

    /// Ответ от сервера не получен (сеть пропала до или во время запроса)
    pub fn is_disconnection(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }

    /// Сообщение для UI: поле `detail` / `message` / `error` из тела DRF, иначе текст ошибки
    pub fn detail(&self) -> String {
        if let ApiError::Http { body, .. } = self {
            for field in ["detail", "message", "error"] {
                if let Some(msg) = body.get(field).and_then(|v| v.as_str()) {
                    return msg.to_string();
                }
            }
        }
        self.to_string()
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Serialization(e.to_string())
        } else if e.is_builder() {
            ApiError::Config(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detail_prefers_drf_fields() {
        let err = ApiError::Http {
            status: 400,
            body: json!({"detail": "Credenciales inválidas"}),
        };
        assert_eq!(err.detail(), "Credenciales inválidas");

        let err = ApiError::Http {
            status: 500,
            body: json!({"error": "Error interno"}),
        };
        assert_eq!(err.detail(), "Error interno");
    }

    #[test]
    fn test_detail_falls_back_to_display() {
        assert_eq!(
            ApiError::Offline.detail(),
            "Operation cancelled: no internet connection"
        );
        let err = ApiError::Http {
            status: 404,
            body: json!({"nombre": ["Este campo es requerido."]}),
        };
        assert!(err.detail().starts_with("HTTP 404"));
    }

    #[test]
    fn test_classification() {
        assert!(ApiError::Offline.is_offline_cancel());
        assert!(!ApiError::Offline.is_disconnection());
        assert!(ApiError::Network("reset".into()).is_disconnection());
        assert_eq!(
            ApiError::Http {
                status: 401,
                body: Value::Null
            }
            .status(),
            Some(401)
        );
    }
}
