//! Centralized storage keys and event names.
//! Prevents typos between the client, the queue and whatever shell embeds them.

/// Ключи durable local storage (таблица `local_storage`)
pub mod storage {
    pub const ACCESS_TOKEN: &str = "access";
    pub const REFRESH_TOKEN: &str = "refresh";
    pub const USER: &str = "user";
    pub const PENDING_OPERATIONS: &str = "pendingOperations";
    pub const VISITAS_CACHE: &str = "visitasCache";
    pub const RESERVAS_CACHE: &str = "reservasCache";

    /// Всё, что принадлежит сессии и удаляется при logout
    pub const SESSION_KEYS: [&str; 3] = [ACCESS_TOKEN, REFRESH_TOKEN, USER];
}

/// Имена событий (для логов и для оболочки, пробрасывающей их дальше)
pub mod events {
    pub const AUTH_LOGOUT: &str = "auth:logout";
    pub const ONLINE: &str = "online";
    pub const OFFLINE: &str = "offline";
}

/// Auth endpoints бэкенда
pub mod endpoints {
    pub const TOKEN: &str = "/token/";
    pub const TOKEN_REFRESH: &str = "/token/refresh/";
}
