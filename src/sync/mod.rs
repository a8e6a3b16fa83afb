use crate::auth::SessionStore;
use crate::database::Database;
use crate::keys::storage;
use crate::models::{DrainReport, DrainSkip, PendingOperation, QueueStats};
use crate::network::{Connectivity, ConnectivityEvent};
use crate::transport::{ApiRequest, Transport};
use scopeguard::guard;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Offline-очередь мутирующих запросов.
/// В памяти: зеркало последовательности `pendingOperations`; каждое изменение сразу
/// пишется в storage целиком. Ошибка записи логируется, очередь в памяти уже изменена.
pub struct OfflineQueue {
    db: Arc<Database>,
    ops: Mutex<Vec<PendingOperation>>,
    transport: Arc<dyn Transport>,
    session: Arc<SessionStore>,
    connectivity: Arc<Connectivity>,
    /// Single-flight: prevents concurrent drain runs
    is_draining: AtomicBool,
}

impl OfflineQueue {
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        session: Arc<SessionStore>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        let ops = Self::load(&db);
        if !ops.is_empty() {
            info!("[SYNC] Loaded {} pending operations from storage", ops.len());
        }
        Self {
            db,
            ops: Mutex::new(ops),
            transport,
            session,
            connectivity,
            is_draining: AtomicBool::new(false),
        }
    }

    /// Записи разбираются по одной: нечитаемая запись пропускается, остальные сохраняются.
    /// Исходное значение копируется в backup-ключ до того, как очередь будет перезаписана.
    fn load(db: &Database) -> Vec<PendingOperation> {
        let raw = match db.get_item(storage::PENDING_OPERATIONS) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                error!("[SYNC] Failed to read pending operations: {}", e);
                return Vec::new();
            }
        };
        let entries = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => entries,
            Ok(other) => {
                error!(
                    "[SYNC] Stored pending operations are not a list (got {})",
                    json_kind(&other)
                );
                backup_unreadable(db, &raw);
                return Vec::new();
            }
            Err(e) => {
                error!("[SYNC] Stored pending operations are unreadable: {}", e);
                backup_unreadable(db, &raw);
                return Vec::new();
            }
        };

        let total = entries.len();
        let mut normalized: Vec<PendingOperation> = Vec::with_capacity(total);
        for (index, entry) in entries.into_iter().enumerate() {
            let mut op = match serde_json::from_value::<PendingOperation>(repair_entry(entry)) {
                Ok(op) => op,
                Err(e) => {
                    error!("[SYNC] Skipping unreadable pending operation #{}: {}", index, e);
                    continue;
                }
            };
            // Записи старого формата без id/timestamp
            if op.timestamp == 0 {
                op.timestamp = chrono::Utc::now().timestamp_millis();
            }
            if op.id.is_empty() || normalized.iter().any(|o| o.id == op.id) {
                op.id = unique_id(&normalized, op.timestamp);
            }
            normalized.push(op);
        }
        if normalized.len() < total {
            warn!(
                "[SYNC] Recovered {} of {} stored pending operations",
                normalized.len(),
                total
            );
            backup_unreadable(db, &raw);
        }
        normalized
    }

    fn lock_ops(&self) -> MutexGuard<'_, Vec<PendingOperation>> {
        // Данные очереди остаются валидными даже после паники в другом потоке
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, ops: &[PendingOperation]) {
        let result = if ops.is_empty() {
            self.db.remove_item(storage::PENDING_OPERATIONS)
        } else {
            match serde_json::to_string(ops) {
                Ok(serialized) => self.db.set_item(storage::PENDING_OPERATIONS, &serialized),
                Err(e) => {
                    error!("[SYNC] Failed to serialize pending operations: {}", e);
                    return;
                }
            }
        };
        if let Err(e) = result {
            error!(
                "[SYNC] Failed to persist {} pending operations: {}",
                ops.len(),
                e
            );
        }
    }

    /// Добавить операцию в конец очереди. Назначает timestamp и id, если их нет
    pub fn enqueue(&self, mut operation: PendingOperation) -> String {
        if operation.timestamp == 0 {
            operation.timestamp = chrono::Utc::now().timestamp_millis();
        }
        let mut ops = self.lock_ops();
        if operation.id.is_empty() || ops.iter().any(|op| op.id == operation.id) {
            operation.id = unique_id(&ops, operation.timestamp);
        }
        let id = operation.id.clone();
        info!(
            "[SYNC] Queued {} {} as {} ({} pending)",
            operation.method,
            operation.url,
            id,
            ops.len() + 1
        );
        ops.push(operation);
        self.persist(&ops);
        id
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.lock_ops().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_ops().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_ops().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let ops = self.lock_ops();
        let mut stats = QueueStats {
            pending_count: ops.len(),
            oldest_timestamp: ops.iter().map(|op| op.timestamp).min(),
            ..Default::default()
        };
        for op in ops.iter() {
            *stats
                .pending_by_method
                .entry(op.method.to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Очистить очередь (safety valve, в т.ч. при смене пользователя)
    pub fn clear(&self) {
        let mut ops = self.lock_ops();
        if !ops.is_empty() {
            warn!("[SYNC] Clearing {} pending operations", ops.len());
        }
        ops.clear();
        self.persist(&ops);
    }

    /// Прямой запрос повтора: без interceptors, чтобы не поставить его в очередь снова.
    /// Authorization обновляется из текущей сессии, если токен есть.
    fn replay_request(&self, op: &PendingOperation, access_token: Option<&str>) -> ApiRequest {
        let mut request = ApiRequest::new(op.method, op.url.clone());
        request.body = op.body.clone();
        request.headers = op.headers.clone();
        if let Some(token) = access_token {
            request
                .headers
                .insert("Authorization".to_string(), format!("Bearer {}", token));
        }
        request
    }

    /// Повторить все отложенные операции по порядку timestamp.
    /// Каждая операция пробуется ровно один раз за проход, ошибки не прерывают проход.
    /// Любой HTTP-ответ считается выполненной операцией; ошибка transport оставляет её в очереди.
    pub async fn drain(&self) -> DrainReport {
        if !self.connectivity.is_online() {
            debug!("[SYNC] Offline, drain skipped");
            return DrainReport {
                pending: self.len(),
                skipped: Some(DrainSkip::Offline),
                ..Default::default()
            };
        }

        if self
            .is_draining
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("[SYNC] Another drain already in progress, skipping");
            return DrainReport {
                pending: self.len(),
                skipped: Some(DrainSkip::AlreadyRunning),
                ..Default::default()
            };
        }

        // Panic guard: is_draining is always reset, even on panic
        let _guard = guard((), |_| {
            self.is_draining.store(false, Ordering::Release);
        });

        let mut snapshot = self.pending();
        if snapshot.is_empty() {
            debug!("[SYNC] No pending operations");
            return DrainReport::default();
        }
        // Стабильная сортировка: при равных timestamp сохраняется порядок вставки
        snapshot.sort_by_key(|op| op.timestamp);

        let access_token = match self.session.access_token() {
            Ok(token) => token,
            Err(e) => {
                warn!("[SYNC] Could not read access token for replay: {}", e);
                None
            }
        };

        info!("[SYNC] Replaying {} pending operations", snapshot.len());
        let mut replayed: HashSet<String> = HashSet::new();
        for op in &snapshot {
            let request = self.replay_request(op, access_token.as_deref());
            match self.transport.send(&request).await {
                Ok(response) => {
                    if response.is_success() {
                        debug!("[SYNC] Operation {} replayed ({})", op.id, response.status);
                    } else {
                        warn!(
                            "[SYNC] Operation {} ({} {}) replayed with HTTP {}, dropping",
                            op.id, op.method, op.url, response.status
                        );
                    }
                    replayed.insert(op.id.clone());
                }
                Err(e) => {
                    error!(
                        "[SYNC] Failed to replay operation {} ({} {}): {}",
                        op.id, op.method, op.url, e
                    );
                }
            }
        }

        // Удаляем по id из ТЕКУЩЕЙ последовательности: добавленное во время drain сохраняется
        let pending = {
            let mut ops = self.lock_ops();
            ops.retain(|op| !replayed.contains(&op.id));
            self.persist(&ops);
            ops.len()
        };

        info!(
            "[SYNC] Sync completed: {} operations synced, {} pending",
            replayed.len(),
            pending
        );
        DrainReport {
            attempted: snapshot.len(),
            synced: replayed.len(),
            pending,
            skipped: None,
        }
    }
}

/// Приводит запись, записанную другим клиентом, к хранимому формату:
/// ISO-строка или число-строка в `timestamp`, не-строковые значения заголовков.
fn repair_entry(mut entry: Value) -> Value {
    let Some(obj) = entry.as_object_mut() else {
        return entry;
    };
    if let Some(Value::String(ts)) = obj.get("timestamp") {
        let millis = ts.trim().parse::<i64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(ts.trim())
                .ok()
                .map(|dt| dt.timestamp_millis())
        });
        match millis {
            Some(millis) => {
                obj.insert("timestamp".to_string(), Value::from(millis));
            }
            None => {
                obj.remove("timestamp");
            }
        }
    }
    if let Some(Value::Object(headers)) = obj.get_mut("headers") {
        headers.retain(|_, v| !v.is_null());
        for value in headers.values_mut() {
            if !value.is_string() {
                *value = Value::String(value.to_string());
            }
        }
    } else if matches!(obj.get("headers"), Some(Value::Null)) {
        obj.remove("headers");
    }
    entry
}

/// Копия исходного значения очереди под `pendingOperations.corrupted.<ms>`
fn backup_unreadable(db: &Database, raw: &str) {
    let key = format!(
        "{}.corrupted.{}",
        storage::PENDING_OPERATIONS,
        chrono::Utc::now().timestamp_millis()
    );
    match db.set_item(&key, raw) {
        Ok(()) => warn!("[SYNC] Original pending operations backed up under '{}'", key),
        Err(e) => error!("[SYNC] Failed to back up pending operations: {}", e),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// id из timestamp; при совпадении в ту же миллисекунду: суффикс `-n`
fn unique_id(existing: &[PendingOperation], timestamp: i64) -> String {
    let base = timestamp.to_string();
    if !existing.iter().any(|op| op.id == base) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !existing.iter().any(|op| op.id == candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Слушать `online` и запускать drain (аналог window `online` listener)
pub fn spawn_drain_on_online(queue: Arc<OfflineQueue>) -> JoinHandle<()> {
    let mut events = queue.connectivity.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectivityEvent::Online) => {
                    info!("[SYNC] Connection restored. Syncing pending operations...");
                    let report = queue.drain().await;
                    if report.synced > 0 {
                        info!(
                            "[SYNC] Background sync: {} synced, {} pending",
                            report.synced, report.pending
                        );
                    }
                }
                Ok(ConnectivityEvent::Offline) => {
                    debug!("[SYNC] Offline, {} operations will wait", queue.len());
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[SYNC] Missed {} connectivity events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
