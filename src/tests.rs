use crate::auth::AuthEvent;
use crate::keys::{endpoints, storage};
use crate::list::{fetch_list_with_cache, ListCache, PagedList};
use crate::resources::{names, Resource, PLATE_RECOGNITION_TIMEOUT};
use crate::*;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================
    // MOCK TRANSPORT
    // ============================================

    #[derive(Debug, Clone)]
    enum Reply {
        Status(u16, Value),
        NetworkError,
    }

    /// Сценарный transport: ответы по (method, url), запись всех отправленных запросов.
    /// Последний ответ в сценарии "залипает" и повторяется.
    #[derive(Default)]
    struct MockTransport {
        calls: Mutex<Vec<ApiRequest>>,
        replies: Mutex<HashMap<(HttpMethod, String), VecDeque<Reply>>>,
        network_down: AtomicBool,
        failing_urls: Mutex<HashSet<String>>,
        /// Если задан: send() сигналит `entered` и ждёт `release`
        gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn reply(&self, method: HttpMethod, url: &str, replies: Vec<Reply>) {
            self.replies
                .lock()
                .unwrap()
                .insert((method, url.to_string()), replies.into());
        }

        fn set_network_down(&self, down: bool) {
            self.network_down.store(down, Ordering::SeqCst);
        }

        fn fail_url(&self, url: &str) {
            self.failing_urls.lock().unwrap().insert(url.to_string());
        }

        fn heal_url(&self, url: &str) {
            self.failing_urls.lock().unwrap().remove(url);
        }

        fn hold(&self) -> (Arc<Notify>, Arc<Notify>) {
            let entered = Arc::new(Notify::new());
            let release = Arc::new(Notify::new());
            *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
            (entered, release)
        }

        fn calls(&self) -> Vec<ApiRequest> {
            self.calls.lock().unwrap().clone()
        }

        fn urls(&self) -> Vec<String> {
            self.calls().into_iter().map(|r| r.url).collect()
        }

        fn count_to(&self, url: &str) -> usize {
            self.calls().iter().filter(|r| r.url == url).count()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
            self.calls.lock().unwrap().push(request.clone());

            let gate = self.gate.lock().unwrap().clone();
            if let Some((entered, release)) = gate {
                entered.notify_one();
                release.notified().await;
            }

            if self.network_down.load(Ordering::SeqCst)
                || self.failing_urls.lock().unwrap().contains(&request.url)
            {
                return Err(ApiError::Network("connection refused".to_string()));
            }

            let reply = {
                let mut replies = self.replies.lock().unwrap();
                match replies.get_mut(&(request.method, request.url.clone())) {
                    Some(queue) if queue.len() > 1 => queue.pop_front(),
                    Some(queue) => queue.front().cloned(),
                    None => None,
                }
            };
            match reply.unwrap_or(Reply::Status(200, json!({}))) {
                Reply::Status(status, body) => Ok(ApiResponse::new(status, body)),
                Reply::NetworkError => Err(ApiError::Network("connection reset".to_string())),
            }
        }
    }

    // ============================================
    // HELPERS
    // ============================================

    fn open_client(dir: &Path, transport: Arc<MockTransport>) -> ApiClient {
        let config = ClientConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let db = Arc::new(Database::open_with_recovery(dir).expect("Failed to open storage"));
        ApiClient::new(
            config,
            db,
            transport,
            SecretBox::from_key(&[42u8; 32]).unwrap(),
            Arc::new(Connectivity::new()),
        )
    }

    fn setup() -> (ApiClient, Arc<MockTransport>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let transport = MockTransport::new();
        let client = open_client(temp_dir.path(), transport.clone());
        (client, transport, temp_dir)
    }

    fn seed_tokens(client: &ApiClient, access: &str, refresh: &str) {
        client
            .auth()
            .session()
            .set_tokens(access, refresh)
            .expect("Failed to store tokens");
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<AuthEvent>) -> Vec<AuthEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn op(url: &str, timestamp: i64) -> PendingOperation {
        PendingOperation::new(HttpMethod::Post, url, Some(json!({ "ts": timestamp })))
            .with_timestamp(timestamp)
    }

    // ============================================
    // AUTHENTICATED TRANSPORT
    // ============================================

    #[tokio::test]
    async fn test_bearer_token_attached_when_stored() {
        let (client, transport, _dir) = setup();

        client
            .get("/propietarios/", Vec::new(), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(transport.calls()[0].authorization(), None);

        seed_tokens(&client, "T1", "R1");
        client
            .get("/propietarios/", Vec::new(), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(transport.calls()[1].authorization(), Some("Bearer T1"));
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_and_retried_once() {
        let (client, transport, _dir) = setup();
        seed_tokens(&client, "T1", "R1");
        transport.reply(
            HttpMethod::Get,
            "/unidades/",
            vec![
                Reply::Status(401, json!({"detail": "Token expirado"})),
                Reply::Status(200, json!([{"id": 1}])),
            ],
        );
        transport.reply(
            HttpMethod::Post,
            endpoints::TOKEN_REFRESH,
            vec![Reply::Status(200, json!({"access": "T2"}))],
        );

        let response = client
            .get("/unidades/", Vec::new(), RequestOptions::default())
            .await
            .expect("Retried request should succeed");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!([{"id": 1}]));

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].authorization(), Some("Bearer T1"));
        assert_eq!(calls[1].url, endpoints::TOKEN_REFRESH);
        assert_eq!(calls[1].body, Some(json!({"refresh": "R1"})));
        assert_eq!(calls[1].authorization(), None);
        assert_eq!(calls[2].authorization(), Some("Bearer T2"));
        assert!(calls[2].is_retried());

        let session = client.auth().session();
        assert_eq!(session.access_token().unwrap().as_deref(), Some("T2"));
        assert_eq!(session.refresh_token().unwrap().as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_stored() {
        let (client, transport, _dir) = setup();
        seed_tokens(&client, "T1", "R1");
        transport.reply(
            HttpMethod::Post,
            endpoints::TOKEN_REFRESH,
            vec![Reply::Status(200, json!({"access": "T2", "refresh": "R2"}))],
        );

        client.auth().refresh().await.unwrap();
        let session = client.auth().session();
        assert_eq!(session.refresh_token().unwrap().as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_second_401_forces_logout_without_second_refresh() {
        let (client, transport, _dir) = setup();
        seed_tokens(&client, "T1", "R1");
        client
            .auth()
            .session()
            .set_user(&models::SessionUser::admin("admin"))
            .unwrap();
        client.auth().set_current_route("/dashboard");
        let mut rx = client.auth().subscribe();

        transport.reply(
            HttpMethod::Get,
            "/pagos/",
            vec![Reply::Status(401, json!({"detail": "No autorizado"}))],
        );
        transport.reply(
            HttpMethod::Post,
            endpoints::TOKEN_REFRESH,
            vec![Reply::Status(200, json!({"access": "T2"}))],
        );

        let err = client
            .get("/pagos/", Vec::new(), RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.count_to(endpoints::TOKEN_REFRESH), 1);
        assert_eq!(transport.count_to("/pagos/"), 2);

        let session = client.auth().session();
        assert_eq!(session.access_token().unwrap(), None);
        assert_eq!(session.refresh_token().unwrap(), None);
        assert_eq!(session.user().unwrap(), None);

        let events = drain_events(&mut rx);
        assert_eq!(
            events.last(),
            Some(&AuthEvent::LoggedOut {
                forced: true,
                redirect: Some("/login".to_string())
            })
        );
        assert_eq!(client.auth().current_route(), "/login");
    }

    #[tokio::test]
    async fn test_refresh_failure_forces_logout() {
        let (client, transport, _dir) = setup();
        seed_tokens(&client, "T1", "R1");
        transport.reply(
            HttpMethod::Get,
            "/visitas/",
            vec![Reply::Status(401, Value::Null)],
        );
        transport.reply(
            HttpMethod::Post,
            endpoints::TOKEN_REFRESH,
            vec![Reply::Status(401, json!({"detail": "Token inválido"}))],
        );

        let err = client
            .get("/visitas/", Vec::new(), RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.urls(), vec!["/visitas/", endpoints::TOKEN_REFRESH]);
        assert_eq!(client.auth().session().access_token().unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_forces_logout_without_refresh_call() {
        let (client, transport, _dir) = setup();
        transport.reply(
            HttpMethod::Get,
            "/expensas/",
            vec![Reply::Status(401, Value::Null)],
        );
        let mut rx = client.auth().subscribe();

        let err = client
            .get("/expensas/", Vec::new(), RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(transport.count_to(endpoints::TOKEN_REFRESH), 0);
        assert!(drain_events(&mut rx)
            .iter()
            .any(|e| matches!(e, AuthEvent::LoggedOut { forced: true, .. })));
    }

    #[tokio::test]
    async fn test_forced_logout_on_login_page_does_not_redirect() {
        let (client, transport, _dir) = setup();
        client.auth().set_current_route("/login?next=/reservas");
        transport.reply(
            HttpMethod::Get,
            "/reservas/",
            vec![Reply::Status(401, Value::Null)],
        );
        let mut rx = client.auth().subscribe();

        let _ = client
            .get("/reservas/", Vec::new(), RequestOptions::default())
            .await;
        assert_eq!(
            drain_events(&mut rx),
            vec![AuthEvent::LoggedOut {
                forced: true,
                redirect: None
            }]
        );
    }

    #[tokio::test]
    async fn test_non_401_errors_propagate_untouched() {
        let (client, transport, _dir) = setup();
        seed_tokens(&client, "T1", "R1");
        transport.reply(
            HttpMethod::Post,
            "/reservas/",
            vec![Reply::Status(400, json!({"detail": "Horario ocupado"}))],
        );

        let err = client
            .post("/reservas/", json!({"area": 2}), RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.detail(), "Horario ocupado");
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(
            client.auth().session().access_token().unwrap().as_deref(),
            Some("T1")
        );
    }

    #[tokio::test]
    async fn test_login_stores_encrypted_tokens() {
        let (client, transport, _dir) = setup();
        transport.reply(
            HttpMethod::Post,
            endpoints::TOKEN,
            vec![Reply::Status(200, json!({"access": "A1", "refresh": "R1"}))],
        );

        let user = client.auth().login("admin", "secreto").await.unwrap();
        assert!(user.is_admin);
        assert_eq!(
            transport.calls()[0].body,
            Some(json!({"username": "admin", "password": "secreto"}))
        );

        let raw = client
            .storage()
            .get_item(storage::ACCESS_TOKEN)
            .unwrap()
            .unwrap();
        assert!(SecretBox::is_encrypted(&raw));
        assert!(!raw.contains("A1"));
        assert_eq!(
            client.auth().restore_session().unwrap().map(|u| u.username),
            Some("admin".to_string())
        );

        client.auth().logout().unwrap();
        assert_eq!(client.auth().restore_session().unwrap(), None);
    }

    #[tokio::test]
    async fn test_login_rejected_keeps_session_empty() {
        let (client, transport, _dir) = setup();
        transport.reply(
            HttpMethod::Post,
            endpoints::TOKEN,
            vec![Reply::Status(
                401,
                json!({"detail": "No active account found with the given credentials"}),
            )],
        );

        let err = client.auth().login("admin", "mal").await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(client.auth().session().access_token().unwrap(), None);
    }

    #[test]
    fn test_plaintext_token_is_accepted_and_reencrypted() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(temp_dir.path(), MockTransport::new());
        client
            .storage()
            .set_item(storage::ACCESS_TOKEN, "legacy-plain")
            .unwrap();

        assert_eq!(
            client.auth().session().access_token().unwrap().as_deref(),
            Some("legacy-plain")
        );
        let raw = client
            .storage()
            .get_item(storage::ACCESS_TOKEN)
            .unwrap()
            .unwrap();
        assert!(SecretBox::is_encrypted(&raw));
    }

    // ============================================
    // CONNECTIVITY GUARD
    // ============================================

    #[tokio::test]
    async fn test_offline_cancels_non_tolerant_request_without_dispatch() {
        let (client, transport, _dir) = setup();
        client.connectivity().set_online(false);

        let err = client
            .post("/comunicados/", json!({"titulo": "Corte de agua"}), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_offline_cancel());
        assert_eq!(err.to_string(), "Operation cancelled: no internet connection");
        assert!(transport.calls().is_empty());
        assert!(client.queue().is_empty());
    }

    #[tokio::test]
    async fn test_offline_tolerant_request_is_queued_with_ack() {
        let (client, transport, _dir) = setup();
        seed_tokens(&client, "T1", "R1");
        client.connectivity().set_online(false);
        transport.set_network_down(true);

        let body = json!({"nombre": "Ana", "fecha_visita": "2026-10-20"});
        let response = client
            .post("/visitas/", body.clone(), RequestOptions::offline())
            .await
            .expect("Tolerant request should resolve");

        assert_eq!(response.status, 200);
        assert!(response.offline_operation);
        assert_eq!(
            response.body,
            json!({"success": true, "offlineOperation": true, "pendingSync": true})
        );
        assert!(transport.calls()[0].is_offline_request());

        let pending = client.queue().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].method, HttpMethod::Post);
        assert_eq!(pending[0].url, "/visitas/");
        assert_eq!(pending[0].body, Some(body));
        assert_eq!(
            pending[0].headers.get("Authorization").map(|s| s.as_str()),
            Some("Bearer T1")
        );
        assert!(pending[0].timestamp > 0);
        assert_eq!(pending[0].id, pending[0].timestamp.to_string());
    }

    #[tokio::test]
    async fn test_disconnection_while_online_queues_tolerant_request_only() {
        let (client, transport, _dir) = setup();
        transport.reply(HttpMethod::Patch, "/reservas/3/", vec![Reply::NetworkError]);
        transport.reply(HttpMethod::Get, "/reservas/", vec![Reply::NetworkError]);

        let response = client
            .patch("/reservas/3/", json!({"estado": "confirmada"}), RequestOptions::offline())
            .await
            .unwrap();
        assert!(response.offline_operation);
        assert_eq!(client.queue().len(), 1);

        let err = client
            .get("/reservas/", Vec::new(), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_disconnection());
        assert_eq!(client.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_tolerant_request_goes_through_when_server_answers() {
        let (client, transport, _dir) = setup();
        transport.reply(
            HttpMethod::Post,
            "/visitas/",
            vec![Reply::Status(201, json!({"id": 9}))],
        );

        let response = client
            .post("/visitas/", json!({"nombre": "Ana"}), RequestOptions::offline())
            .await
            .unwrap();
        assert_eq!(response.status, 201);
        assert!(!response.offline_operation);
        assert!(client.queue().is_empty());
    }

    // ============================================
    // OFFLINE OPERATION QUEUE
    // ============================================

    #[tokio::test]
    async fn test_drain_replays_in_timestamp_order_and_keeps_failures() {
        let (client, transport, _dir) = setup();
        let queue = client.queue();
        queue.enqueue(op("/reservas/300/", 300));
        queue.enqueue(op("/reservas/100/", 100));
        queue.enqueue(op("/reservas/200/", 200));
        transport.fail_url("/reservas/200/");

        let report = client.sync_pending_operations().await;
        assert_eq!(
            report,
            DrainReport {
                attempted: 3,
                synced: 2,
                pending: 1,
                skipped: None
            }
        );
        assert_eq!(
            transport.urls(),
            vec!["/reservas/100/", "/reservas/200/", "/reservas/300/"]
        );
        let left = queue.pending();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].url, "/reservas/200/");
        assert_eq!(left[0].timestamp, 200);

        transport.heal_url("/reservas/200/");
        let report = client.sync_pending_operations().await;
        assert_eq!(report.synced, 1);
        assert!(queue.is_empty());
        assert_eq!(transport.count_to("/reservas/100/"), 1);
        assert_eq!(transport.count_to("/reservas/200/"), 2);
        assert_eq!(transport.count_to("/reservas/300/"), 1);
        assert_eq!(
            client.storage().get_item(storage::PENDING_OPERATIONS).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_replay_rejected_by_server_is_dropped() {
        let (client, transport, _dir) = setup();
        client.queue().enqueue(op("/pagos/", 10));
        transport.reply(
            HttpMethod::Post,
            "/pagos/",
            vec![Reply::Status(400, json!({"monto": ["Requerido"]}))],
        );

        let report = client.sync_pending_operations().await;
        assert_eq!(report.synced, 1);
        assert!(client.queue().is_empty());
    }

    #[tokio::test]
    async fn test_replay_uses_current_session_token() {
        let (client, transport, _dir) = setup();
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer OLD".to_string());
        headers.insert("X-Trace".to_string(), "abc".to_string());
        client
            .queue()
            .enqueue(op("/vehiculos/", 5).with_headers(headers));
        seed_tokens(&client, "T9", "R9");

        client.sync_pending_operations().await;
        let call = &transport.calls()[0];
        assert_eq!(call.authorization(), Some("Bearer T9"));
        assert_eq!(call.headers.get("X-Trace").map(|s| s.as_str()), Some("abc"));
        assert_eq!(call.body, Some(json!({"ts": 5})));
        assert!(!call.is_retried());
    }

    #[tokio::test]
    async fn test_drain_skipped_while_offline() {
        let (client, transport, _dir) = setup();
        client.queue().enqueue(op("/visitas/", 1));
        client.connectivity().set_online(false);

        let report = client.sync_pending_operations().await;
        assert_eq!(report.skipped, Some(DrainSkip::Offline));
        assert_eq!(report.pending, 1);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_drain_is_noop() {
        let (client, transport, _dir) = setup();
        assert_eq!(client.sync_pending_operations().await, DrainReport::default());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_single_flight() {
        let (client, transport, _dir) = setup();
        client.queue().enqueue(op("/areas/", 1));
        let (entered, release) = transport.hold();

        let queue = client.queue().clone();
        let first = tokio::spawn(async move { queue.drain().await });
        entered.notified().await;

        let second = client.queue().drain().await;
        assert_eq!(second.skipped, Some(DrainSkip::AlreadyRunning));
        assert_eq!(second.pending, 1);

        // Добавлено во время drain: должно пережить write-back
        client.queue().enqueue(op("/areas/late/", 2));

        release.notify_one();
        let report = first.await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.attempted, 1);

        let left = client.queue().pending();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].url, "/areas/late/");
        assert_eq!(transport.count_to("/areas/"), 1);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let id = {
            let client = open_client(temp_dir.path(), transport.clone());
            client.connectivity().set_online(false);
            transport.set_network_down(true);
            client
                .delete("/vehiculos/4/", RequestOptions::offline())
                .await
                .unwrap();
            client.queue().pending()[0].id.clone()
        };

        let client = open_client(temp_dir.path(), transport.clone());
        let pending = client.queue().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].method, HttpMethod::Delete);

        let raw = client
            .storage()
            .get_item(storage::PENDING_OPERATIONS)
            .unwrap()
            .unwrap();
        let stored: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored[0]["method"], "delete");
        assert_eq!(stored[0]["url"], "/vehiculos/4/");
    }

    #[test]
    fn test_unreadable_queue_is_treated_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = Database::open_with_recovery(temp_dir.path()).unwrap();
            db.set_item(storage::PENDING_OPERATIONS, "not json").unwrap();
        }
        let client = open_client(temp_dir.path(), MockTransport::new());
        assert!(client.queue().is_empty());
    }

    #[test]
    fn test_legacy_entries_get_ids_on_load() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = Database::open_with_recovery(temp_dir.path()).unwrap();
            let legacy = json!([
                {"url": "/visitas/", "method": "POST", "data": {"nombre": "Ana"}, "timestamp": 50},
                {"url": "/visitas/", "method": "post", "data": {"nombre": "Luis"}, "timestamp": 50}
            ]);
            db.set_item(storage::PENDING_OPERATIONS, &legacy.to_string())
                .unwrap();
        }
        let client = open_client(temp_dir.path(), MockTransport::new());
        let pending = client.queue().pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "50");
        assert_eq!(pending[1].id, "50-1");
        assert_eq!(pending[1].body, Some(json!({"nombre": "Luis"})));
    }

    #[tokio::test]
    async fn test_add_pending_operation_syncs_when_online() {
        let (client, transport, _dir) = setup();
        client
            .add_pending_operation(op("/comunicados/", 7))
            .await;
        assert!(client.queue().is_empty());
        assert_eq!(transport.urls(), vec!["/comunicados/"]);

        client.connectivity().set_online(false);
        let id = client.add_pending_operation(op("/comunicados/", 8)).await;
        assert_eq!(id, "8");
        assert_eq!(client.queue().len(), 1);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_online_event_triggers_drain() {
        let (client, transport, _dir) = setup();
        client.connectivity().set_online(false);
        client.add_pending_operation(op("/unidades/", 3)).await;

        let listener = sync::spawn_drain_on_online(client.queue().clone());
        client.connectivity().set_online(true);

        for _ in 0..100 {
            if client.queue().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.queue().is_empty());
        assert_eq!(transport.count_to("/unidades/"), 1);
        listener.abort();
    }

    #[test]
    fn test_queue_stats() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(temp_dir.path(), MockTransport::new());
        let queue = client.queue();
        queue.enqueue(op("/a/", 30));
        queue.enqueue(op("/b/", 10));
        queue.enqueue(PendingOperation::new(HttpMethod::Delete, "/c/1/", None).with_timestamp(20));

        let stats = queue.stats();
        assert_eq!(stats.pending_count, 3);
        assert_eq!(stats.oldest_timestamp, Some(10));
        assert_eq!(stats.pending_by_method.get("POST"), Some(&2));
        assert_eq!(stats.pending_by_method.get("DELETE"), Some(&1));

        queue.clear();
        assert!(queue.is_empty());
    }

    // ============================================
    // LISTS / RESOURCES
    // ============================================

    #[tokio::test]
    async fn test_paged_list_fetch() {
        let (client, transport, _dir) = setup();
        transport.reply(
            HttpMethod::Get,
            "/propietarios/",
            vec![
                Reply::Status(
                    200,
                    json!({"count": 45, "next": null, "previous": null, "results": [{"id": 1}, {"id": 2}]}),
                ),
                Reply::Status(500, json!({"detail": "Error interno"})),
            ],
        );

        let mut list = PagedList::new("/propietarios/");
        list.set_filter("search", "garcia");
        list.fetch(&client).await.unwrap();
        assert_eq!(list.items().len(), 2);
        assert_eq!(list.count(), 45);
        assert_eq!(list.error(), None);

        let query = &transport.calls()[0].query;
        assert!(query.contains(&("page".to_string(), "1".to_string())));
        assert!(query.contains(&("page_size".to_string(), "20".to_string())));
        assert!(query.contains(&("search".to_string(), "garcia".to_string())));

        assert!(list.refresh(&client).await.is_err());
        assert_eq!(list.error(), Some("Error interno"));
        assert_eq!(list.items().len(), 2);
    }

    #[tokio::test]
    async fn test_paged_list_accepts_bare_array_and_unknown_shape() {
        let (client, transport, _dir) = setup();
        transport.reply(
            HttpMethod::Get,
            "/areas/",
            vec![
                Reply::Status(200, json!([{"id": 1}, {"id": 2}, {"id": 3}])),
                Reply::Status(200, json!({"unexpected": true})),
            ],
        );

        let mut list = PagedList::new("/areas/");
        list.fetch(&client).await.unwrap();
        assert_eq!(list.count(), 3);
        list.fetch(&client).await.unwrap();
        assert!(list.items().is_empty());
        assert_eq!(list.count(), 0);
    }

    #[tokio::test]
    async fn test_list_cache_fallback() {
        let (client, transport, _dir) = setup();
        transport.reply(
            HttpMethod::Get,
            "/visitas/",
            vec![Reply::Status(200, json!({"count": 1, "results": [{"id": 11}]}))],
        );
        let cache = ListCache::new(client.storage().clone(), storage::VISITAS_CACHE);

        let live = fetch_list_with_cache(&client, "/visitas/", Vec::new(), &cache).await;
        assert!(!live.stale);
        assert_eq!(live.items, vec![json!({"id": 11})]);

        transport.set_network_down(true);
        let cached = fetch_list_with_cache(&client, "/visitas/", Vec::new(), &cache).await;
        assert!(cached.stale);
        assert_eq!(cached.items, vec![json!({"id": 11})]);
        assert!(cached.error.is_some());

        let empty = ListCache::new(client.storage().clone(), storage::RESERVAS_CACHE);
        let none = fetch_list_with_cache(&client, "/reservas/", Vec::new(), &empty).await;
        assert!(!none.stale);
        assert!(none.items.is_empty());
    }

    #[tokio::test]
    async fn test_resource_routes() {
        let (client, transport, _dir) = setup();
        let reservas = Resource::new(names::RESERVAS);

        reservas
            .action(&client, 5, "confirm", json!({}), RequestOptions::default())
            .await
            .unwrap();
        reservas
            .partial_update(&client, 5, json!({"notas": "x"}), RequestOptions::offline())
            .await
            .unwrap();
        reservas
            .destroy(&client, 5, RequestOptions::default())
            .await
            .unwrap();

        let calls = transport.calls();
        assert_eq!(calls[0].method, HttpMethod::Patch);
        assert_eq!(calls[0].url, "/reservas/5/confirm/");
        assert_eq!(calls[1].url, "/reservas/5/");
        assert!(calls[1].options.offline_support);
        assert_eq!(calls[2].method, HttpMethod::Delete);
    }

    #[tokio::test]
    async fn test_per_request_timeout_is_forwarded() {
        let (client, transport, _dir) = setup();
        client
            .post(
                "/vehiculos/reconocer-placa/",
                json!({"imagen": "base64..."}),
                RequestOptions::default().with_timeout(PLATE_RECOGNITION_TIMEOUT),
            )
            .await
            .unwrap();
        assert_eq!(
            transport.calls()[0].options.timeout,
            Some(Duration::from_secs(60))
        );
    }
}
