//! End-to-end tests: a real gateway on an ephemeral port, backed by the
//! in-memory store, driven by websocket and HTTP clients.

use std::{sync::Arc, time::Duration};

use chat_gateway::{
    serve_with_listener,
    store::{ConversationStore, MemoryStore},
    types::{MessageRole, SessionStatus, TenantContext},
    GatewayConfig, GatewayState,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(150);

struct TestGateway {
    base: String,
    store: Arc<MemoryStore>,
    state: Arc<GatewayState>,
    acme: TenantContext,
    server: JoinHandle<()>,
}

impl TestGateway {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        let acme = store.seed_tenant("acme", true).await;
        store.seed_tenant("dormant", false).await;

        let state = GatewayState::new(GatewayConfig::default(), store.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_state = state.clone();
        let server = tokio::spawn(async move {
            let _ = serve_with_listener(listener, server_state).await;
        });

        Self {
            base: format!("127.0.0.1:{}", addr.port()),
            store,
            state,
            acme,
            server,
        }
    }

    async fn connect(&self, path: &str) -> Ws {
        let (ws, _response) = connect_async(format!("ws://{}{}", self.base, path))
            .await
            .expect("websocket connect failed");
        ws
    }

    fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.base, path)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn next_frame(ws: &mut Ws) -> Value {
    loop {
        let message = tokio::time::timeout(FRAME_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket ended")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("frame is not json");
        }
    }
}

async fn assert_quiet(ws: &mut Ws) {
    if let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout(QUIET_PERIOD, ws.next()).await
    {
        panic!("unexpected frame: {text}");
    }
}

async fn assert_closed(ws: &mut Ws) {
    loop {
        match tokio::time::timeout(FRAME_TIMEOUT, ws.next())
            .await
            .expect("socket was not closed")
        {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Text(text))) => panic!("unexpected frame after error: {text}"),
            Some(Ok(_)) => continue,
        }
    }
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send failed");
}

async fn widget_session(ws: &mut Ws) -> Uuid {
    let created = next_frame(ws).await;
    assert_eq!(created["type"], "session_created");
    Uuid::parse_str(created["sessionId"].as_str().unwrap()).unwrap()
}

async fn join_admin(gw: &TestGateway, session_id: Uuid) -> Ws {
    let mut admin = gw.connect("/ws/acme?role=admin").await;
    assert_eq!(next_frame(&mut admin).await, json!({ "type": "admin_ready" }));
    send(
        &mut admin,
        json!({ "type": "admin_join", "sessionId": session_id.to_string() }),
    )
    .await;
    assert_eq!(
        next_frame(&mut admin).await,
        json!({ "type": "admin_joined", "sessionId": session_id.to_string() })
    );
    admin
}

async fn wait_for_status(store: &MemoryStore, session_id: Uuid, status: SessionStatus) {
    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    loop {
        if store.session(session_id).await.map(|s| s.status) == Some(status) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {session_id} never reached {status}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn widget_connect_creates_exactly_one_fresh_session() {
    let gw = TestGateway::start().await;

    let mut first = gw.connect("/ws/acme").await;
    let created = next_frame(&mut first).await;
    assert_eq!(created["type"], "session_created");
    assert_eq!(created["tenantId"], json!(gw.acme.id.to_string()));
    assert_quiet(&mut first).await;

    let mut second = gw.connect("/ws/acme").await;
    let other = widget_session(&mut second).await;
    assert_ne!(created["sessionId"], json!(other.to_string()));

    assert_eq!(gw.store.session_count().await, 2);
    assert_eq!(gw.store.usage(gw.acme.id).await.sessions, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_and_inactive_tenants_get_one_error_and_close() {
    let gw = TestGateway::start().await;

    for path in ["/ws/nobody", "/ws/dormant", "/ws/dormant?role=admin"] {
        let mut ws = gw.connect(path).await;
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame["type"], "error", "{path}");
        assert!(frame["message"].is_string());
        assert_closed(&mut ws).await;
    }

    assert_eq!(gw.store.session_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn widget_message_reaches_every_admin_and_is_not_echoed() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws/acme").await;
    let session_id = widget_session(&mut widget).await;

    let mut admins = Vec::new();
    for _ in 0..3 {
        admins.push(join_admin(&gw, session_id).await);
    }

    send(
        &mut widget,
        json!({ "type": "message", "role": "user", "content": "Hello", "id": "1" }),
    )
    .await;

    assert_eq!(
        next_frame(&mut widget).await,
        json!({ "type": "ack", "messageId": "1" })
    );
    assert_quiet(&mut widget).await;

    for admin in admins.iter_mut() {
        assert_eq!(
            next_frame(admin).await,
            json!({ "type": "message", "role": "user", "content": "Hello", "id": "1" })
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_message_is_acked_and_persisted() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws/acme?utm_source=google").await;
    let created = next_frame(&mut widget).await;
    assert_eq!(created["tenantId"], json!(gw.acme.id.to_string()));
    let session_id = Uuid::parse_str(created["sessionId"].as_str().unwrap()).unwrap();

    send(
        &mut widget,
        json!({ "type": "message", "role": "user", "content": "Hello", "id": "1" }),
    )
    .await;
    assert_eq!(
        next_frame(&mut widget).await,
        json!({ "type": "ack", "messageId": "1" })
    );

    let messages = gw.store.messages(session_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "Hello");
    assert_eq!(
        gw.store.session(session_id).await.unwrap().utm_source.as_deref(),
        Some("google")
    );
    assert_eq!(gw.store.usage(gw.acme.id).await.messages, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_sent_before_the_handshake_settles_are_handled_after_it() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws/acme").await;
    send(
        &mut widget,
        json!({ "type": "message", "role": "user", "content": "early", "id": "e" }),
    )
    .await;

    let session_id = widget_session(&mut widget).await;
    assert_eq!(
        next_frame(&mut widget).await,
        json!({ "type": "ack", "messageId": "e" })
    );
    assert_quiet(&mut widget).await;
    assert_eq!(gw.store.session_count().await, 1);
    let messages = gw.store.messages(session_id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "early");

    let mut admin = gw.connect("/ws/acme?role=admin").await;
    send(
        &mut admin,
        json!({ "type": "admin_join", "sessionId": session_id.to_string() }),
    )
    .await;
    assert_eq!(next_frame(&mut admin).await, json!({ "type": "admin_ready" }));
    assert_eq!(
        next_frame(&mut admin).await,
        json!({ "type": "admin_joined", "sessionId": session_id.to_string() })
    );

    send(
        &mut widget,
        json!({ "type": "message", "role": "user", "content": "still open", "id": "f" }),
    )
    .await;
    assert_eq!(
        next_frame(&mut widget).await,
        json!({ "type": "ack", "messageId": "f" })
    );
    assert_eq!(next_frame(&mut admin).await["content"], "still open");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn takeover_reaches_widget_and_admin_every_time() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws/acme").await;
    let session_id = widget_session(&mut widget).await;
    let mut admin = join_admin(&gw, session_id).await;

    for _ in 0..2 {
        send(&mut admin, json!({ "type": "manager_takeover" })).await;
        assert_eq!(
            next_frame(&mut widget).await,
            json!({ "type": "takeover_active" })
        );
        assert_eq!(
            next_frame(&mut admin).await,
            json!({ "type": "takeover_active" })
        );
    }

    assert!(gw.store.session(session_id).await.unwrap().human_managed);
    assert_eq!(gw.store.human_managed_writes(), 2);
    assert_eq!(gw.state.relay.effects().failure_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manager_message_is_relayed_to_widget_as_manager() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws/acme").await;
    let session_id = widget_session(&mut widget).await;
    let mut admin = join_admin(&gw, session_id).await;

    send(
        &mut admin,
        json!({ "type": "manager_message", "role": "bot", "content": "A human here", "id": "m1" }),
    )
    .await;

    assert_eq!(
        next_frame(&mut widget).await,
        json!({ "type": "message", "role": "manager", "content": "A human here", "id": "m1" })
    );
    assert_eq!(
        next_frame(&mut admin).await,
        json!({ "type": "ack", "messageId": "m1" })
    );
    assert_quiet(&mut admin).await;
    assert_eq!(
        gw.store.messages(session_id).await[0].role,
        MessageRole::Manager
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_close_leaves_converted_sessions_alone() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws/acme").await;
    let session_id = widget_session(&mut widget).await;
    gw.store
        .update_session_status(session_id, SessionStatus::Converted)
        .await
        .unwrap();

    send(&mut widget, json!({ "type": "session_close" })).await;
    // Frames are handled in order, so the ack proves session_close ran.
    send(
        &mut widget,
        json!({ "type": "message", "role": "user", "content": "bye", "id": "2" }),
    )
    .await;
    assert_eq!(next_frame(&mut widget).await["type"], "ack");

    assert_eq!(
        gw.store.session(session_id).await.unwrap().status,
        SessionStatus::Converted
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_frames_do_not_terminate_the_connection() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws/acme").await;
    widget_session(&mut widget).await;

    widget
        .send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();
    send(&mut widget, json!({ "type": "typing", "active": true })).await;
    send(&mut widget, json!({ "type": "message", "role": "user" })).await;
    send(
        &mut widget,
        json!({ "type": "message", "role": "user", "content": "still here", "id": "3" }),
    )
    .await;

    assert_eq!(
        next_frame(&mut widget).await,
        json!({ "type": "ack", "messageId": "3" })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_widget_disconnect_closes_and_reconnect_starts_fresh() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws/acme").await;
    let session_id = widget_session(&mut widget).await;

    widget.close(None).await.unwrap();
    wait_for_status(&gw.store, session_id, SessionStatus::Closed).await;

    let mut again = gw.connect("/ws/acme").await;
    let fresh = widget_session(&mut again).await;
    assert_ne!(fresh, session_id);
    assert_eq!(
        gw.store.session(fresh).await.unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admin_disconnect_keeps_session_active() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws/acme").await;
    let session_id = widget_session(&mut widget).await;
    let mut admin = join_admin(&gw, session_id).await;

    admin.close(None).await.unwrap();
    drop(admin);

    // Widget traffic still flows and the session stays active.
    send(
        &mut widget,
        json!({ "type": "message", "role": "user", "content": "anyone?", "id": "4" }),
    )
    .await;
    assert_eq!(next_frame(&mut widget).await["type"], "ack");
    assert_eq!(
        gw.store.session(session_id).await.unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn legacy_endpoint_creates_tenantless_sessions() {
    let gw = TestGateway::start().await;
    let mut widget = gw.connect("/ws").await;
    let created = next_frame(&mut widget).await;
    assert_eq!(created["type"], "session_created");
    assert_eq!(created["tenantId"], Value::Null);

    let session_id = Uuid::parse_str(created["sessionId"].as_str().unwrap()).unwrap();
    assert_eq!(gw.store.session(session_id).await.unwrap().tenant_id, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_routes_share_the_tenant_policy() {
    let gw = TestGateway::start().await;

    let health: Value = reqwest::get(gw.http("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["ok"], true);

    let resp = reqwest::get(gw.http("/api/t/acme/bootstrap")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["tenantId"], json!(gw.acme.id.to_string()));

    let resp = reqwest::get(gw.http("/api/t/nobody/bootstrap")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let resp = reqwest::get(gw.http("/api/t/dormant/bootstrap")).await.unwrap();
    assert_eq!(resp.status(), 403);
}
