use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::{net::TcpListener, sync::mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, StoreBackend};
use crate::effects::EffectRunner;
use crate::error::{GatewayError, Result};
use crate::protocol::{encode, OutboundFrame};
use crate::registry::{ConnectionHandle, SessionRegistry};
use crate::relay::{Connection, Relay, WidgetOrigin};
use crate::store::{ConversationStore, MemoryStore, PgStore};
use crate::tenant::TenantResolver;
use crate::types::{ConnectQuery, ConnectionKind, TenantContext};

pub struct GatewayState {
    pub tenants: TenantResolver,
    pub registry: Arc<SessionRegistry>,
    pub relay: Relay,
    next_conn_id: AtomicUsize,
}

impl GatewayState {
    /// Wires the gateway components around `store`. Must be called inside a
    /// tokio runtime (starts the side-effect sink).
    pub fn new(config: GatewayConfig, store: Arc<dyn ConversationStore>) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let tenants = TenantResolver::new(store.clone(), config.tenant_cache_ttl);
        let relay = Relay::new(store.clone(), registry.clone(), EffectRunner::start());
        Arc::new(Self {
            tenants,
            registry,
            relay,
            next_conn_id: AtomicUsize::new(0),
        })
    }

    fn next_conn_id(&self) -> usize {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

enum Entry {
    Legacy {
        origin: WidgetOrigin,
    },
    Tenant {
        slug: String,
        admin: bool,
        origin: WidgetOrigin,
    },
}

fn device_from_headers(headers: &HeaderMap) -> Option<String> {
    let agent = headers.get(header::USER_AGENT)?.to_str().ok()?;
    let mobile = ["Mobi", "Android", "iPhone"]
        .iter()
        .any(|marker| agent.contains(marker));
    Some(if mobile { "mobile" } else { "desktop" }.to_string())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn legacy_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let entry = Entry::Legacy {
        origin: WidgetOrigin {
            utm_source: query.utm_source,
            device: device_from_headers(&headers),
        },
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, entry))
}

async fn tenant_ws_handler(
    ws: WebSocketUpgrade,
    Path(slug): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let entry = Entry::Tenant {
        slug,
        admin: query.is_admin(),
        origin: WidgetOrigin {
            utm_source: query.utm_source,
            device: device_from_headers(&headers),
        },
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, entry))
}

async fn reject(mut socket: WebSocket, err: &GatewayError) {
    let frame = OutboundFrame::Error {
        message: err.client_message().to_string(),
    };
    if let Some(payload) = encode(&frame) {
        let _ = socket.send(Message::Text(payload.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn handshake(
    state: &Arc<GatewayState>,
    entry: Entry,
    conn_id: usize,
    tx: mpsc::UnboundedSender<String>,
) -> Result<Connection> {
    match entry {
        Entry::Legacy { origin } => {
            let handle = ConnectionHandle::new(conn_id, ConnectionKind::Widget, tx);
            state.relay.open_widget(handle, None, origin).await
        }
        Entry::Tenant {
            slug,
            admin,
            origin,
        } => {
            let tenant = state.tenants.resolve(&slug).await?;
            if admin {
                let handle = ConnectionHandle::new(conn_id, ConnectionKind::Admin, tx);
                Ok(state.relay.open_admin(handle, &tenant))
            } else {
                let handle = ConnectionHandle::new(conn_id, ConnectionKind::Widget, tx);
                state.relay.open_widget(handle, Some(&tenant), origin).await
            }
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, entry: Entry) {
    let conn_id = state.next_conn_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let mut conn = match handshake(&state, entry, conn_id, tx).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(conn_id, error = %err, "handshake rejected");
            reject(socket, &err).await;
            return;
        }
    };
    debug!(conn_id, kind = conn.kind().as_str(), "connection open");

    // Nothing is read before the handshake settles, so frames sent early wait
    // in the socket and are dispatched below against the new session.
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            Message::Binary(_) => {
                warn!(
                    conn_id,
                    error = %GatewayError::MalformedFrame("binary frames are not supported".to_string()),
                    "dropping frame"
                );
                continue;
            }
            _ => continue,
        };
        state.relay.handle_text(&mut conn, &text).await;
    }

    state.relay.disconnect(&conn).await;
    debug!(conn_id, "connection closed");
    send_task.abort();
}

/// Resolves `{slug}` with the same policy as the websocket handshake and
/// exposes the tenant as a request extension.
async fn require_tenant(
    State(state): State<Arc<GatewayState>>,
    Path(slug): Path<String>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.tenants.resolve(&slug).await {
        Ok(tenant) => {
            request.extensions_mut().insert(tenant);
            next.run(request).await
        }
        Err(err) => {
            let status = match err {
                GatewayError::TenantNotFound(_) => StatusCode::NOT_FOUND,
                GatewayError::TenantInactive(_) => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({ "error": err.client_message() }))).into_response()
        }
    }
}

async fn tenant_bootstrap(Extension(tenant): Extension<TenantContext>) -> impl IntoResponse {
    Json(json!({ "tenantId": tenant.id, "slug": tenant.slug }))
}

pub fn router(state: Arc<GatewayState>) -> Router {
    let tenant_api = Router::new()
        .route("/api/t/{slug}/bootstrap", get(tenant_bootstrap))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_tenant));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(legacy_ws_handler))
        .route("/ws/{slug}", get(tenant_ws_handler))
        .merge(tenant_api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve_with_listener(listener: TcpListener, state: Arc<GatewayState>) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .map_err(|err| GatewayError::Config(format!("server runtime failure: {err}")))
}

pub async fn run(config: GatewayConfig) -> Result<()> {
    let store: Arc<dyn ConversationStore> = match config.store {
        StoreBackend::Postgres => Arc::new(
            PgStore::connect(&config.database_url, config.database_max_connections).await?,
        ),
        StoreBackend::Memory => {
            warn!("using in-memory store, data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| GatewayError::Config(format!("failed to bind {addr}: {err}")))?;

    info!(%addr, "chat gateway listening");
    serve_with_listener(listener, GatewayState::new(config, store)).await
}
