//! Message relay: handshake results, per-frame dispatch and disconnect
//! handling for one connection at a time.
//!
//! Frames from one connection are handled strictly in order because the
//! socket loop awaits `handle_text` before reading the next frame. There is
//! no ordering across connections.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::effects::EffectRunner;
use crate::error::{GatewayError, Result};
use crate::protocol::{decode, InboundFrame, OutboundFrame};
use crate::registry::{ConnectionHandle, SessionRegistry};
use crate::store::ConversationStore;
use crate::takeover::TakeoverController;
use crate::types::{ConnectionKind, MessageRole, NewSession, TenantContext};

/// Per-socket state owned by the connection loop.
#[derive(Debug)]
pub struct Connection {
    pub handle: ConnectionHandle,
    pub tenant_id: Option<Uuid>,
    /// Room this socket currently belongs to. Admins start without one.
    pub session_id: Option<Uuid>,
}

impl Connection {
    pub fn kind(&self) -> ConnectionKind {
        self.handle.kind
    }

    fn reply(&self, frame: &OutboundFrame) {
        if !self.handle.send(frame) {
            debug!(conn_id = self.handle.id, "reply not queued");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WidgetOrigin {
    pub utm_source: Option<String>,
    pub device: Option<String>,
}

pub struct Relay {
    store: Arc<dyn ConversationStore>,
    registry: Arc<SessionRegistry>,
    takeover: TakeoverController,
    effects: EffectRunner,
}

impl Relay {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: Arc<SessionRegistry>,
        effects: EffectRunner,
    ) -> Self {
        let takeover = TakeoverController::new(store.clone(), registry.clone(), effects.clone());
        Self {
            store,
            registry,
            takeover,
            effects,
        }
    }

    pub fn effects(&self) -> &EffectRunner {
        &self.effects
    }

    /// Widget handshake: create a session, join its room, announce it.
    /// `tenant` is `None` on the legacy entry point.
    pub async fn open_widget(
        &self,
        handle: ConnectionHandle,
        tenant: Option<&TenantContext>,
        origin: WidgetOrigin,
    ) -> Result<Connection> {
        let tenant_id = tenant.map(|t| t.id);
        let store = self.store.clone();
        let new = NewSession {
            utm_source: origin.utm_source,
            device: origin.device,
            tenant_id,
        };
        let session = self
            .effects
            .run("create_session", None, async move {
                store.create_session(new).await
            })
            .await
            .ok_or_else(|| GatewayError::Persistence("could not create session".to_string()))?;

        self.registry.join(session.id, &handle).await;
        let conn = Connection {
            handle,
            tenant_id,
            session_id: Some(session.id),
        };
        conn.reply(&OutboundFrame::SessionCreated {
            session_id: session.id,
            tenant_id,
        });
        info!(
            conn_id = conn.handle.id,
            session_id = %session.id,
            tenant_id = ?tenant_id,
            "widget session created"
        );
        Ok(conn)
    }

    /// Admin handshake: no session is created until `admin_join`.
    pub fn open_admin(&self, handle: ConnectionHandle, tenant: &TenantContext) -> Connection {
        let conn = Connection {
            handle,
            tenant_id: Some(tenant.id),
            session_id: None,
        };
        conn.reply(&OutboundFrame::AdminReady);
        info!(conn_id = conn.handle.id, tenant = %tenant.slug, "admin observer connected");
        conn
    }

    /// Decodes and dispatches one text frame. Never fails: bad frames are
    /// logged and dropped.
    pub async fn handle_text(&self, conn: &mut Connection, text: &str) {
        match decode(text) {
            Ok(frame) => self.dispatch(conn, frame).await,
            Err(err) => {
                warn!(conn_id = conn.handle.id, error = %err, "dropping frame");
            }
        }
    }

    pub async fn dispatch(&self, conn: &mut Connection, frame: InboundFrame) {
        let kind = frame.kind();
        let admin_only = matches!(
            frame,
            InboundFrame::AdminJoin { .. }
                | InboundFrame::ManagerTakeover
                | InboundFrame::ManagerMessage { .. }
        );
        if admin_only && conn.kind() != ConnectionKind::Admin {
            warn!(conn_id = conn.handle.id, frame = kind, "admin frame from widget connection dropped");
            return;
        }

        if let InboundFrame::AdminJoin { session_id } = frame {
            self.admin_join(conn, &session_id).await;
            return;
        }

        let Some(session_id) = conn.session_id else {
            debug!(conn_id = conn.handle.id, frame = kind, "no session yet, frame dropped");
            return;
        };

        match frame {
            InboundFrame::Message { role, content, id } => {
                if self.persist(session_id, role, content.clone()).await {
                    conn.reply(&OutboundFrame::Ack {
                        message_id: id.clone(),
                    });
                    if role == MessageRole::User {
                        self.registry
                            .broadcast(
                                session_id,
                                &OutboundFrame::Message { role, content, id },
                                Some(conn.handle.id),
                            )
                            .await;
                    }
                }
            }
            InboundFrame::ManagerMessage { content, id } => {
                let role = MessageRole::Manager;
                if self.persist(session_id, role, content.clone()).await {
                    self.registry
                        .broadcast(
                            session_id,
                            &OutboundFrame::Message {
                                role,
                                content,
                                id: id.clone(),
                            },
                            Some(conn.handle.id),
                        )
                        .await;
                    conn.reply(&OutboundFrame::Ack { message_id: id });
                }
            }
            InboundFrame::SessionClose => {
                if self.close_if_active(session_id).await {
                    info!(session_id = %session_id, "session closed by client");
                }
            }
            InboundFrame::ManagerTakeover => {
                self.takeover.take_over(session_id).await;
            }
            InboundFrame::AdminJoin { .. } => {}
        }
    }

    async fn admin_join(&self, conn: &mut Connection, raw_session_id: &str) {
        let Ok(session_id) = Uuid::parse_str(raw_session_id) else {
            warn!(
                conn_id = conn.handle.id,
                error = %GatewayError::MalformedFrame(format!("sessionId `{raw_session_id}` is not a uuid")),
                "dropping frame"
            );
            return;
        };

        let store = self.store.clone();
        let Some(found) = self
            .effects
            .run("find_session", Some(session_id), async move {
                store.find_session(session_id).await
            })
            .await
        else {
            return;
        };
        match found {
            Some(session) if session.tenant_id.is_some() && session.tenant_id == conn.tenant_id => {}
            Some(_) => {
                warn!(conn_id = conn.handle.id, session_id = %session_id, "admin_join across tenants refused");
                return;
            }
            None => {
                warn!(
                    conn_id = conn.handle.id,
                    error = %GatewayError::SessionNotFound(session_id.to_string()),
                    "admin_join ignored"
                );
                return;
            }
        }

        if let Some(previous) = conn.session_id.replace(session_id) {
            if previous != session_id {
                self.registry.leave(previous, conn.handle.id).await;
            }
        }
        self.registry.join(session_id, &conn.handle).await;
        conn.reply(&OutboundFrame::AdminJoined { session_id });
        info!(conn_id = conn.handle.id, session_id = %session_id, "admin joined session");
    }

    /// Returns `true` only when the message was stored; callers ack on that.
    async fn persist(&self, session_id: Uuid, role: MessageRole, content: String) -> bool {
        let store = self.store.clone();
        self.effects
            .run("save_message", Some(session_id), async move {
                store.save_message(session_id, role, &content).await
            })
            .await
            .is_some()
    }

    async fn close_if_active(&self, session_id: Uuid) -> bool {
        let store = self.store.clone();
        self.effects
            .run("close_session", Some(session_id), async move {
                store.close_if_active(session_id).await
            })
            .await
            .unwrap_or(false)
    }

    /// Socket is gone: leave the room, and close the session when the last
    /// widget leaves. Admin disconnects never change session status.
    pub async fn disconnect(&self, conn: &Connection) {
        let Some(session_id) = conn.session_id else {
            debug!(conn_id = conn.handle.id, "connection closed before joining a room");
            return;
        };
        let outcome = self.registry.leave(session_id, conn.handle.id).await;
        if conn.kind() == ConnectionKind::Widget && outcome.widgets_remaining == 0 {
            let closed = self.close_if_active(session_id).await;
            debug!(session_id = %session_id, closed, "last widget disconnected");
        }
    }
}
