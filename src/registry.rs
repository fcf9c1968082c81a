//! Session registry: the in-memory rooms used for fan-out.
//!
//! A room exists only while it has members. All mutation goes through
//! `join`/`leave`, serialized by one async mutex.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{encode, OutboundFrame};
use crate::types::ConnectionKind;

pub type ConnId = usize;

/// Write side of one live socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnId,
    pub kind: ConnectionKind,
    sender: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(id: ConnId, kind: ConnectionKind, sender: mpsc::UnboundedSender<String>) -> Self {
        Self { id, kind, sender }
    }

    /// Queues a frame for this socket. Returns `false` once the socket's
    /// writer has gone away.
    pub fn send(&self, frame: &OutboundFrame) -> bool {
        let Some(payload) = encode(frame) else {
            warn!(conn_id = self.id, "dropping frame that failed to encode");
            return false;
        };
        self.send_raw(payload)
    }

    fn send_raw(&self, payload: String) -> bool {
        self.sender.send(payload).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Widget connections still in the room after this leave.
    pub widgets_remaining: usize,
    /// The room became empty and was deleted.
    pub room_removed: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    rooms: Mutex<HashMap<Uuid, HashMap<ConnId, ConnectionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, session_id: Uuid, conn: &ConnectionHandle) {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(session_id).or_default();
        room.insert(conn.id, conn.clone());
        debug!(
            session_id = %session_id,
            conn_id = conn.id,
            kind = conn.kind.as_str(),
            members = room.len(),
            "joined room"
        );
    }

    pub async fn leave(&self, session_id: Uuid, conn_id: ConnId) -> LeaveOutcome {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get_mut(&session_id) else {
            return LeaveOutcome {
                widgets_remaining: 0,
                room_removed: false,
            };
        };
        room.remove(&conn_id);
        let widgets_remaining = room
            .values()
            .filter(|member| member.kind == ConnectionKind::Widget)
            .count();
        let room_removed = room.is_empty();
        if room_removed {
            rooms.remove(&session_id);
        }
        debug!(session_id = %session_id, conn_id, room_removed, "left room");
        LeaveOutcome {
            widgets_remaining,
            room_removed,
        }
    }

    /// Sends `frame` to every open member except `exclude`. Returns how many
    /// sockets accepted it.
    pub async fn broadcast(
        &self,
        session_id: Uuid,
        frame: &OutboundFrame,
        exclude: Option<ConnId>,
    ) -> usize {
        let Some(payload) = encode(frame) else {
            warn!(session_id = %session_id, "dropping broadcast that failed to encode");
            return 0;
        };

        let recipients = {
            let rooms = self.rooms.lock().await;
            rooms
                .get(&session_id)
                .map(|room| {
                    room.values()
                        .filter(|member| Some(member.id) != exclude)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        recipients
            .iter()
            .filter(|member| member.send_raw(payload.clone()))
            .count()
    }

    pub async fn member_count(&self, session_id: Uuid) -> usize {
        self.rooms
            .lock()
            .await
            .get(&session_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
