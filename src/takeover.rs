//! Bot-to-human handover.
//!
//! `bot-managed -> human-managed` is one-way. Repeating the takeover rewrites
//! the same flag and re-broadcasts; it never errors.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::effects::EffectRunner;
use crate::protocol::OutboundFrame;
use crate::registry::SessionRegistry;
use crate::store::ConversationStore;

pub struct TakeoverController {
    store: Arc<dyn ConversationStore>,
    registry: Arc<SessionRegistry>,
    effects: EffectRunner,
}

impl TakeoverController {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: Arc<SessionRegistry>,
        effects: EffectRunner,
    ) -> Self {
        Self {
            store,
            registry,
            effects,
        }
    }

    /// Persists `humanManaged=true`, then tells every room member, the
    /// triggering admin included. Returns `None` if the write failed, in
    /// which case nothing is broadcast.
    pub async fn take_over(&self, session_id: Uuid) -> Option<usize> {
        let store = self.store.clone();
        self.effects
            .run("set_human_managed", Some(session_id), async move {
                store.set_human_managed(session_id, true).await
            })
            .await?;

        let delivered = self
            .registry
            .broadcast(session_id, &OutboundFrame::TakeoverActive, None)
            .await;
        info!(session_id = %session_id, delivered, "session taken over by operator");
        Some(delivered)
    }
}
