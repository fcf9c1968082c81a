//! Persistence collaborator used by the gateway.
//!
//! The gateway only triggers writes through this trait; it never reads or
//! reconciles usage counters.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    ConversationSession, MessageRole, NewSession, SessionStatus, StoredMessage, TenantContext,
};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<TenantContext>>;

    /// Creates an `active` session. Bumps the tenant's `sessions` usage when
    /// `tenant_id` is set.
    async fn create_session(&self, new: NewSession) -> Result<ConversationSession>;

    /// Appends a message and bumps the owning tenant's `messages` usage.
    async fn save_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage>;

    async fn update_session_status(&self, session_id: Uuid, status: SessionStatus) -> Result<()>;

    /// Moves the session to `closed` only if it is still `active`.
    /// Returns `true` when the stored status changed.
    async fn close_if_active(&self, session_id: Uuid) -> Result<bool>;

    async fn set_human_managed(&self, session_id: Uuid, human_managed: bool) -> Result<()>;

    async fn find_session(&self, session_id: Uuid) -> Result<Option<ConversationSession>>;
}

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
