use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{now_iso, ConversationStore};
use crate::error::{GatewayError, Result};
use crate::types::{
    ConversationSession, MessageRole, NewSession, SessionStatus, StoredMessage, TenantContext,
    UsageCounters,
};

#[derive(Default)]
struct MemoryData {
    tenants: HashMap<String, TenantContext>,
    sessions: HashMap<Uuid, ConversationSession>,
    messages: Vec<StoredMessage>,
    usage: HashMap<Uuid, UsageCounters>,
}

/// In-process store for development (`GATEWAY_STORE=memory`) and tests.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<MemoryData>,
    unavailable: AtomicBool,
    tenant_lookups: AtomicUsize,
    human_managed_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_tenant(&self, slug: &str, is_active: bool) -> TenantContext {
        let tenant = TenantContext {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            is_active,
        };
        self.data
            .write()
            .await
            .tenants
            .insert(slug.to_string(), tenant.clone());
        tenant
    }

    pub async fn set_tenant_active(&self, slug: &str, is_active: bool) {
        if let Some(tenant) = self.data.write().await.tenants.get_mut(slug) {
            tenant.is_active = is_active;
        }
    }

    /// Makes every call fail with `GatewayError::Persistence` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn session(&self, session_id: Uuid) -> Option<ConversationSession> {
        self.data.read().await.sessions.get(&session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.data.read().await.sessions.len()
    }

    pub async fn messages(&self, session_id: Uuid) -> Vec<StoredMessage> {
        self.data
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect()
    }

    pub async fn usage(&self, tenant_id: Uuid) -> UsageCounters {
        self.data
            .read()
            .await
            .usage
            .get(&tenant_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn tenant_lookups(&self) -> usize {
        self.tenant_lookups.load(Ordering::SeqCst)
    }

    pub fn human_managed_writes(&self) -> usize {
        self.human_managed_writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Persistence("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<TenantContext>> {
        self.check_available()?;
        self.tenant_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.read().await.tenants.get(slug).cloned())
    }

    async fn create_session(&self, new: NewSession) -> Result<ConversationSession> {
        self.check_available()?;
        let session = ConversationSession {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            status: SessionStatus::Active,
            human_managed: false,
            created_at: now_iso(),
            utm_source: new.utm_source,
            device: new.device,
        };
        let mut data = self.data.write().await;
        data.sessions.insert(session.id, session.clone());
        if let Some(tenant_id) = session.tenant_id {
            data.usage.entry(tenant_id).or_default().sessions += 1;
        }
        Ok(session)
    }

    async fn save_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let tenant_id = data
            .sessions
            .get(&session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?
            .tenant_id;
        let message = StoredMessage {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.to_string(),
            created_at: now_iso(),
        };
        data.messages.push(message.clone());
        if let Some(tenant_id) = tenant_id {
            data.usage.entry(tenant_id).or_default().messages += 1;
        }
        Ok(message)
    }

    async fn update_session_status(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let session = data
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;
        session.status = status;
        Ok(())
    }

    async fn close_if_active(&self, session_id: Uuid) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        match data.sessions.get_mut(&session_id) {
            Some(session) if session.status == SessionStatus::Active => {
                session.status = SessionStatus::Closed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_human_managed(&self, session_id: Uuid, human_managed: bool) -> Result<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let session = data
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;
        session.human_managed = human_managed;
        self.human_managed_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<ConversationSession>> {
        self.check_available()?;
        Ok(self.data.read().await.sessions.get(&session_id).cloned())
    }
}
