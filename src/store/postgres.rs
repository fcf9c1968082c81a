use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use super::{now_iso, ConversationStore};
use crate::error::{GatewayError, Result};
use crate::types::{
    ConversationSession, MessageRole, NewSession, SessionStatus, StoredMessage, TenantContext,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and applies the bundled migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(max_connections, "postgres store ready");
        Ok(Self::new(pool))
    }
}

fn parse_uuid(raw: &str, column: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| GatewayError::Persistence(format!("invalid uuid in {column}: {raw}")))
}

fn parse_session_row(row: &PgRow) -> Result<ConversationSession> {
    let id: String = row.try_get("id")?;
    let tenant_id: Option<String> = row.try_get("tenant_id")?;
    let status: String = row.try_get("status")?;
    Ok(ConversationSession {
        id: parse_uuid(&id, "sessions.id")?,
        tenant_id: tenant_id
            .as_deref()
            .map(|raw| parse_uuid(raw, "sessions.tenant_id"))
            .transpose()?,
        status: SessionStatus::parse(&status).ok_or_else(|| {
            GatewayError::Persistence(format!("unknown session status: {status}"))
        })?,
        human_managed: row.try_get("human_managed")?,
        created_at: row.try_get("created_at")?,
        utm_source: row.try_get("utm_source")?,
        device: row.try_get("device")?,
    })
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<TenantContext>> {
        let row = sqlx::query("SELECT id, slug, is_active FROM tenants WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.try_get("id")?;
        Ok(Some(TenantContext {
            id: parse_uuid(&id, "tenants.id")?,
            slug: row.try_get("slug")?,
            is_active: row.try_get("is_active")?,
        }))
    }

    async fn create_session(&self, new: NewSession) -> Result<ConversationSession> {
        let session = ConversationSession {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            status: SessionStatus::Active,
            human_managed: false,
            created_at: now_iso(),
            utm_source: new.utm_source,
            device: new.device,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sessions (id, tenant_id, status, human_managed, created_at, utm_source, device)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.tenant_id.map(|id| id.to_string()))
        .bind(session.status.as_str())
        .bind(session.human_managed)
        .bind(&session.created_at)
        .bind(&session.utm_source)
        .bind(&session.device)
        .execute(&mut *tx)
        .await?;

        if let Some(tenant_id) = session.tenant_id {
            sqlx::query(
                r#"
                INSERT INTO tenant_usage (tenant_id, sessions, messages) VALUES ($1, 1, 0)
                ON CONFLICT (tenant_id) DO UPDATE SET sessions = tenant_usage.sessions + 1
                "#,
            )
            .bind(tenant_id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(session)
    }

    async fn save_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<StoredMessage> {
        let message = StoredMessage {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.to_string(),
            created_at: now_iso(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, session_id, role, content, created_at)
            VALUES ($1,$2,$3,$4,$5)
            "#,
        )
        .bind(message.id.to_string())
        .bind(session_id.to_string())
        .bind(role.as_str())
        .bind(&message.content)
        .bind(&message.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO tenant_usage (tenant_id, sessions, messages)
            SELECT tenant_id, 0, 1 FROM sessions WHERE id = $1 AND tenant_id IS NOT NULL
            ON CONFLICT (tenant_id) DO UPDATE SET messages = tenant_usage.messages + 1
            "#,
        )
        .bind(session_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(message)
    }

    async fn update_session_status(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        let done = sqlx::query("UPDATE sessions SET status = $2 WHERE id = $1")
            .bind(session_id.to_string())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn close_if_active(&self, session_id: Uuid) -> Result<bool> {
        let done =
            sqlx::query("UPDATE sessions SET status = 'closed' WHERE id = $1 AND status = 'active'")
                .bind(session_id.to_string())
                .execute(&self.pool)
                .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn set_human_managed(&self, session_id: Uuid, human_managed: bool) -> Result<()> {
        let done = sqlx::query("UPDATE sessions SET human_managed = $2 WHERE id = $1")
            .bind(session_id.to_string())
            .bind(human_managed)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<ConversationSession>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, status, human_managed, created_at, utm_source, device \
             FROM sessions WHERE id = $1",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_session_row).transpose()
    }
}
