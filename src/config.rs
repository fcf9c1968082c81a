use std::{env, time::Duration};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub store: StoreBackend,
    pub database_url: String,
    pub database_max_connections: u32,
    pub tenant_cache_ttl: Duration,
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            store: StoreBackend::Memory,
            database_url: String::new(),
            database_max_connections: 10,
            tenant_cache_ttl: Duration::from_secs(60),
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Reads `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = parse_or(get("PORT"), "PORT", 4000u16)?;
        let store = match get("GATEWAY_STORE").as_deref().map(str::trim) {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(GatewayError::Config(format!(
                    "GATEWAY_STORE must be `postgres` or `memory`, got `{other}`"
                )))
            }
        };
        let database_max_connections =
            parse_or(get("DATABASE_MAX_CONNECTIONS"), "DATABASE_MAX_CONNECTIONS", 10u32)?;
        let ttl_secs = parse_or(get("TENANT_CACHE_TTL_SECS"), "TENANT_CACHE_TTL_SECS", 60u64)?;
        let log_level = get("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            port,
            store,
            database_url: resolve_database_url(&get),
            database_max_connections,
            tenant_cache_ttl: Duration::from_secs(ttl_secs),
            log_level,
        })
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| GatewayError::Config(format!("{key} has invalid value `{value}`"))),
    }
}

fn resolve_database_url(get: &dyn Fn(&str) -> Option<String>) -> String {
    if let Some(url) = get("DATABASE_URL") {
        return url;
    }
    let pick = |primary: &str, alias: &str, fallback: &str| {
        get(primary)
            .or_else(|| get(alias))
            .unwrap_or_else(|| fallback.to_string())
    };
    let host = pick("POSTGRES_HOST", "PGHOST", "localhost");
    let port = pick("POSTGRES_PORT", "PGPORT", "5432");
    let user = pick("POSTGRES_USER", "PGUSER", "postgres");
    let password = pick("POSTGRES_PASSWORD", "PGPASSWORD", "postgres");
    let db = pick("POSTGRES_DB", "PGDATABASE", "chat_gateway");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
