use async_trait::async_trait;
use redis::{
    AsyncCommands,
    aio::ConnectionManager,
};
use thiserror::Error;

use crate::audit::AuditDocument;

#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode audit document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

/// Best-effort external destination for audit documents.
#[async_trait]
pub trait AuditStore: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn insert(&self, document: AuditDocument) -> Result<(), AuditStoreError>;
}

/// Appends each document as JSON to a Redis list. Retention belongs to whoever
/// consumes the list.
pub struct RedisAuditStore {
    manager: ConnectionManager,
    key: String,
}

impl RedisAuditStore {
    pub async fn connect(url: &str, key: String) -> Result<Self, AuditStoreError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager, key })
    }
}

#[async_trait]
impl AuditStore for RedisAuditStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn insert(&self, document: AuditDocument) -> Result<(), AuditStoreError> {
        let payload = serde_json::to_string(&document)?;
        let mut conn = self.manager.clone();
        let _: i64 = conn.rpush(&self.key, payload).await?;
        Ok(())
    }
}
