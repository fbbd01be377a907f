//! Shared Redis connection.

use crate::config::RedisConfig;
use redis::{aio::ConnectionManager, Client, RedisError};
use thiserror::Error;

/// Errors that can occur while connecting to Redis.
#[derive(Debug, Error)]
pub enum RedisClientError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("connection timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// A cheaply cloneable Redis connection plus the key namespace it writes to.
#[derive(Clone)]
pub struct RedisClient {
    pub(crate) conn: ConnectionManager,
    pub(crate) config: RedisConfig,
}

impl RedisClient {
    pub async fn new(config: RedisConfig) -> Result<Self, RedisClientError> {
        let client = Client::open(config.build_connection_url())?;
        let conn = tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| RedisClientError::Timeout(config.connection_timeout))??;
        Ok(Self { conn, config })
    }

    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }

    pub fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix(), key)
    }
}
