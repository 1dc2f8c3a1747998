//! Idempotency cache
//!
//! Key -> cached handler outcome with TTL. The cache only serializes
//! individual key operations; the read-or-insert-then-execute dance is
//! coordinated by the idempotency pipeline stage.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mc_common::{IdempotencyResponse, IdempotencyStatus};
use parking_lot::Mutex;

use crate::Result;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Fetch a cached response; absent or expired keys return `None`.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyResponse>>;

    async fn store_success(
        &self,
        key: &str,
        data: Option<serde_json::Value>,
        ttl: Duration,
    ) -> Result<()>;

    async fn store_failure(
        &self,
        key: &str,
        failure_kind: &str,
        failure_message: &str,
        ttl: Duration,
    ) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Drop expired entries. Returns the number removed.
    async fn cleanup_expired(&self) -> Result<u64>;
}

/// Default in-process cache.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    responses: Mutex<HashMap<String, IdempotencyResponse>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36500))
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyResponse>> {
        let now = Utc::now();
        let mut responses = self.responses.lock();
        match responses.get(key) {
            Some(response) if response.is_expired(now) => {
                responses.remove(key);
                Ok(None)
            }
            Some(response) => Ok(Some(response.clone())),
            None => Ok(None),
        }
    }

    async fn store_success(
        &self,
        key: &str,
        data: Option<serde_json::Value>,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        self.responses.lock().insert(
            key.to_string(),
            IdempotencyResponse {
                key: key.to_string(),
                stored_at: now,
                expires_at: now + to_chrono(ttl),
                status: IdempotencyStatus::Success,
                success_data: data,
                failure_kind: None,
                failure_message: None,
            },
        );
        Ok(())
    }

    async fn store_failure(
        &self,
        key: &str,
        failure_kind: &str,
        failure_message: &str,
        ttl: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        self.responses.lock().insert(
            key.to_string(),
            IdempotencyResponse {
                key: key.to_string(),
                stored_at: now,
                expires_at: now + to_chrono(ttl),
                status: IdempotencyStatus::Failure,
                success_data: None,
                failure_kind: Some(failure_kind.to_string()),
                failure_message: Some(failure_message.to_string()),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut responses = self.responses.lock();
        let before = responses.len();
        responses.retain(|_, response| !response.is_expired(now));
        Ok((before - responses.len()) as u64)
    }
}
