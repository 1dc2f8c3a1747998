//! Storage contracts and the in-memory backend
//!
//! Every reliable-delivery subsystem talks to storage through the traits
//! in [`contracts`]; any conformant backend is sufficient. The in-memory
//! implementation in [`memory`] is the default: per-collection locks with
//! short critical sections, lease bookkeeping, and TTL expiry on access.
//! The idempotency cache lives in [`idempotency`].

pub mod contracts;
pub mod idempotency;
pub mod memory;

pub use contracts::{
    DeadLetterStore, InboxClaim, InboxStore, MessageQuery, MessageStore, OutboxStore,
    QueryOrder, QueueStore, Storage, StorageTransaction,
};
pub use idempotency::{IdempotencyStore, MemoryIdempotencyStore};
pub use memory::MemoryStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Lease expired or not held")]
    LeaseExpired,

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
