//! Entity Store
//!
//! Typed single-row accessors for accounts, entries, transfers, users,
//! verification codes and the user outbox. Every accessor runs against an
//! open transaction handle; the store itself has no notion of business
//! transactions, see [`crate::tx`] for those.
//!
//! # Backends
//!
//! - [`PgStore`] - PostgreSQL via sqlx (production)
//! - [`MemoryStore`] - in-process store with row locks and read-committed
//!   visibility (tests, local runs)

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::StoreError;
pub use memory::{FaultPoint, MemoryStore};
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry, Transfer,
    UpdateUserParams, UpdateVerifyEmailParams, User, UserEvent, UserEventKind, VerifyEmail,
};
pub use postgres::{PgStore, PgTx};

/// Transaction-scoped accessor
///
/// Mutating operations on existing rows (`add_account_balance`,
/// `update_user`, `update_verify_email`) take the row lock and hold it until
/// the transaction ends.
#[async_trait]
pub trait Queries: Send {
    // === Accounts ===
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError>;

    /// Additive balance update applied by the store, never read-then-write
    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError>;

    // === Ledger ===
    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError>;

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError>;

    async fn create_transfer(&mut self, arg: CreateTransferParams)
    -> Result<Transfer, StoreError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;

    /// Transfers from `from_account_id` to `to_account_id`, oldest first
    async fn list_transfers(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
    ) -> Result<Vec<Transfer>, StoreError>;

    // === Users ===
    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError>;

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError>;

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError>;

    // === Email verification ===
    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError>;

    /// Marks the record used if it exists, matches the code, is unused and
    /// has not expired. Returns `None` when nothing matched.
    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<Option<VerifyEmail>, StoreError>;

    // === Outbox ===
    async fn create_user_event(
        &mut self,
        username: &str,
        kind: UserEventKind,
    ) -> Result<UserEvent, StoreError>;

    async fn list_pending_user_events(
        &mut self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UserEvent>, StoreError>;

    /// Returns false if the event was already published
    async fn mark_user_event_published(&mut self, id: i64) -> Result<bool, StoreError>;
}

/// An open transaction
#[async_trait]
pub trait TxHandle: Queries + Send + 'static {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// A store that can open transactions
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: TxHandle;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}
