//! In-memory Entity Store
//!
//! Models the parts of PostgreSQL behaviour the transactions depend on:
//!
//! - **Read committed**: writes are buffered per transaction and become
//!   visible to others only at commit, all at once.
//! - **Row locks**: updates of existing rows take a per-row async lock held
//!   until commit/rollback. A transaction that already holds a row does not
//!   wait for it again. Waits are bounded by `lock_timeout`.
//! - **Unique keys**: username, email and owner+currency are claimed at insert
//!   time, so a concurrent duplicate fails with `Conflict`.
//! - **Foreign keys**: referencing a missing row fails with `NotFound`.
//! - **Sequences**: ids are never reused, even after rollback.
//!
//! Dropping an unfinished [`MemoryTx`] rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::debug;

use super::error::StoreError;
use super::models::*;
use super::{Queries, Store, TxHandle};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Store calls that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    CreateTransfer,
    CreateEntry,
    AddAccountBalance,
    CreateUser,
    UpdateUser,
    CreateVerifyEmail,
    UpdateVerifyEmail,
    CreateUserEvent,
    Commit,
    Rollback,
}

#[derive(Debug)]
struct Fault {
    point: FaultPoint,
    skip: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Account(i64),
    User(String),
    VerifyEmail(i64),
    UserEvent(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum UniqueKey {
    Username(String),
    Email(String),
    OwnerCurrency(String, String),
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    users: BTreeMap<String, User>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    user_events: BTreeMap<i64, UserEvent>,
    /// Committed keys plus keys claimed by open transactions
    unique: HashSet<UniqueKey>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowLock<()>>>>,
    faults: Mutex<Vec<Fault>>,
    lock_timeout: Duration,
    commit_delay: Mutex<Duration>,
    account_lock_requests: Mutex<Vec<i64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut lock(&self.tables))
    }

    fn check_fault(&self, point: FaultPoint) -> Result<(), StoreError> {
        let mut faults = lock(&self.faults);
        if let Some(pos) = faults.iter().position(|f| f.point == point) {
            if faults[pos].skip == 0 {
                faults.remove(pos);
                return Err(StoreError::Database(format!("injected fault at {:?}", point)));
            }
            faults[pos].skip -= 1;
        }
        Ok(())
    }

    fn row_lock(&self, key: &RowKey) -> Arc<RowLock<()>> {
        lock(&self.row_locks)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .clone()
    }
}

/// In-process store, cheap to clone (clones share state)
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                faults: Mutex::new(Vec::new()),
                lock_timeout,
                commit_delay: Mutex::new(Duration::ZERO),
                account_lock_requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fail the `skip + 1`-th upcoming call at `point`
    pub fn inject_fault(&self, point: FaultPoint, skip: usize) {
        lock(&self.shared.faults).push(Fault { point, skip });
    }

    /// Make every commit take at least `delay` before its writes land
    pub fn delay_commit(&self, delay: Duration) {
        *lock(&self.shared.commit_delay) = delay;
    }

    /// Account ids in the order their row locks were requested, across
    /// all transactions. Re-entrant requests are not recorded.
    pub fn account_lock_requests(&self) -> Vec<i64> {
        lock(&self.shared.account_lock_requests).clone()
    }

    // === Committed-state inspection ===

    pub fn account(&self, id: i64) -> Option<Account> {
        self.shared.with_tables(|t| t.accounts.get(&id).cloned())
    }

    pub fn entries(&self, account_id: i64) -> Vec<Entry> {
        self.shared.with_tables(|t| {
            t.entries
                .values()
                .filter(|e| e.account_id == account_id)
                .cloned()
                .collect()
        })
    }

    pub fn entry_count(&self) -> usize {
        self.shared.with_tables(|t| t.entries.len())
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.shared
            .with_tables(|t| t.transfers.values().cloned().collect())
    }

    pub fn user(&self, username: &str) -> Option<User> {
        self.shared.with_tables(|t| t.users.get(username).cloned())
    }

    pub fn verify_emails(&self, username: &str) -> Vec<VerifyEmail> {
        self.shared.with_tables(|t| {
            t.verify_emails
                .values()
                .filter(|v| v.username == username)
                .cloned()
                .collect()
        })
    }

    pub fn user_events(&self) -> Vec<UserEvent> {
        self.shared
            .with_tables(|t| t.user_events.values().cloned().collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        self.shared.check_fault(FaultPoint::Begin)?;
        Ok(MemoryTx {
            shared: self.shared.clone(),
            held: HashMap::new(),
            pending: Pending::default(),
            finished: false,
        })
    }
}

/// Uncommitted writes of one transaction
#[derive(Debug, Default)]
struct Pending {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    users: BTreeMap<String, User>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    user_events: BTreeMap<i64, UserEvent>,
    /// Claimed at insert/update, released on rollback
    claimed: Vec<UniqueKey>,
    /// Freed at commit (e.g. an email replaced by an update)
    freed: Vec<UniqueKey>,
}

pub struct MemoryTx {
    shared: Arc<Shared>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    pending: Pending,
    finished: bool,
}

impl MemoryTx {
    async fn lock_row(&mut self, key: RowKey) -> Result<(), StoreError> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        if let RowKey::Account(id) = &key {
            lock(&self.shared.account_lock_requests).push(*id);
        }
        let row = self.shared.row_lock(&key);
        let guard = tokio::time::timeout(self.shared.lock_timeout, row.lock_owned())
            .await
            .map_err(|_| StoreError::Transient(format!("lock wait timeout on {:?}", key)))?;
        debug!(row = ?key, "row lock acquired");
        self.held.insert(key, guard);
        Ok(())
    }

    fn claim(&mut self, keys: Vec<UniqueKey>) -> Result<(), StoreError> {
        self.shared.with_tables(|t| {
            if let Some(taken) = keys.iter().find(|k| t.unique.contains(*k)) {
                return Err(StoreError::Conflict(format!("{:?}", taken)));
            }
            for key in &keys {
                t.unique.insert(key.clone());
            }
            Ok(())
        })?;
        self.pending.claimed.extend(keys);
        Ok(())
    }

    fn next_id(&self) -> i64 {
        self.shared.with_tables(|t| t.next_id())
    }

    fn visible_account(&self, id: i64) -> Option<Account> {
        self.pending
            .accounts
            .get(&id)
            .cloned()
            .or_else(|| self.shared.with_tables(|t| t.accounts.get(&id).cloned()))
    }

    fn visible_user(&self, username: &str) -> Option<User> {
        self.pending
            .users
            .get(username)
            .cloned()
            .or_else(|| self.shared.with_tables(|t| t.users.get(username).cloned()))
    }

    fn visible_verify_email(&self, id: i64) -> Option<VerifyEmail> {
        self.pending
            .verify_emails
            .get(&id)
            .cloned()
            .or_else(|| self.shared.with_tables(|t| t.verify_emails.get(&id).cloned()))
    }

    fn visible_user_event(&self, id: i64) -> Option<UserEvent> {
        self.pending
            .user_events
            .get(&id)
            .cloned()
            .or_else(|| self.shared.with_tables(|t| t.user_events.get(&id).cloned()))
    }

    fn require_account(&self, id: i64) -> Result<(), StoreError> {
        match self.visible_account(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("account {}", id))),
        }
    }

    fn require_user(&self, username: &str) -> Result<(), StoreError> {
        match self.visible_user(username) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("user {}", username))),
        }
    }

    fn release_claims(&mut self) {
        let claimed = std::mem::take(&mut self.pending.claimed);
        if claimed.is_empty() {
            return;
        }
        self.shared.with_tables(|t| {
            for key in &claimed {
                t.unique.remove(key);
            }
        });
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.release_claims();
        }
    }
}

#[async_trait]
impl TxHandle for MemoryTx {
    async fn commit(mut self) -> Result<(), StoreError> {
        self.shared.check_fault(FaultPoint::Commit)?;
        let delay = *lock(&self.shared.commit_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let pending = std::mem::take(&mut self.pending);
        self.shared.with_tables(|t| {
            t.accounts.extend(pending.accounts);
            t.entries.extend(pending.entries);
            t.transfers.extend(pending.transfers);
            t.users.extend(pending.users);
            t.verify_emails.extend(pending.verify_emails);
            t.user_events.extend(pending.user_events);
            for key in &pending.freed {
                t.unique.remove(key);
            }
        });
        self.finished = true;
        // row locks are released when `self` drops, after the writes are visible
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.shared.check_fault(FaultPoint::Rollback)
    }
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        self.require_user(&arg.owner)?;
        self.claim(vec![UniqueKey::OwnerCurrency(
            arg.owner.clone(),
            arg.currency.clone(),
        )])?;
        let account = Account {
            id: self.next_id(),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.pending.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        self.visible_account(id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        self.shared.check_fault(FaultPoint::AddAccountBalance)?;
        self.require_account(arg.id)?;
        self.lock_row(RowKey::Account(arg.id)).await?;

        let mut account = self
            .visible_account(arg.id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", arg.id)))?;
        account.balance = account.balance.checked_add(arg.amount).ok_or_else(|| {
            StoreError::Validation(format!("balance overflow on account {}", arg.id))
        })?;
        self.pending.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        self.shared.check_fault(FaultPoint::CreateEntry)?;
        self.require_account(arg.account_id)?;
        let entry = Entry {
            id: self.next_id(),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.pending.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
        let mut merged: BTreeMap<i64, Entry> = self.shared.with_tables(|t| {
            t.entries
                .iter()
                .filter(|(_, e)| e.account_id == account_id)
                .map(|(id, e)| (*id, e.clone()))
                .collect()
        });
        merged.extend(
            self.pending
                .entries
                .iter()
                .filter(|(_, e)| e.account_id == account_id)
                .map(|(id, e)| (*id, e.clone())),
        );
        Ok(merged.into_values().collect())
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        self.shared.check_fault(FaultPoint::CreateTransfer)?;
        if arg.amount <= 0 {
            return Err(StoreError::Validation(
                "transfer amount must be positive".to_string(),
            ));
        }
        self.require_account(arg.from_account_id)?;
        self.require_account(arg.to_account_id)?;
        let transfer = Transfer {
            id: self.next_id(),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.pending.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.pending
            .transfers
            .get(&id)
            .cloned()
            .or_else(|| self.shared.with_tables(|t| t.transfers.get(&id).cloned()))
            .ok_or_else(|| StoreError::NotFound(format!("transfer {}", id)))
    }

    async fn list_transfers(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
    ) -> Result<Vec<Transfer>, StoreError> {
        let matches =
            |t: &Transfer| t.from_account_id == from_account_id && t.to_account_id == to_account_id;
        let mut merged: BTreeMap<i64, Transfer> = self.shared.with_tables(|t| {
            t.transfers
                .iter()
                .filter(|(_, tr)| matches(tr))
                .map(|(id, tr)| (*id, tr.clone()))
                .collect()
        });
        merged.extend(
            self.pending
                .transfers
                .iter()
                .filter(|(_, tr)| matches(tr))
                .map(|(id, tr)| (*id, tr.clone())),
        );
        Ok(merged.into_values().collect())
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        self.shared.check_fault(FaultPoint::CreateUser)?;
        self.claim(vec![
            UniqueKey::Username(arg.username.clone()),
            UniqueKey::Email(arg.email.clone()),
        ])?;
        let user = User {
            username: arg.username,
            role: DEFAULT_ROLE.to_string(),
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            is_email_verified: false,
            password_changed_at: never_changed(),
            created_at: Utc::now(),
        };
        self.pending.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        self.visible_user(username)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", username)))
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        self.shared.check_fault(FaultPoint::UpdateUser)?;
        self.require_user(&arg.username)?;
        self.lock_row(RowKey::User(arg.username.clone())).await?;

        let mut user = self
            .visible_user(&arg.username)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", arg.username)))?;
        if let Some(email) = &arg.email
            && *email != user.email
        {
            self.claim(vec![UniqueKey::Email(email.clone())])?;
            self.pending.freed.push(UniqueKey::Email(user.email.clone()));
        }
        arg.apply(&mut user, Utc::now());
        self.pending.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        self.shared.check_fault(FaultPoint::CreateVerifyEmail)?;
        self.require_user(&arg.username)?;
        let now = Utc::now();
        let record = VerifyEmail {
            id: self.next_id(),
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: now,
            expired_at: verify_email_expiry(now),
        };
        self.pending.verify_emails.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<Option<VerifyEmail>, StoreError> {
        self.shared.check_fault(FaultPoint::UpdateVerifyEmail)?;
        if self.visible_verify_email(arg.id).is_none() {
            return Ok(None);
        }
        self.lock_row(RowKey::VerifyEmail(arg.id)).await?;

        let Some(mut record) = self.visible_verify_email(arg.id) else {
            return Ok(None);
        };
        if record.secret_code != arg.secret_code || !record.is_consumable(Utc::now()) {
            return Ok(None);
        }
        record.is_used = true;
        self.pending.verify_emails.insert(record.id, record.clone());
        Ok(Some(record))
    }

    async fn create_user_event(
        &mut self,
        username: &str,
        kind: UserEventKind,
    ) -> Result<UserEvent, StoreError> {
        self.shared.check_fault(FaultPoint::CreateUserEvent)?;
        self.require_user(username)?;
        let event = UserEvent {
            id: self.next_id(),
            username: username.to_string(),
            kind,
            created_at: Utc::now(),
            published_at: None,
        };
        self.pending.user_events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn list_pending_user_events(
        &mut self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UserEvent>, StoreError> {
        let mut merged: BTreeMap<i64, UserEvent> = self
            .shared
            .with_tables(|t| t.user_events.clone());
        merged.extend(
            self.pending
                .user_events
                .iter()
                .map(|(id, e)| (*id, e.clone())),
        );
        Ok(merged
            .into_values()
            .filter(|e| e.published_at.is_none() && e.created_at < created_before)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn mark_user_event_published(&mut self, id: i64) -> Result<bool, StoreError> {
        if self.visible_user_event(id).is_none() {
            return Ok(false);
        }
        self.lock_row(RowKey::UserEvent(id)).await?;

        let Some(mut event) = self.visible_user_event(id) else {
            return Ok(false);
        };
        if event.published_at.is_some() {
            return Ok(false);
        }
        event.published_at = Some(Utc::now());
        self.pending.user_events.insert(id, event);
        Ok(true)
    }
}
