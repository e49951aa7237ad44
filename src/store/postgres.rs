//! PostgreSQL Entity Store
//!
//! Row accessors bound to a `sqlx::Transaction`. Balance changes are a single
//! `UPDATE ... SET balance = balance + $1`, so the row lock is taken by the
//! update itself and no application-side read-modify-write ever happens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;

use super::error::StoreError;
use super::models::*;
use super::{Queries, Store, TxHandle};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str = "username, role, hashed_password, full_name, email, is_email_verified, password_changed_at, created_at";
const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expired_at";
const USER_EVENT_COLUMNS: &str = "id, username, kind, created_at, published_at";

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Bound every row-lock wait with `SET LOCAL lock_timeout`
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let mut tx = self.pool.begin().await?;
        if let Some(timeout) = self.lock_timeout {
            let stmt = format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis());
            sqlx::query(&stmt).execute(&mut *tx).await?;
        }
        Ok(PgTx { tx })
    }
}

/// Open PostgreSQL transaction. Dropping it without commit rolls back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TxHandle for PgTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn row_to_user_event(row: &PgRow) -> Result<UserEvent, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = UserEventKind::parse(&kind)
        .ok_or_else(|| StoreError::Database(format!("unknown user event kind: {}", kind)))?;
    Ok(UserEvent {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        kind,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
    })
}

#[async_trait]
impl Queries for PgTx {
    async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let sql = format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let account = sqlx::query_as::<_, Account>(&sql)
            .bind(&arg.owner)
            .bind(arg.balance)
            .bind(&arg.currency)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, StoreError> {
        let sql = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        sqlx::query_as::<_, Account>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }

    async fn add_account_balance(
        &mut self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let sql = format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {}",
            ACCOUNT_COLUMNS
        );
        sqlx::query_as::<_, Account>(&sql)
            .bind(arg.amount)
            .bind(arg.id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {}", arg.id)))
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        let sql = format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {}",
            ENTRY_COLUMNS
        );
        let entry = sqlx::query_as::<_, Entry>(&sql)
            .bind(arg.account_id)
            .bind(arg.amount)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(entry)
    }

    async fn list_entries(&mut self, account_id: i64) -> Result<Vec<Entry>, StoreError> {
        let sql = format!(
            "SELECT {} FROM entries WHERE account_id = $1 ORDER BY id",
            ENTRY_COLUMNS
        );
        let entries = sqlx::query_as::<_, Entry>(&sql)
            .bind(account_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(entries)
    }

    async fn create_transfer(
        &mut self,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        let sql = format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) RETURNING {}",
            TRANSFER_COLUMNS
        );
        let transfer = sqlx::query_as::<_, Transfer>(&sql)
            .bind(arg.from_account_id)
            .bind(arg.to_account_id)
            .bind(arg.amount)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        let sql = format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS);
        sqlx::query_as::<_, Transfer>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("transfer {}", id)))
    }

    async fn list_transfers(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
    ) -> Result<Vec<Transfer>, StoreError> {
        let sql = format!(
            "SELECT {} FROM transfers WHERE from_account_id = $1 AND to_account_id = $2 ORDER BY id",
            TRANSFER_COLUMNS
        );
        let transfers = sqlx::query_as::<_, Transfer>(&sql)
            .bind(from_account_id)
            .bind(to_account_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(transfers)
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> Result<User, StoreError> {
        let sql = format!(
            "INSERT INTO users (username, hashed_password, full_name, email, role) VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            USER_COLUMNS
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(&arg.username)
            .bind(&arg.hashed_password)
            .bind(&arg.full_name)
            .bind(&arg.email)
            .bind(DEFAULT_ROLE)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User, StoreError> {
        let sql = format!("SELECT {} FROM users WHERE username = $1", USER_COLUMNS);
        sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {}", username)))
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> Result<User, StoreError> {
        let sql = format!(
            r#"
            UPDATE users SET
                hashed_password = COALESCE($1, hashed_password),
                password_changed_at = CASE WHEN $1::text IS NULL THEN password_changed_at ELSE NOW() END,
                full_name = COALESCE($2, full_name),
                email = COALESCE($3, email),
                is_email_verified = COALESCE($4, is_email_verified)
            WHERE username = $5
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(arg.hashed_password.as_deref())
            .bind(arg.full_name.as_deref())
            .bind(arg.email.as_deref())
            .bind(arg.is_email_verified)
            .bind(&arg.username)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {}", arg.username)))
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> Result<VerifyEmail, StoreError> {
        let sql = format!(
            "INSERT INTO verify_emails (username, email, secret_code) VALUES ($1, $2, $3) RETURNING {}",
            VERIFY_EMAIL_COLUMNS
        );
        let record = sqlx::query_as::<_, VerifyEmail>(&sql)
            .bind(&arg.username)
            .bind(&arg.email)
            .bind(&arg.secret_code)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(record)
    }

    async fn update_verify_email(
        &mut self,
        arg: UpdateVerifyEmailParams,
    ) -> Result<Option<VerifyEmail>, StoreError> {
        let sql = format!(
            r#"
            UPDATE verify_emails SET is_used = TRUE
            WHERE id = $1 AND secret_code = $2 AND is_used = FALSE AND expired_at > NOW()
            RETURNING {}
            "#,
            VERIFY_EMAIL_COLUMNS
        );
        let record = sqlx::query_as::<_, VerifyEmail>(&sql)
            .bind(arg.id)
            .bind(&arg.secret_code)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(record)
    }

    async fn create_user_event(
        &mut self,
        username: &str,
        kind: UserEventKind,
    ) -> Result<UserEvent, StoreError> {
        let sql = format!(
            "INSERT INTO user_events (username, kind) VALUES ($1, $2) RETURNING {}",
            USER_EVENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(username)
            .bind(kind.as_str())
            .fetch_one(&mut *self.tx)
            .await?;
        row_to_user_event(&row)
    }

    async fn list_pending_user_events(
        &mut self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UserEvent>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM user_events
            WHERE published_at IS NULL AND created_at < $1
            ORDER BY id
            LIMIT $2
            "#,
            USER_EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(created_before)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(row_to_user_event).collect()
    }

    async fn mark_user_event_published(&mut self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE user_events SET published_at = NOW() WHERE id = $1 AND published_at IS NULL",
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
