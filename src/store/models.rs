//! Row models and insert/update parameters for the entity store

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Role assigned to users created through onboarding
pub const DEFAULT_ROLE: &str = "depositor";

/// How long a verification code stays consumable
pub const VERIFY_EMAIL_TTL_MINUTES: i64 = 15;

/// `password_changed_at` for users who never changed their password
pub fn never_changed() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    /// Minor currency units
    pub balance: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only ledger line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    /// Signed balance change
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    /// Always positive
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub username: String,
    pub role: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub is_email_verified: bool,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VerifyEmail {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl VerifyEmail {
    /// Whether the code can still be consumed at `now`
    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && self.expired_at > now
    }
}

/// Outbox event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserEventKind {
    UserCreated,
}

impl UserEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserEventKind::UserCreated => "user_created",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_created" => Some(UserEventKind::UserCreated),
            _ => None,
        }
    }
}

/// Outbox row written in the same transaction as the user it announces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    pub id: i64,
    pub username: String,
    pub kind: UserEventKind,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddAccountBalanceParams {
    pub id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
}

/// Partial user update; `None` leaves the column untouched.
/// Setting `hashed_password` also stamps `password_changed_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateUserParams {
    pub username: String,
    pub hashed_password: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub is_email_verified: Option<bool>,
}

impl UpdateUserParams {
    pub fn apply(&self, user: &mut User, now: DateTime<Utc>) {
        if let Some(hashed) = &self.hashed_password {
            user.hashed_password = hashed.clone();
            user.password_changed_at = now;
        }
        if let Some(full_name) = &self.full_name {
            user.full_name = full_name.clone();
        }
        if let Some(email) = &self.email {
            user.email = email.clone();
        }
        if let Some(verified) = self.is_email_verified {
            user.is_email_verified = verified;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVerifyEmailParams {
    pub username: String,
    pub email: String,
    pub secret_code: String,
}

/// Conditional consume of a verification code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateVerifyEmailParams {
    pub id: i64,
    pub secret_code: String,
}

pub fn verify_email_expiry(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::minutes(VERIFY_EMAIL_TTL_MINUTES)
}
