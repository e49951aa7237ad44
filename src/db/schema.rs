//! Schema DDL
//!
//! Every statement is idempotent so `migrate` can run on each start-up.

use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        username            VARCHAR PRIMARY KEY,
        role                VARCHAR NOT NULL DEFAULT 'depositor',
        hashed_password     VARCHAR NOT NULL,
        full_name           VARCHAR NOT NULL,
        email               VARCHAR UNIQUE NOT NULL,
        is_email_verified   BOOLEAN NOT NULL DEFAULT FALSE,
        password_changed_at TIMESTAMPTZ NOT NULL DEFAULT '0001-01-01 00:00:00Z',
        created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id         BIGSERIAL PRIMARY KEY,
        owner      VARCHAR NOT NULL REFERENCES users (username),
        balance    BIGINT NOT NULL,
        currency   VARCHAR NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT owner_currency_key UNIQUE (owner, currency)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entries (
        id         BIGSERIAL PRIMARY KEY,
        account_id BIGINT NOT NULL REFERENCES accounts (id),
        amount     BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id)",
    r#"
    CREATE TABLE IF NOT EXISTS transfers (
        id              BIGSERIAL PRIMARY KEY,
        from_account_id BIGINT NOT NULL REFERENCES accounts (id),
        to_account_id   BIGINT NOT NULL REFERENCES accounts (id),
        amount          BIGINT NOT NULL CHECK (amount > 0),
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS transfers_from_to_idx ON transfers (from_account_id, to_account_id)",
    r#"
    CREATE TABLE IF NOT EXISTS verify_emails (
        id          BIGSERIAL PRIMARY KEY,
        username    VARCHAR NOT NULL REFERENCES users (username),
        email       VARCHAR NOT NULL,
        secret_code VARCHAR NOT NULL,
        is_used     BOOLEAN NOT NULL DEFAULT FALSE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        expired_at  TIMESTAMPTZ NOT NULL DEFAULT (NOW() + INTERVAL '15 minutes')
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_events (
        id           BIGSERIAL PRIMARY KEY,
        username     VARCHAR NOT NULL REFERENCES users (username),
        kind         VARCHAR NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        published_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS user_events_pending_idx ON user_events (created_at) WHERE published_at IS NULL",
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id           VARCHAR PRIMARY KEY,
        task_type    VARCHAR NOT NULL,
        payload      BYTEA NOT NULL,
        queue        VARCHAR NOT NULL,
        state        SMALLINT NOT NULL,
        retried      INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        process_at   TIMESTAMPTZ NOT NULL,
        lease_until  TIMESTAMPTZ,
        claim_seq    BIGINT NOT NULL DEFAULT 0,
        last_error   TEXT,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "ALTER TABLE tasks ADD COLUMN IF NOT EXISTS claim_seq BIGINT NOT NULL DEFAULT 0",
    "CREATE INDEX IF NOT EXISTS tasks_ready_idx ON tasks (queue, state, process_at)",
];

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for stmt in STATEMENTS {
        sqlx::query(stmt).execute(pool).await?;
    }
    tracing::info!(statements = STATEMENTS.len(), "Schema migrated");
    Ok(())
}
