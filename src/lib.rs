//! Simple Bank - transactional core
//!
//! # Modules
//!
//! - [`store`] - query layer over PostgreSQL (and an in-memory store for tests)
//! - [`tx`] - transaction executor and the multi-step bank transactions
//! - [`worker`] - task queue: distributor, processor, outbox relay
//! - [`mail`] - email senders
//! - [`db`] - connection pool and schema
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing setup

pub mod config;
pub mod db;
pub mod logging;
pub mod mail;
pub mod store;
pub mod tx;
pub mod util;
pub mod worker;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use store::{MemoryStore, PgStore, Store, StoreError};
pub use tx::{
    CreateUserTxResult, Executor, TransferTxParams, TransferTxResult, VerifyEmailTxParams,
    VerifyEmailTxResult,
};
