//! Business transactions
//!
//! Every operation here is a unit of work handed to [`Executor::exec`]:
//!
//! - [`Executor::transfer_tx`] - funds transfer with lower-id-first locking
//! - [`Executor::create_user_tx`] - user + outbox event, hook after commit
//! - [`Executor::verify_email_tx`] - single-use code consumption
//!
//! Retrying a transient failure is the caller's decision; the executor never
//! retries on its own.

pub mod create_user;
pub mod executor;
pub mod transfer;
pub mod verify_email;

#[cfg(test)]
mod integration_tests;

pub use create_user::CreateUserTxResult;
pub use executor::Executor;
pub use transfer::{TransferTxParams, TransferTxResult};
pub use verify_email::{VerifyEmailTxParams, VerifyEmailTxResult};
