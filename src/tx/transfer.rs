//! Funds transfer between two accounts
//!
//! # Lock Ordering
//!
//! Both balance updates take a row lock. The account with the lower id is
//! always updated first, whatever the direction of the transfer, so two
//! transfers over the same pair of accounts request their locks in the same
//! order and cannot wait on each other in a cycle.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::executor::Executor;
use crate::store::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Entry, Queries,
    Store, StoreError, Transfer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

impl<S: Store> Executor<S> {
    /// Move `amount` from one account to another with a full audit trail.
    ///
    /// Currency and ownership checks belong to the caller. A self-transfer
    /// records the transfer and both entries and leaves the balance unchanged.
    pub async fn transfer_tx(&self, arg: TransferTxParams) -> Result<TransferTxResult, StoreError> {
        if arg.amount <= 0 {
            return Err(StoreError::Validation(format!(
                "transfer amount must be positive, got {}",
                arg.amount
            )));
        }

        let result = self
            .exec(move |tx| {
                Box::pin(async move {
                    let transfer = tx
                        .create_transfer(CreateTransferParams {
                            from_account_id: arg.from_account_id,
                            to_account_id: arg.to_account_id,
                            amount: arg.amount,
                        })
                        .await?;

                    let from_entry = tx
                        .create_entry(CreateEntryParams {
                            account_id: arg.from_account_id,
                            amount: -arg.amount,
                        })
                        .await?;

                    let to_entry = tx
                        .create_entry(CreateEntryParams {
                            account_id: arg.to_account_id,
                            amount: arg.amount,
                        })
                        .await?;

                    let (from_account, to_account) =
                        if arg.from_account_id == arg.to_account_id {
                            // one row, locked once
                            let account = tx
                                .add_account_balance(AddAccountBalanceParams {
                                    id: arg.from_account_id,
                                    amount: 0,
                                })
                                .await?;
                            (account.clone(), account)
                        } else if arg.from_account_id < arg.to_account_id {
                            add_money(
                                tx,
                                arg.from_account_id,
                                -arg.amount,
                                arg.to_account_id,
                                arg.amount,
                            )
                            .await?
                        } else {
                            let (to_account, from_account) = add_money(
                                tx,
                                arg.to_account_id,
                                arg.amount,
                                arg.from_account_id,
                                -arg.amount,
                            )
                            .await?;
                            (from_account, to_account)
                        };

                    Ok(TransferTxResult {
                        transfer,
                        from_account,
                        to_account,
                        from_entry,
                        to_entry,
                    })
                })
            })
            .await?;

        debug!(
            transfer_id = result.transfer.id,
            from = arg.from_account_id,
            to = arg.to_account_id,
            amount = arg.amount,
            "Transfer committed"
        );
        Ok(result)
    }
}

/// Apply two deltas in the given order. Callers pass the lower id first.
async fn add_money<Q: Queries + ?Sized>(
    q: &mut Q,
    account_id1: i64,
    amount1: i64,
    account_id2: i64,
    amount2: i64,
) -> Result<(Account, Account), StoreError> {
    let account1 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id1,
            amount: amount1,
        })
        .await?;
    let account2 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id2,
            amount: amount2,
        })
        .await?;
    Ok((account1, account2))
}
