//! Integration Tests for the business transactions
//!
//! Run against `MemoryStore`, which models row locks and read-committed
//! visibility, so the concurrency properties are checked without a database.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::*;
use crate::store::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateUserParams,
    CreateVerifyEmailParams, FaultPoint, MemoryStore, Queries, Store, StoreError, TxHandle,
    VerifyEmail,
};

struct TestHarness {
    store: MemoryStore,
    executor: Executor<MemoryStore>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    fn with_store(store: MemoryStore) -> Self {
        let executor = Executor::new(store.clone());
        Self { store, executor }
    }

    async fn seed_account(&self, owner: &str, balance: i64) -> Account {
        let owner = owner.to_string();
        self.executor
            .exec(move |tx| {
                Box::pin(async move {
                    tx.create_user(user_params(&owner)).await?;
                    tx.create_account(CreateAccountParams {
                        owner,
                        balance,
                        currency: "USD".to_string(),
                    })
                    .await
                })
            })
            .await
            .unwrap()
    }

    async fn seed_verify_email(&self, username: &str, code: &str) -> VerifyEmail {
        let username = username.to_string();
        let code = code.to_string();
        self.executor
            .exec(move |tx| {
                Box::pin(async move {
                    let user = tx.create_user(user_params(&username)).await?;
                    tx.create_verify_email(CreateVerifyEmailParams {
                        username: user.username,
                        email: user.email,
                        secret_code: code,
                    })
                    .await
                })
            })
            .await
            .unwrap()
    }

    fn balance(&self, id: i64) -> i64 {
        self.store.account(id).unwrap().balance
    }
}

fn user_params(username: &str) -> CreateUserParams {
    CreateUserParams {
        username: username.to_string(),
        hashed_password: "$argon2id$stub".to_string(),
        full_name: format!("{} Tester", username),
        email: format!("{}@example.com", username),
    }
}

fn transfer(from: &Account, to: &Account, amount: i64) -> TransferTxParams {
    TransferTxParams {
        from_account_id: from.id,
        to_account_id: to.id,
        amount,
    }
}

// ========================================================================
// Transfer
// ========================================================================

/// Test: A=100, B=50, five concurrent transfers of 10 from A to B
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_one_direction() {
    let h = TestHarness::new();
    let a = h.seed_account("alice", 100).await;
    let b = h.seed_account("bob", 50).await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let executor = h.executor.clone();
        let params = transfer(&a, &b, 10);
        handles.push(tokio::spawn(async move { executor.transfer_tx(params).await }));
    }

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.transfer.amount, 10);
        assert_eq!(result.from_entry.amount, -10);
        assert_eq!(result.to_entry.amount, 10);
        // every intermediate balance moves in whole steps of the amount
        assert_eq!((100 - result.from_account.balance) % 10, 0);
        assert_eq!((result.to_account.balance - 50) % 10, 0);
    }

    assert_eq!(h.balance(a.id), 50);
    assert_eq!(h.balance(b.id), 100);
    assert_eq!(h.store.transfers().len(), 5);
    assert_eq!(h.store.entries(a.id).len(), 5);
    assert_eq!(h.store.entries(b.id).len(), 5);
    assert_eq!(h.store.entry_count(), 10);
}

/// Test: alternating-direction transfers between the same pair all complete
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bidirectional_transfers_do_not_deadlock() {
    let h = TestHarness::with_store(MemoryStore::with_lock_timeout(Duration::from_secs(2)));
    let a = h.seed_account("alice", 100).await;
    let b = h.seed_account("bob", 100).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let executor = h.executor.clone();
        let params = if i % 2 == 0 {
            transfer(&a, &b, 10)
        } else {
            transfer(&b, &a, 10)
        };
        handles.push(tokio::spawn(async move { executor.transfer_tx(params).await }));
    }

    for handle in handles {
        // a lock-wait cycle would surface as a Transient lock timeout
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.balance(a.id), 100);
    assert_eq!(h.balance(b.id), 100);
    assert_eq!(h.store.transfers().len(), 10);
}

/// Test: both directions request the lower account id first
#[tokio::test]
async fn test_transfer_locks_lower_account_first() {
    let h = TestHarness::new();
    let low = h.seed_account("alice", 100).await;
    let high = h.seed_account("bob", 100).await;
    assert!(low.id < high.id);

    for params in [transfer(&high, &low, 10), transfer(&low, &high, 10)] {
        let before = h.store.account_lock_requests().len();
        h.executor.transfer_tx(params).await.unwrap();
        assert_eq!(
            h.store.account_lock_requests()[before..],
            [low.id, high.id],
            "{} -> {}",
            params.from_account_id,
            params.to_account_id
        );
    }

    let before = h.store.account_lock_requests().len();
    h.executor.transfer_tx(transfer(&high, &high, 10)).await.unwrap();
    assert_eq!(h.store.account_lock_requests()[before..], [high.id]);
}

/// Test: a transfer queued behind the lower row holds nothing else
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocked_reverse_transfer_holds_no_other_row() {
    let h = TestHarness::with_store(MemoryStore::with_lock_timeout(Duration::from_millis(500)));
    let low = h.seed_account("alice", 100).await;
    let high = h.seed_account("bob", 100).await;

    let mut holder = h.store.begin().await.unwrap();
    holder
        .add_account_balance(AddAccountBalanceParams { id: low.id, amount: 0 })
        .await
        .unwrap();
    let before = h.store.account_lock_requests().len();

    let executor = h.executor.clone();
    let params = transfer(&high, &low, 10);
    let pending = tokio::spawn(async move { executor.transfer_tx(params).await });

    // wait until the transfer is queued on the lower row
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.store.account_lock_requests().len() == before {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.store.account_lock_requests()[before..], [low.id]);

    // the higher row is free while the transfer waits
    let mut other = h.store.begin().await.unwrap();
    other
        .add_account_balance(AddAccountBalanceParams { id: high.id, amount: 0 })
        .await
        .unwrap();
    other.rollback().await.unwrap();

    holder.rollback().await.unwrap();
    pending.await.unwrap().unwrap();
    assert_eq!(h.balance(low.id), 110);
    assert_eq!(h.balance(high.id), 90);
}

/// Test: conservation across many mixed-direction transfers
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_balance_conservation() {
    let h = TestHarness::new();
    let x = h.seed_account("xavier", 1_000).await;
    let y = h.seed_account("yvonne", 1_000).await;

    let mut handles = Vec::new();
    for i in 0..30 {
        let executor = h.executor.clone();
        let params = if i % 3 == 0 {
            transfer(&y, &x, 7)
        } else {
            transfer(&x, &y, 7)
        };
        handles.push(tokio::spawn(async move { executor.transfer_tx(params).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let (bx, by) = (h.balance(x.id), h.balance(y.id));
    assert_eq!(bx + by, 2_000);
    assert_eq!((bx - 1_000) % 7, 0);
    // 20 from x to y, 10 back
    assert_eq!(bx, 1_000 - 70);
}

/// Test: every committed transfer has exactly two offsetting entries
#[tokio::test]
async fn test_entry_pairing() {
    let h = TestHarness::new();
    let a = h.seed_account("alice", 100).await;
    let b = h.seed_account("bob", 100).await;
    let c = h.seed_account("carol", 100).await;

    h.executor.transfer_tx(transfer(&a, &b, 5)).await.unwrap();
    h.executor.transfer_tx(transfer(&c, &a, 15)).await.unwrap();
    h.executor.transfer_tx(transfer(&b, &c, 25)).await.unwrap();

    let mut entries = Vec::new();
    for account in [&a, &b, &c] {
        entries.extend(h.store.entries(account.id));
    }

    for t in h.store.transfers() {
        let debit: Vec<_> = entries
            .iter()
            .filter(|e| e.account_id == t.from_account_id && e.amount == -t.amount)
            .collect();
        let credit: Vec<_> = entries
            .iter()
            .filter(|e| e.account_id == t.to_account_id && e.amount == t.amount)
            .collect();
        assert_eq!(debit.len(), 1, "transfer {} debit", t.id);
        assert_eq!(credit.len(), 1, "transfer {} credit", t.id);
    }
    assert_eq!(entries.len(), 6);
    assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 0);

    // read back through the query layer
    let (a_id, b_id) = (a.id, b.id);
    let (listed, reverse) = h
        .executor
        .exec(move |tx| {
            Box::pin(async move {
                let listed = tx.list_transfers(a_id, b_id).await?;
                let reverse = tx.list_transfers(b_id, a_id).await?;
                Ok((listed, reverse))
            })
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].amount, 5);
    assert!(reverse.is_empty());

    let id = listed[0].id;
    let fetched = h
        .executor
        .exec(move |tx| Box::pin(async move { tx.get_transfer(id).await }))
        .await
        .unwrap();
    assert_eq!(fetched, listed[0]);

    let err = h
        .executor
        .exec(move |tx| Box::pin(async move { tx.get_transfer(id + 1_000).await }))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

/// Test: a failure at any step leaves no trace
#[tokio::test]
async fn test_transfer_atomicity_under_faults() {
    let faults = [
        (FaultPoint::CreateTransfer, 0),
        (FaultPoint::CreateEntry, 0),
        (FaultPoint::CreateEntry, 1),
        (FaultPoint::AddAccountBalance, 0),
        (FaultPoint::AddAccountBalance, 1),
        (FaultPoint::Commit, 0),
    ];

    for (point, skip) in faults {
        let h = TestHarness::new();
        let a = h.seed_account("alice", 100).await;
        let b = h.seed_account("bob", 50).await;

        h.store.inject_fault(point, skip);
        let err = h.executor.transfer_tx(transfer(&a, &b, 10)).await;
        assert!(err.is_err(), "{:?}/{} should fail", point, skip);

        assert_eq!(h.balance(a.id) + h.balance(b.id), 150, "{:?}/{}", point, skip);
        assert_eq!(h.balance(a.id), 100);
        assert!(h.store.transfers().is_empty());
        assert_eq!(h.store.entry_count(), 0);

        // locks were released: the next transfer goes through
        h.executor.transfer_tx(transfer(&a, &b, 10)).await.unwrap();
        assert_eq!(h.balance(a.id), 90);
    }
}

#[tokio::test]
async fn test_rollback_failure_reports_both_errors() {
    let h = TestHarness::new();
    let a = h.seed_account("alice", 100).await;
    let b = h.seed_account("bob", 50).await;

    h.store.inject_fault(FaultPoint::CreateEntry, 0);
    h.store.inject_fault(FaultPoint::Rollback, 0);

    let err = h.executor.transfer_tx(transfer(&a, &b, 10)).await.unwrap_err();
    assert!(err.is_unknown_state());
    match err {
        StoreError::RollbackFailed { source, rollback } => {
            assert!(source.to_string().contains("CreateEntry"));
            assert!(rollback.to_string().contains("Rollback"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_transfer_rejects_non_positive_amount() {
    let h = TestHarness::new();
    let a = h.seed_account("alice", 100).await;
    let b = h.seed_account("bob", 50).await;

    for amount in [0, -5] {
        let err = h
            .executor
            .transfer_tx(transfer(&a, &b, amount))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }
    assert!(h.store.transfers().is_empty());
}

#[tokio::test]
async fn test_transfer_to_missing_account() {
    let h = TestHarness::new();
    let a = h.seed_account("alice", 100).await;

    let err = h
        .executor
        .transfer_tx(TransferTxParams {
            from_account_id: a.id,
            to_account_id: 9_999,
            amount: 10,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert_eq!(h.balance(a.id), 100);
}

#[tokio::test]
async fn test_self_transfer_is_balance_neutral() {
    let h = TestHarness::with_store(MemoryStore::with_lock_timeout(Duration::from_millis(200)));
    let a = h.seed_account("alice", 100).await;

    let result = h.executor.transfer_tx(transfer(&a, &a, 30)).await.unwrap();
    assert_eq!(result.from_account, result.to_account);
    assert_eq!(result.from_account.balance, 100);
    assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
    assert_eq!(h.store.entries(a.id).len(), 2);
    assert_eq!(h.balance(a.id), 100);
}

/// Test: a unit of work stuck on a row lock is cut off and rolled back
#[tokio::test]
async fn test_deadline_exceeded_rolls_back() {
    let h = TestHarness::new();
    let a = h.seed_account("alice", 100).await;
    let b = h.seed_account("bob", 50).await;

    let mut holder = h.store.begin().await.unwrap();
    holder
        .add_account_balance(AddAccountBalanceParams { id: a.id, amount: 0 })
        .await
        .unwrap();

    let bounded = h.executor.clone().with_deadline(Duration::from_millis(50));
    let err = bounded.transfer_tx(transfer(&a, &b, 10)).await.unwrap_err();
    assert!(matches!(err, StoreError::DeadlineExceeded(_)));
    assert!(err.is_retryable());

    holder.rollback().await.unwrap();
    assert!(h.store.transfers().is_empty());
    assert_eq!(h.store.entry_count(), 0);

    bounded.transfer_tx(transfer(&a, &b, 10)).await.unwrap();
    assert_eq!(h.balance(b.id), 60);
}

/// Test: a slow commit past the deadline still reports success
#[tokio::test]
async fn test_deadline_does_not_cover_commit() {
    let h = TestHarness::new();
    let a = h.seed_account("alice", 100).await;
    let b = h.seed_account("bob", 50).await;

    h.store.delay_commit(Duration::from_millis(200));
    let bounded = h.executor.clone().with_deadline(Duration::from_millis(50));
    let result = bounded.transfer_tx(transfer(&a, &b, 10)).await.unwrap();

    assert_eq!(result.to_account.balance, 60);
    assert_eq!(h.balance(a.id), 90);
    assert_eq!(h.balance(b.id), 60);
    assert_eq!(h.store.transfers().len(), 1);
}

// ========================================================================
// User creation
// ========================================================================

#[tokio::test]
async fn test_create_user_runs_hook_after_commit() {
    let h = TestHarness::new();
    let store = h.store.clone();
    let seen_committed = Arc::new(AtomicUsize::new(0));
    let seen = seen_committed.clone();

    let result = h
        .executor
        .create_user_tx(user_params("dave"), move |user| async move {
            if store.user(&user.username).is_some() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            Ok::<(), String>(())
        })
        .await
        .unwrap();

    assert!(result.after_create_delivered);
    assert_eq!(seen_committed.load(Ordering::SeqCst), 1);
    assert_eq!(result.user.role, "depositor");
    assert!(!result.user.is_email_verified);

    let events = h.store.user_events();
    assert_eq!(events.len(), 1);
    assert!(events[0].published_at.is_some());
}

#[tokio::test]
async fn test_create_user_hook_failure_leaves_event_pending() {
    let h = TestHarness::new();

    let result = h
        .executor
        .create_user_tx(user_params("erin"), |_user| async {
            Err::<(), _>("queue unavailable".to_string())
        })
        .await
        .unwrap();

    assert!(!result.after_create_delivered);
    assert!(h.store.user("erin").is_some());
    let events = h.store.user_events();
    assert_eq!(events.len(), 1);
    assert!(events[0].published_at.is_none());
}

#[tokio::test]
async fn test_duplicate_username_is_conflict_and_skips_hook() {
    let h = TestHarness::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        let _ = h
            .executor
            .create_user_tx(user_params("frank"), move |_user| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .await;
    }

    let mut other = user_params("frank");
    other.email = "frank2@example.com".to_string();
    let err = h
        .executor
        .create_user_tx(other, |_user| async { Ok::<(), String>(()) })
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Conflict(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.user_events().len(), 1);
}

#[tokio::test]
async fn test_create_user_insert_failure_writes_nothing() {
    let h = TestHarness::new();
    h.store.inject_fault(FaultPoint::CreateUserEvent, 0);

    let err = h
        .executor
        .create_user_tx(user_params("gina"), |_user| async { Ok::<(), String>(()) })
        .await;
    assert!(err.is_err());
    assert!(h.store.user("gina").is_none());

    // the username claim was released with the rollback
    h.executor
        .create_user_tx(user_params("gina"), |_user| async { Ok::<(), String>(()) })
        .await
        .unwrap();
}

// ========================================================================
// Email verification
// ========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_verify_email_single_use_under_concurrency() {
    let h = TestHarness::new();
    let record = h.seed_verify_email("hank", "s3cret").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let executor = h.executor.clone();
        let params = VerifyEmailTxParams {
            email_id: record.id,
            secret_code: "s3cret".to_string(),
        };
        handles.push(tokio::spawn(async move { executor.verify_email_tx(params).await }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                ok += 1;
                assert!(result.user.is_email_verified);
                assert!(result.verify_email.is_used);
            }
            Err(e) => assert!(matches!(e, StoreError::NotFound(_)), "{e:?}"),
        }
    }

    assert_eq!(ok, 1);
    assert!(h.store.user("hank").unwrap().is_email_verified);
    assert!(h.store.verify_emails("hank")[0].is_used);
}

#[tokio::test]
async fn test_verify_email_wrong_code() {
    let h = TestHarness::new();
    let record = h.seed_verify_email("ivy", "right").await;

    let err = h
        .executor
        .verify_email_tx(VerifyEmailTxParams {
            email_id: record.id,
            secret_code: "wrong".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert!(!h.store.user("ivy").unwrap().is_email_verified);

    let err = h
        .executor
        .verify_email_tx(VerifyEmailTxParams {
            email_id: record.id,
            secret_code: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn test_verify_email_user_update_failure_keeps_code_unused() {
    let h = TestHarness::new();
    let record = h.seed_verify_email("jack", "code").await;
    h.store.inject_fault(FaultPoint::UpdateUser, 0);

    let params = VerifyEmailTxParams {
        email_id: record.id,
        secret_code: "code".to_string(),
    };
    assert!(h.executor.verify_email_tx(params.clone()).await.is_err());
    assert!(!h.store.verify_emails("jack")[0].is_used);

    let result = h.executor.verify_email_tx(params).await.unwrap();
    assert!(result.user.is_email_verified);
}
