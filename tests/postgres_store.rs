//! PostgreSQL integration tests
//!
//! Require a running database: `DATABASE_URL=... cargo test -- --ignored`.
//! Every test works on freshly created users so runs do not interfere.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use simple_bank::config::DbConfig;
use simple_bank::db::Database;
use simple_bank::store::{
    Account, CreateAccountParams, CreateUserParams, CreateVerifyEmailParams, PgStore, Queries,
    StoreError,
};
use simple_bank::tx::{Executor, TransferTxParams, VerifyEmailTxParams};
use simple_bank::worker::{
    PayloadSendVerifyEmail, PgQueue, QueueBackend, QueueError, Task, TaskMessage, TaskOptions,
};

async fn connect() -> Database {
    let config = DbConfig {
        postgres_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| DbConfig::default().postgres_url),
        ..Default::default()
    };
    let db = Database::connect(&config).await.unwrap();
    db.migrate().await.unwrap();
    db
}

fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, ulid::Ulid::new().to_string().to_lowercase())
}

async fn seed_account(executor: &Executor<PgStore>, balance: i64) -> Account {
    let username = unique("acct");
    executor
        .exec(move |tx| {
            Box::pin(async move {
                tx.create_user(CreateUserParams {
                    username: username.clone(),
                    hashed_password: "hash".to_string(),
                    full_name: "Test Owner".to_string(),
                    email: format!("{}@example.com", username),
                })
                .await?;
                tx.create_account(CreateAccountParams {
                    owner: username,
                    balance,
                    currency: "USD".to_string(),
                })
                .await
            })
        })
        .await
        .unwrap()
}

async fn balance(executor: &Executor<PgStore>, id: i64) -> i64 {
    executor
        .exec(move |tx| Box::pin(async move { tx.get_account(id).await }))
        .await
        .unwrap()
        .balance
}

#[tokio::test]
#[ignore = "requires PostgreSQL database"]
async fn test_concurrent_transfers() {
    let db = connect().await;
    let executor = Executor::new(PgStore::new(db.pool().clone()));
    let a = seed_account(&executor, 100).await;
    let b = seed_account(&executor, 50).await;
    let (a_id, b_id) = (a.id, b.id);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor
                .transfer_tx(TransferTxParams {
                    from_account_id: a_id,
                    to_account_id: b_id,
                    amount: 10,
                })
                .await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.transfer.amount, 10);
        assert_eq!(result.from_entry.amount, -10);
        assert_eq!(result.to_entry.amount, 10);
    }

    assert_eq!(balance(&executor, a.id).await, 50);
    assert_eq!(balance(&executor, b.id).await, 100);

    let transfers = executor
        .exec(move |tx| Box::pin(async move { tx.list_transfers(a_id, b_id).await }))
        .await
        .unwrap();
    assert_eq!(transfers.len(), 5);
    assert!(transfers.windows(2).all(|w| w[0].id < w[1].id));

    let first_id = transfers[0].id;
    let first = executor
        .exec(move |tx| Box::pin(async move { tx.get_transfer(first_id).await }))
        .await
        .unwrap();
    assert_eq!(first, transfers[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL database"]
async fn test_bidirectional_transfers_do_not_deadlock() {
    let db = connect().await;
    let executor = Executor::new(
        PgStore::new(db.pool().clone()).with_lock_timeout(Duration::from_secs(5)),
    );
    let a = seed_account(&executor, 100).await;
    let b = seed_account(&executor, 100).await;
    let (a_id, b_id) = (a.id, b.id);

    let mut handles = Vec::new();
    for i in 0..10 {
        let executor = executor.clone();
        let (from, to) = if i % 2 == 0 { (a_id, b_id) } else { (b_id, a_id) };
        handles.push(tokio::spawn(async move {
            executor
                .transfer_tx(TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount: 10,
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance(&executor, a.id).await, 100);
    assert_eq!(balance(&executor, b.id).await, 100);
}

#[tokio::test]
#[ignore = "requires PostgreSQL database"]
async fn test_transfer_to_missing_account_rolls_back() {
    let db = connect().await;
    let executor = Executor::new(PgStore::new(db.pool().clone()));
    let a_id = seed_account(&executor, 100).await.id;

    let err = executor
        .transfer_tx(TransferTxParams {
            from_account_id: a_id,
            to_account_id: i64::MAX,
            amount: 10,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert_eq!(balance(&executor, a_id).await, 100);

    let entries = executor
        .exec(move |tx| Box::pin(async move { tx.list_entries(a_id).await }))
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
#[ignore = "requires PostgreSQL database"]
async fn test_verify_email_single_use() {
    let db = connect().await;
    let executor = Executor::new(PgStore::new(db.pool().clone()));
    let username = unique("verify");

    let record = {
        let username = username.clone();
        executor
            .exec(move |tx| {
                Box::pin(async move {
                    let user = tx
                        .create_user(CreateUserParams {
                            username: username.clone(),
                            hashed_password: "hash".to_string(),
                            full_name: "Verify Me".to_string(),
                            email: format!("{}@example.com", username),
                        })
                        .await?;
                    tx.create_verify_email(CreateVerifyEmailParams {
                        username: user.username,
                        email: user.email,
                        secret_code: "abcdefgh".to_string(),
                    })
                    .await
                })
            })
            .await
            .unwrap()
    };
    assert!(record.expired_at > Utc::now());
    let email_id = record.id;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move {
            executor
                .verify_email_tx(VerifyEmailTxParams {
                    email_id,
                    secret_code: "abcdefgh".to_string(),
                })
                .await
        }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert!(result.user.is_email_verified);
                ok += 1;
            }
            Err(e) => assert!(matches!(e, StoreError::NotFound(_)), "{e}"),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL database"]
async fn test_duplicate_user_is_conflict() {
    let db = connect().await;
    let executor = Executor::new(PgStore::new(db.pool().clone()));
    let username = unique("dup");
    let params = CreateUserParams {
        username: username.clone(),
        hashed_password: "hash".to_string(),
        full_name: "Dup".to_string(),
        email: format!("{}@example.com", username),
    };

    let first = executor
        .create_user_tx(params.clone(), |_| async { Ok::<(), String>(()) })
        .await
        .unwrap();
    assert!(first.after_create_delivered);

    let err = executor
        .create_user_tx(params, |_| async { Ok::<(), String>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
#[ignore = "requires PostgreSQL database"]
async fn test_pg_queue_claim_retry_archive() {
    let db = connect().await;
    let queue = PgQueue::new(db.pool().clone()).with_lease(Duration::from_secs(30));
    // private queue name so concurrent runs never see each other's tasks
    let queue_name = unique("q");

    let task = Task::SendVerifyEmail(PayloadSendVerifyEmail {
        username: unique("user"),
    });
    let opts = TaskOptions::default().queue(queue_name.clone()).max_attempts(2);
    let msg = TaskMessage::new(&task, &opts, Utc::now()).unwrap();
    let id = msg.id;
    queue.enqueue(msg).await.unwrap();

    let claimed = queue.dequeue(&queue_name).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    // leased, not visible to another worker
    assert!(queue.dequeue(&queue_name).await.unwrap().is_none());

    queue.retry(&claimed, Utc::now(), "smtp down").await.unwrap();
    let again = queue.dequeue(&queue_name).await.unwrap().unwrap();
    assert_eq!(again.retried, 1);
    assert_eq!(again.last_error.as_deref(), Some("smtp down"));
    assert!(again.is_last_attempt());

    queue.archive(&again, "smtp down").await.unwrap();
    assert!(queue.dequeue(&queue_name).await.unwrap().is_none());

    let archived = queue.list_archived(1000).await.unwrap();
    let row = archived.iter().find(|m| m.id == id).unwrap();
    assert_eq!(row.retried, 2);
    assert_eq!(row.last_error.as_deref(), Some("smtp down"));
}

#[tokio::test]
#[ignore = "requires PostgreSQL database"]
async fn test_pg_queue_complete_removes_task() {
    let db = connect().await;
    let queue: Arc<dyn QueueBackend> = Arc::new(PgQueue::new(db.pool().clone()));
    let queue_name = unique("q");

    let task = Task::SendVerifyEmail(PayloadSendVerifyEmail {
        username: unique("user"),
    });
    let msg = TaskMessage::new(&task, &TaskOptions::default().queue(queue_name.clone()), Utc::now())
        .unwrap();
    queue.enqueue(msg).await.unwrap();

    let claimed = queue.dequeue(&queue_name).await.unwrap().unwrap();
    queue.complete(&claimed).await.unwrap();
    assert!(queue.dequeue(&queue_name).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires PostgreSQL database"]
async fn test_pg_queue_rejects_superseded_claim() {
    let db = connect().await;
    let queue = PgQueue::new(db.pool().clone()).with_lease(Duration::ZERO);
    let queue_name = unique("q");

    let task = Task::SendVerifyEmail(PayloadSendVerifyEmail {
        username: unique("user"),
    });
    let msg = TaskMessage::new(&task, &TaskOptions::default().queue(queue_name.clone()), Utc::now())
        .unwrap();
    queue.enqueue(msg).await.unwrap();

    let stale = queue.dequeue(&queue_name).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fresh = queue.dequeue(&queue_name).await.unwrap().unwrap();
    assert_eq!(stale.id, fresh.id);
    assert!(fresh.claim > stale.claim);

    for err in [
        queue.extend_lease(&stale).await.unwrap_err(),
        queue.complete(&stale).await.unwrap_err(),
        queue.retry(&stale, Utc::now(), "late").await.unwrap_err(),
        queue.archive(&stale, "late").await.unwrap_err(),
    ] {
        assert!(matches!(err, QueueError::LeaseLost(id) if id == stale.id));
    }

    queue.extend_lease(&fresh).await.unwrap();
    queue.complete(&fresh).await.unwrap();
    assert!(queue.dequeue(&queue_name).await.unwrap().is_none());
}
