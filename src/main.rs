//! Simple Bank worker
//!
//! Connects the entity store and the task queue, then runs the task
//! processor and the outbox relay until Ctrl-C.
//!
//! Usage: `simple_bank [--env dev]` (reads `config/<env>.yaml`)

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use simple_bank::config::AppConfig;
use simple_bank::db::Database;
use simple_bank::mail::{EmailSender, LogSender, SmtpSender};
use simple_bank::store::PgStore;
use simple_bank::tx::Executor;
use simple_bank::worker::{
    OutboxRelay, PgQueue, QueueBackend, QueueDistributor, SendVerifyEmailHandler, TaskKind,
    TaskObserver, TaskProcessor, TracingObserver,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = simple_bank::logging::init_logging(&config.log);

    tracing::info!(
        env = %env,
        rev = env!("BANK_BUILD_REV"),
        "Starting Simple Bank worker"
    );

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.migrate().await.context("Failed to migrate schema")?;

    let mut store = PgStore::new(db.pool().clone());
    if let Some(timeout) = config.database.lock_timeout() {
        store = store.with_lock_timeout(timeout);
    }
    let mut executor = Executor::new(store);
    if let Some(deadline) = config.database.statement_deadline() {
        executor = executor.with_deadline(deadline);
    }

    let queue_url = config.queue_url();
    let queue_pool = if queue_url == config.database.postgres_url {
        db.pool().clone()
    } else {
        let queue_db = Database::connect_url(queue_url, &config.database)
            .await
            .context("Failed to connect to queue database")?;
        queue_db
            .migrate()
            .await
            .context("Failed to migrate queue schema")?;
        queue_db.pool().clone()
    };
    let backend: Arc<dyn QueueBackend> = Arc::new(
        PgQueue::new(queue_pool).with_lease(Duration::from_secs(config.queue.lease_secs)),
    );
    let observer: Arc<dyn TaskObserver> = Arc::new(TracingObserver);

    let mailer: Arc<dyn EmailSender> = if config.mail.enabled {
        Arc::new(SmtpSender::new(&config.mail).context("Failed to build SMTP sender")?)
    } else {
        tracing::warn!("Mail disabled, verification emails are logged only");
        Arc::new(LogSender)
    };

    let mut processor = TaskProcessor::new(
        backend.clone(),
        observer.clone(),
        config.worker.processor_config(),
    );
    processor.register(
        TaskKind::SendVerifyEmail,
        Arc::new(SendVerifyEmailHandler::new(
            executor.clone(),
            mailer,
            config.verify_email.url_base.clone(),
        )),
    )?;
    processor
        .validate()
        .context("Invalid task processor configuration")?;

    let distributor = Arc::new(QueueDistributor::new(backend, observer));
    let relay = OutboxRelay::new(
        executor,
        distributor,
        config.verify_email.task_options(),
        config.outbox.relay_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor_handle = tokio::spawn(Arc::new(processor).run(shutdown_rx.clone()));
    let relay_handle = tokio::spawn(async move { relay.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    processor_handle
        .await
        .context("Task processor panicked")?
        .context("Task processor failed")?;
    relay_handle.await.context("Outbox relay panicked")?;

    tracing::info!("Simple Bank worker stopped");
    Ok(())
}
