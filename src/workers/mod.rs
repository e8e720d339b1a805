mod notice_cleanup;
mod session_cleanup;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::env_bool;
use crate::db::DatabaseProxy;

pub use notice_cleanup::purge_expired_notices;
pub use session_cleanup::cleanup_expired_sessions;

const DEFAULT_SESSION_CLEANUP_SCHEDULE: &str = "0 0 * * * *";
const DEFAULT_NOTICE_CLEANUP_SCHEDULE: &str = "0 0 3 * * *";

static WORKER_LEADER: AtomicBool = AtomicBool::new(false);

pub fn is_worker_leader() -> bool {
    WORKER_LEADER.load(Ordering::Relaxed)
}

fn set_worker_leader(val: bool) {
    WORKER_LEADER.store(val, Ordering::Relaxed);
}

pub struct WorkerManager {
    scheduler: Mutex<JobScheduler>,
    shutdown_tx: broadcast::Sender<()>,
    db_proxy: Arc<DatabaseProxy>,
}

impl WorkerManager {
    pub async fn new(db_proxy: Arc<DatabaseProxy>) -> Result<Self, WorkerError> {
        let scheduler = JobScheduler::new().await.map_err(WorkerError::Scheduler)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            shutdown_tx,
            db_proxy,
        })
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        if !env_bool("WORKER_LEADER").unwrap_or(false) {
            info!("WORKER_LEADER not set, skipping worker startup");
            return Ok(());
        }

        set_worker_leader(true);
        info!("Starting workers (leader mode)");

        let scheduler = self.scheduler.lock().await;

        let schedule = std::env::var("SESSION_CLEANUP_SCHEDULE")
            .unwrap_or_else(|_| DEFAULT_SESSION_CLEANUP_SCHEDULE.to_string());
        let job = self.job(&schedule, "session cleanup", |db| async move {
            cleanup_expired_sessions(db).await.map(|_| ())
        })?;
        scheduler.add(job).await.map_err(WorkerError::Scheduler)?;
        info!(schedule = %schedule, "Session cleanup worker scheduled");

        let schedule = std::env::var("NOTICE_CLEANUP_SCHEDULE")
            .unwrap_or_else(|_| DEFAULT_NOTICE_CLEANUP_SCHEDULE.to_string());
        let retention_days = notice_cleanup::retention_days();
        let job = self.job(&schedule, "notice cleanup", move |db| async move {
            purge_expired_notices(db, retention_days).await.map(|_| ())
        })?;
        scheduler.add(job).await.map_err(WorkerError::Scheduler)?;
        info!(schedule = %schedule, retention_days, "Notice cleanup worker scheduled");

        scheduler.start().await.map_err(WorkerError::Scheduler)?;
        info!("All workers started");

        Ok(())
    }

    /// Wraps a task in a cron job that stops early once shutdown is signalled.
    fn job<F, Fut>(&self, schedule: &str, name: &'static str, task: F) -> Result<Job, WorkerError>
    where
        F: Fn(Arc<DatabaseProxy>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let db = Arc::clone(&self.db_proxy);
        let shutdown_rx = self.shutdown_tx.subscribe();
        Job::new_async(schedule, move |_uuid, _lock| {
            let db = Arc::clone(&db);
            let task = task.clone();
            let mut rx = shutdown_rx.resubscribe();
            Box::pin(async move {
                tokio::select! {
                    _ = rx.recv() => {},
                    result = task(db) => {
                        if let Err(e) = result {
                            error!(error = %e, worker = name, "Worker run failed");
                        }
                    }
                }
            })
        })
        .map_err(WorkerError::Scheduler)
    }

    pub async fn stop(&self) {
        if !is_worker_leader() {
            return;
        }

        info!("Stopping workers...");
        let _ = self.shutdown_tx.send(());

        let mut scheduler = self.scheduler.lock().await;
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Error shutting down scheduler");
        }

        set_worker_leader(false);
        info!("Workers stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
