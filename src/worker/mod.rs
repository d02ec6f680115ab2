//! Job dispatching
//!
//! Routes each job to the sender of its transaction variant and runs jobs
//! concurrently on a bounded pool. Nonce conflicts are retried here; every
//! other error ends the job as failed.

use crate::error::{SenderError, SenderResult};
use crate::metrics;
use crate::state::{JobStatusReporter, UpdateJobRequest};
use crate::tx::{
    EeaPrivateSender, NonceManager, PublicTransactionSender, RawTransactionSender,
    SendTransaction, SenderContext, TesseraMarkingSender, TesseraPrivateSender,
};
use crate::types::{Job, JobStatus, JobType};

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// One sender per transaction variant
pub struct Senders {
    pub public: Arc<dyn SendTransaction>,
    pub raw: Arc<dyn SendTransaction>,
    pub eea_private: Arc<dyn SendTransaction>,
    pub tessera_marking: Arc<dyn SendTransaction>,
    pub tessera_private: Arc<dyn SendTransaction>,
}

impl Senders {
    pub fn new(ctx: Arc<SenderContext>) -> Self {
        Self {
            public: Arc::new(PublicTransactionSender::new(ctx.clone())),
            raw: Arc::new(RawTransactionSender::new(ctx.clone())),
            eea_private: Arc::new(EeaPrivateSender::new(ctx.clone())),
            tessera_marking: Arc::new(TesseraMarkingSender::new(ctx.clone())),
            tessera_private: Arc::new(TesseraPrivateSender::new(ctx)),
        }
    }

    pub fn route(&self, job_type: JobType) -> &Arc<dyn SendTransaction> {
        match job_type {
            JobType::EthTransaction | JobType::EeaMarkingTransaction => &self.public,
            JobType::EthRawTransaction => &self.raw,
            JobType::EeaPrivateTransaction => &self.eea_private,
            JobType::TesseraMarkingTransaction => &self.tessera_marking,
            JobType::TesseraPrivateTransaction => &self.tessera_private,
        }
    }
}

pub struct JobDispatcher {
    senders: Senders,
    nonce_manager: Arc<NonceManager>,
    reporter: Arc<dyn JobStatusReporter>,
    /// Concurrent jobs allowed
    workers: usize,
    permits: Arc<Semaphore>,
    /// Shutdown flag
    shutdown: RwLock<bool>,
    shutdown_notify: Notify,
}

impl JobDispatcher {
    pub fn new(
        senders: Senders,
        nonce_manager: Arc<NonceManager>,
        reporter: Arc<dyn JobStatusReporter>,
        workers: usize,
    ) -> Self {
        Self {
            senders,
            nonce_manager,
            reporter,
            workers,
            permits: Arc::new(Semaphore::new(workers)),
            shutdown: RwLock::new(false),
            shutdown_notify: Notify::new(),
        }
    }

    /// Process jobs until the channel closes or the dispatcher is stopped,
    /// then wait for jobs in flight
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::Receiver<Job>) -> SenderResult<()> {
        let pool_size = u32::try_from(self.workers).map_err(|_| {
            SenderError::Config(format!("{} workers exceed the pool limit", self.workers))
        })?;
        info!(workers = self.workers, "Job dispatcher started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SenderError::Internal(format!("worker pool closed: {}", e)))?;

            tokio::select! {
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    let dispatcher = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _ = dispatcher.process(job).await;
                    });
                }
                _ = self.shutdown_notify.notified() => break,
            }
        }

        // Every permit back means no job is still running
        let _in_flight = self
            .permits
            .acquire_many(pool_size)
            .await
            .map_err(|e| SenderError::Internal(format!("worker pool closed: {}", e)))?;

        info!("Job dispatcher stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        self.shutdown_notify.notify_one();
    }

    /// Run one job to completion, reporting `Recovering` on each nonce
    /// recovery and `Failed` on any other error
    pub async fn process(&self, mut job: Job) -> SenderResult<()> {
        let started = Instant::now();
        let sender = self.senders.route(job.job_type);
        debug!(
            job_uuid = %job.uuid,
            job_type = %job.job_type,
            parent_job_uuid = ?job.internal_data.parent_job_uuid,
            "processing job"
        );

        let result = loop {
            match sender.execute(&mut job).await {
                Ok(()) => break Ok(()),
                Err(e) if e.is_recoverable() => {
                    warn!(job_uuid = %job.uuid, "job recovering: {}", e);
                    if let Err(report_error) = self
                        .report(&mut job, JobStatus::Recovering, e.to_string())
                        .await
                    {
                        break Err(report_error);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        metrics::record_job_duration(job.job_type, started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            self.nonce_manager.clear_recovery(&job.uuid);
            error!(job_uuid = %job.uuid, job_type = %job.job_type, "job failed: {}", e);
            metrics::record_job_failed(job.job_type);
            if let Err(report_error) = self.report(&mut job, JobStatus::Failed, e.to_string()).await {
                error!(job_uuid = %job.uuid, "failed to report job failure: {}", report_error);
            }
        }

        result
    }

    async fn report(&self, job: &mut Job, status: JobStatus, message: String) -> SenderResult<()> {
        job.status = status;
        let update = UpdateJobRequest {
            status,
            message: Some(message),
            transaction: job.transaction.clone(),
        };
        self.reporter.update_job(job.uuid, &update).await
    }
}
