//! Cron Scheduler
//!
//! Registers the pipeline's periodic jobs with `tokio-cron-scheduler`. Each
//! job has a 6-field cron expression (seconds first) evaluated in an explicit
//! timezone. Job bodies run on the shared [`WorkerPool`] and receive the
//! instant the cron fired, not the instant a worker picked them up. A
//! failing or panicking body is logged and counted and never reaches the
//! scheduler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::application::ports::FeedControl;
use crate::application::services::backfill::BackfillService;
use crate::application::services::currency::CurrencyRefresher;
use crate::application::services::equities::EquitiesPoller;
use crate::application::services::worker_pool::WorkerPool;
use crate::domain::asset::AssetClass;
use crate::infrastructure::config::SchedulerSettings;

/// Scheduler error.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A job could not be built, usually a bad cron expression.
    #[error("failed to create job {name}: {reason}")]
    JobCreation {
        /// Job name.
        name: String,
        /// Underlying error.
        reason: String,
    },

    /// The scheduler rejected an operation.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
}

// =============================================================================
// Job table
// =============================================================================

/// Job names, also used in metric labels and `SCHEDULER_DISABLED_JOBS`.
pub mod job_name {
    /// Equities quote polling.
    pub const EQUITIES_POLL: &str = "equities-poll";
    /// Daily trackable-list validity check.
    pub const SUBSCRIPTION_VALIDITY: &str = "subscription-validity";
    /// Feed connection health.
    pub const CONNECTION_HEALTH: &str = "connection-health";
    /// Daily stock history.
    pub const STOCK_BACKFILL: &str = "stock-backfill";
    /// Daily crypto history.
    pub const CRYPTO_BACKFILL: &str = "crypto-backfill";
    /// History gap check.
    pub const INTEGRITY_CHECK: &str = "integrity-check";
    /// Exchange rate refresh.
    pub const CURRENCY_REFRESH: &str = "currency-refresh";
}

/// When a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Job name.
    pub name: &'static str,
    /// Cron expression with seconds.
    pub cron: &'static str,
    /// Timezone the expression is evaluated in.
    pub tz: Tz,
}

/// The pipeline's job table. Market jobs run in `market_tz`, the rest in UTC.
#[must_use]
pub fn job_table(market_tz: Tz) -> Vec<JobSpec> {
    let utc = chrono_tz::UTC;
    vec![
        JobSpec {
            name: job_name::EQUITIES_POLL,
            cron: "*/5 * 9-13 * * Mon-Fri",
            tz: market_tz,
        },
        JobSpec {
            name: job_name::SUBSCRIPTION_VALIDITY,
            cron: "0 30 8 * * *",
            tz: market_tz,
        },
        JobSpec {
            name: job_name::CONNECTION_HEALTH,
            cron: "0 */5 * * * *",
            tz: utc,
        },
        JobSpec {
            name: job_name::STOCK_BACKFILL,
            cron: "0 30 16 * * Mon-Fri",
            tz: market_tz,
        },
        JobSpec {
            name: job_name::CRYPTO_BACKFILL,
            cron: "0 30 2 * * *",
            tz: utc,
        },
        JobSpec {
            name: job_name::INTEGRITY_CHECK,
            cron: "0 30 */4 * * *",
            tz: utc,
        },
        JobSpec {
            name: job_name::CURRENCY_REFRESH,
            cron: "0 30 */2 * * *",
            tz: utc,
        },
    ]
}

// =============================================================================
// Job bodies
// =============================================================================

/// Boxed future returned by a job body.
pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A job body. Called once per firing with the fire time.
pub type JobBody = Arc<dyn Fn(DateTime<Utc>) -> JobFuture + Send + Sync>;

/// Services the pipeline jobs drive.
#[derive(Clone)]
pub struct PipelineJobs {
    /// Equities poller.
    pub poller: Arc<EquitiesPoller>,
    /// Feed connection.
    pub feed: Arc<dyn FeedControl>,
    /// History backfill.
    pub backfill: Arc<BackfillService>,
    /// Exchange-rate refresh.
    pub currency: Arc<CurrencyRefresher>,
}

impl PipelineJobs {
    /// Body for a job name, `None` for unknown names.
    #[must_use]
    pub fn body(&self, name: &str) -> Option<JobBody> {
        let body = match name {
            job_name::EQUITIES_POLL => {
                let poller = Arc::clone(&self.poller);
                job(move |fired_at| {
                    let poller = Arc::clone(&poller);
                    async move {
                        let outcome = poller.tick(fired_at).await?;
                        tracing::debug!(?outcome, "Equities poll tick");
                        Ok::<(), anyhow::Error>(())
                    }
                })
            }
            job_name::SUBSCRIPTION_VALIDITY => {
                let poller = Arc::clone(&self.poller);
                job(move |_| {
                    let poller = Arc::clone(&poller);
                    async move {
                        let tracked = poller.check_validity().await?;
                        tracing::info!(tracked, "Subscription validity checked");
                        Ok::<(), anyhow::Error>(())
                    }
                })
            }
            job_name::CONNECTION_HEALTH => {
                let feed = Arc::clone(&self.feed);
                job(move |_| {
                    let feed = Arc::clone(&feed);
                    async move {
                        if !feed.is_running() {
                            tracing::info!("Feed not running, requesting reconnect");
                        }
                        feed.ensure_connected();
                        Ok::<(), anyhow::Error>(())
                    }
                })
            }
            job_name::STOCK_BACKFILL => class_backfill(&self.backfill, AssetClass::StockTw),
            job_name::CRYPTO_BACKFILL => class_backfill(&self.backfill, AssetClass::Crypto),
            job_name::INTEGRITY_CHECK => {
                let backfill = Arc::clone(&self.backfill);
                job(move |_| {
                    let backfill = Arc::clone(&backfill);
                    async move {
                        let summary = backfill.check_integrity().await;
                        tracing::info!(?summary, "History integrity checked");
                        anyhow::ensure!(
                            summary.failed == 0,
                            "{} assets failed to backfill",
                            summary.failed
                        );
                        Ok::<(), anyhow::Error>(())
                    }
                })
            }
            job_name::CURRENCY_REFRESH => {
                let currency = Arc::clone(&self.currency);
                job(move |_| {
                    let currency = Arc::clone(&currency);
                    async move {
                        let written = currency.refresh().await?;
                        tracing::info!(written, "Exchange rates refreshed");
                        Ok::<(), anyhow::Error>(())
                    }
                })
            }
            _ => return None,
        };
        Some(body)
    }
}

/// Box a closure producing futures into a [`JobBody`].
pub fn job<F, Fut>(f: F) -> JobBody
where
    F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |fired_at| -> JobFuture { Box::pin(f(fired_at)) })
}

fn class_backfill(backfill: &Arc<BackfillService>, class: AssetClass) -> JobBody {
    let backfill = Arc::clone(backfill);
    job(move |_| {
        let backfill = Arc::clone(&backfill);
        async move {
            let summary = backfill.backfill_class(class).await;
            tracing::info!(class = class.as_str(), ?summary, "Daily backfill finished");
            anyhow::ensure!(
                summary.failed == 0,
                "{} assets failed to backfill",
                summary.failed
            );
            Ok::<(), anyhow::Error>(())
        }
    })
}

/// Run one firing of a job on the pool, logging and counting the result.
pub async fn run_guarded(
    name: &'static str,
    pool: &WorkerPool,
    body: &JobBody,
    fired_at: DateTime<Utc>,
) {
    let handle = match pool.spawn(body(fired_at)) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::debug!(job = name, error = %e, "Pool not accepting, skipping job");
            return;
        }
    };

    let outcome = match handle.await {
        Ok(Some(Ok(()))) => "success",
        Ok(Some(Err(e))) => {
            tracing::error!(job = name, error = %e, "Scheduled job failed");
            "failure"
        }
        Ok(None) => {
            tracing::warn!(job = name, "Scheduled job cancelled by shutdown");
            "cancelled"
        }
        Err(e) => {
            tracing::error!(job = name, error = %e, "Scheduled job panicked");
            "failure"
        }
    };
    metrics::counter!("scheduler_job_runs_total", "job" => name, "outcome" => outcome).increment(1);
}

// =============================================================================
// Scheduler
// =============================================================================

/// Cron scheduler bound to the worker pool.
pub struct PipelineScheduler {
    inner: JobScheduler,
    pool: WorkerPool,
    jobs: Vec<(&'static str, Uuid)>,
}

impl std::fmt::Debug for PipelineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineScheduler")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl PipelineScheduler {
    /// Create a stopped scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler cannot be initialized.
    pub async fn new(pool: WorkerPool) -> Result<Self, SchedulerError> {
        Ok(Self {
            inner: JobScheduler::new().await?,
            pool,
            jobs: Vec::new(),
        })
    }

    /// Register a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the cron expression is invalid or the scheduler
    /// rejects the job.
    pub async fn register(&mut self, spec: &JobSpec, body: JobBody) -> Result<Uuid, SchedulerError> {
        let name = spec.name;
        let pool = self.pool.clone();
        let job = Job::new_async_tz(spec.cron, spec.tz, move |_uuid, _lock| {
            let fired_at = Utc::now();
            let pool = pool.clone();
            let body = Arc::clone(&body);
            Box::pin(async move {
                tracing::debug!(job = name, %fired_at, "Running scheduled job");
                run_guarded(name, &pool, &body, fired_at).await;
            })
        })
        .map_err(|e| SchedulerError::JobCreation {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let id = self.inner.add(job).await?;
        tracing::info!(job = name, cron = spec.cron, tz = %spec.tz, "Registered scheduled job");
        self.jobs.push((name, id));
        Ok(id)
    }

    /// Register every enabled job of the pipeline table.
    ///
    /// # Errors
    ///
    /// Returns the first registration failure.
    pub async fn register_pipeline(
        &mut self,
        jobs: &PipelineJobs,
        settings: &SchedulerSettings,
    ) -> Result<usize, SchedulerError> {
        let mut registered = 0;
        for spec in job_table(settings.market_timezone) {
            if !settings.is_enabled(spec.name) {
                tracing::info!(job = spec.name, "Scheduled job disabled");
                continue;
            }
            if let Some(body) = jobs.body(spec.name) {
                self.register(&spec, body).await?;
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Registered job names.
    #[must_use]
    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|(name, _)| *name).collect()
    }

    /// Start firing jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler fails to start.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.inner.start().await?;
        tracing::info!(jobs = self.jobs.len(), "Scheduler started");
        Ok(())
    }

    /// Stop firing jobs. Runs already on the pool are left to the pool's drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler fails to stop.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        self.inner.shutdown().await?;
        tracing::info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn job_table_uses_market_timezone_for_market_jobs() {
        let table = job_table(chrono_tz::Asia::Taipei);
        assert_eq!(table.len(), 7);

        let tz_of = |name: &str| table.iter().find(|s| s.name == name).unwrap().tz;
        assert_eq!(tz_of(job_name::EQUITIES_POLL), chrono_tz::Asia::Taipei);
        assert_eq!(tz_of(job_name::STOCK_BACKFILL), chrono_tz::Asia::Taipei);
        assert_eq!(tz_of(job_name::CRYPTO_BACKFILL), chrono_tz::UTC);
        assert_eq!(tz_of(job_name::CURRENCY_REFRESH), chrono_tz::UTC);
        assert!(table.iter().all(|s| s.cron.split_whitespace().count() == 6));
    }

    #[tokio::test]
    async fn every_cron_expression_is_accepted() {
        for spec in job_table(chrono_tz::Asia::Taipei) {
            let job = Job::new_async_tz(spec.cron, spec.tz, |_uuid, _lock| Box::pin(async {}));
            assert!(job.is_ok(), "{} rejected: {}", spec.name, spec.cron);
        }
    }

    #[tokio::test]
    async fn guarded_run_swallows_errors_and_panics() {
        let pool = WorkerPool::new(2);
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&calls);
        let failing = job(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("source down")) }
        });
        run_guarded("failing", &pool, &failing, Utc::now()).await;

        let panicking = job(|_| async {
            if Utc::now().timestamp() > 0 {
                panic!("boom");
            }
            Ok::<(), anyhow::Error>(())
        });
        run_guarded("panicking", &pool, &panicking, Utc::now()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(pool.is_accepting());
    }

    #[tokio::test]
    async fn guarded_run_skips_after_pool_shutdown() {
        let pool = WorkerPool::new(1);
        pool.shutdown(std::time::Duration::from_millis(10)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let body = job(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), anyhow::Error>(()) }
        });
        run_guarded("late", &pool, &body, Utc::now()).await;

        // the body future is built before the pool refuses it, but never runs
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn body_sees_fire_time_even_when_queued() {
        use chrono::TimeZone;

        let pool = WorkerPool::new(1);
        let (release, hold) = tokio::sync::oneshot::channel::<()>();
        let busy = pool.spawn(async move { hold.await.is_ok() }).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let recorded = Arc::clone(&seen);
        let body = job(move |fired_at| {
            *recorded.lock() = Some(fired_at);
            async { Ok::<(), anyhow::Error>(()) }
        });

        // 13:50:00 Taipei, the start of a slow-window poll
        let fired_at = Utc.with_ymd_and_hms(2024, 3, 4, 5, 50, 0).unwrap();
        let run = tokio::spawn({
            let pool = pool.clone();
            async move { run_guarded("equities-poll", &pool, &body, fired_at).await }
        });
        tokio::task::yield_now().await;
        let _ = release.send(());

        run.await.unwrap();
        assert!(busy.await.unwrap().unwrap());
        assert_eq!(*seen.lock(), Some(fired_at));
    }
}
