use crate::activity_log::ActivityLog;
use crate::cloud_client::CloudClient;
use crate::errors::FetchError;
use crate::printer::PrintTransport;
use crate::queue::{record_id, PrintJob};
use crate::routing::{partition_by_target, PrinterQueue};
use crate::sentry_init;
use crate::status::{ConnectionState, ConnectionStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one fetch cycle as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Ok,
    /// The cloud rejected the store token. The session must stop.
    AuthError,
}

/// Pulls pending jobs and prints them, one sequential queue per printer.
pub struct JobDispatcher {
    cloud: Arc<CloudClient>,
    transport: Arc<dyn PrintTransport>,
    status: ConnectionStatus,
    log: ActivityLog,
    print_timeout: Duration,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag however the cycle ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl JobDispatcher {
    pub fn new(
        cloud: Arc<CloudClient>,
        transport: Arc<dyn PrintTransport>,
        status: ConnectionStatus,
        log: ActivityLog,
        print_timeout: Duration,
    ) -> Self {
        Self {
            cloud,
            transport,
            status,
            log,
            print_timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run one fetch-and-print cycle.
    ///
    /// Overlapping calls are no-ops returning `Ok`. Print failures never
    /// surface here; they are acknowledged to the cloud per job.
    pub async fn fetch_and_print(&self) -> FetchOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Fetch cycle already running, skipping");
            return FetchOutcome::Ok;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let records = match self.cloud.fetch_pending_jobs().await {
            Ok(records) => records,
            Err(FetchError::Auth(code)) => {
                self.log.error(format!("Store token rejected (HTTP {}), stopping", code));
                self.status.transition(ConnectionState::Offline);
                return FetchOutcome::AuthError;
            }
            Err(e) => {
                warn!("Fetch failed, will retry on next tick: {}", e);
                self.status.transition(ConnectionState::Reconnecting);
                return FetchOutcome::Ok;
            }
        };

        self.status.fetch_succeeded();
        if records.is_empty() {
            return FetchOutcome::Ok;
        }

        let jobs = self.parse_records(records).await;
        if jobs.is_empty() {
            return FetchOutcome::Ok;
        }

        let queues = partition_by_target(jobs);
        info!("Dispatching {} job queue(s)", queues.len());
        futures_util::future::join_all(queues.into_iter().map(|queue| self.drain_queue(queue))).await;

        FetchOutcome::Ok
    }

    async fn parse_records(&self, records: Vec<serde_json::Value>) -> Vec<PrintJob> {
        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            match PrintJob::from_record(&record) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!("Skipping malformed job: {}", e);
                    if let Some(id) = record_id(&record) {
                        self.log.error(format!("Job {} rejected: {}", id, e));
                        if let Err(ack) = self.cloud.mark_error(&id, &e.to_string()).await {
                            debug!("Error ack for job {} lost: {}", id, ack);
                        }
                    }
                }
            }
        }
        jobs
    }

    /// Print one printer's jobs strictly in order. A failed job does not
    /// stop the ones behind it.
    async fn drain_queue(&self, queue: PrinterQueue) {
        let target = queue.target;
        for job in queue.jobs {
            match self.transport.send(&target, &job.payload, self.print_timeout).await {
                Ok(()) => {
                    self.log.ok(format!("Printed job {} on {}", job.id, target));
                    if let Err(e) = self.cloud.mark_printed(&job.id).await {
                        // Job stays pending in the cloud and may print again next cycle.
                        debug!("Printed ack for job {} lost: {}", job.id, e);
                    }
                }
                Err(e) => {
                    self.log.error(format!("Job {} failed on {}: {}", job.id, target, e));
                    sentry_init::capture_print_failure(&job.id, &target.key(), &e);
                    if let Err(ack) = self.cloud.mark_error(&job.id, &e.to_string()).await {
                        debug!("Error ack for job {} lost: {}", job.id, ack);
                    }
                }
            }
        }
    }
}
