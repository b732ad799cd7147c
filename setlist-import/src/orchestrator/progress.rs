//! Progress reporting seam between import phases and the status transport

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::ledger::{StatusLedger, StatusUpdate};
use crate::queue::JobContext;

/// Sink for phase progress
///
/// Phases never talk to the ledger or the queue directly. Reporting is
/// best-effort: a failed write is logged and the phase carries on.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, update: StatusUpdate);
}

/// Writes to the status ledger and mirrors progress onto the queue job
pub struct LedgerReporter<'a> {
    ledger: &'a StatusLedger,
    job_id: Uuid,
    job: Option<&'a JobContext>,
}

impl<'a> LedgerReporter<'a> {
    pub fn new(ledger: &'a StatusLedger, job_id: Uuid) -> Self {
        Self {
            ledger,
            job_id,
            job: None,
        }
    }

    pub fn for_job(ledger: &'a StatusLedger, ctx: &'a JobContext) -> Self {
        Self {
            ledger,
            job_id: ctx.job_id(),
            job: Some(ctx),
        }
    }
}

#[async_trait]
impl ProgressReporter for LedgerReporter<'_> {
    async fn report(&self, update: StatusUpdate) {
        if let Some(ctx) = self.job {
            if let Some(percent) = update.progress_percent {
                ctx.update_progress(percent);
            }
            if let Some(message) = &update.message {
                ctx.log(message.clone());
            }
        }

        if let Err(e) = self.ledger.update(self.job_id, update).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to record import progress");
        }
    }
}
