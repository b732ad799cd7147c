//! Queue job types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use setlist_common::config::BackoffSettings;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const ARTIST_IMPORT_QUEUE: &str = "artist-import";
pub const ARTIST_SYNC_QUEUE: &str = "artist-sync";
pub const CATALOG_SYNC_QUEUE: &str = "catalog-sync";
pub const VENUE_SYNC_QUEUE: &str = "venue-sync";

/// Work carried by a queued job
///
/// Every variant is handled exhaustively by the orchestrator's job handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ImportJobKind {
    /// Background phases of a full import started by `start_import`
    ArtistImport {
        attraction_id: String,
        artist_id: Uuid,
        admin_import: bool,
        user_id: Option<String>,
    },
    /// Shows, catalog and setlists for an existing artist
    ArtistSync { artist_id: Uuid },
    /// Catalog phase only, queued after a partial import
    CatalogSync { artist_id: Uuid },
    /// Resolve venues deferred by the shows phase
    VenueSync {
        artist_id: Uuid,
        venue_external_ids: Vec<String>,
    },
}

impl ImportJobKind {
    /// Queue this kind of job runs on
    pub fn queue_name(&self) -> &'static str {
        match self {
            ImportJobKind::ArtistImport { .. } => ARTIST_IMPORT_QUEUE,
            ImportJobKind::ArtistSync { .. } => ARTIST_SYNC_QUEUE,
            ImportJobKind::CatalogSync { .. } => CATALOG_SYNC_QUEUE,
            ImportJobKind::VenueSync { .. } => VENUE_SYNC_QUEUE,
        }
    }

    pub fn artist_id(&self) -> Uuid {
        match self {
            ImportJobKind::ArtistImport { artist_id, .. }
            | ImportJobKind::ArtistSync { artist_id }
            | ImportJobKind::CatalogSync { artist_id }
            | ImportJobKind::VenueSync { artist_id, .. } => *artist_id,
        }
    }
}

/// Priority tier; lower value runs first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Admin-triggered imports
    Critical,
    /// User-triggered imports
    High,
    #[default]
    Normal,
    /// Scheduled bulk syncs
    Low,
}

impl JobPriority {
    pub fn value(&self) -> i32 {
        match self {
            JobPriority::Critical => 1,
            JobPriority::High => 5,
            JobPriority::Normal => 10,
            JobPriority::Low => 20,
        }
    }

    pub fn from_value(value: i32) -> Self {
        match value {
            v if v <= 1 => JobPriority::Critical,
            v if v <= 5 => JobPriority::High,
            v if v <= 10 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Per-job overrides of the queue defaults
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: JobPriority,
    /// Not eligible to run before `now + delay`
    pub delay: Duration,
    /// Overrides the queue's default `attempts`
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffSettings>,
    /// Caller-chosen id, used to key the import status record
    pub job_id: Option<Uuid>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// Inspectable state of a queued job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJobRecord {
    pub job_id: Uuid,
    pub queue: String,
    pub kind: ImportJobKind,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffSettings,
    /// Handler-reported progress, 0-100
    pub progress: u8,
    /// Append-only handler log lines
    pub logs: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueJobRecord {
    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }
}

/// Job totals per state for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}
