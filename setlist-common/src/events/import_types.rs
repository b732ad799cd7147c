//! Import progress type definitions
//!
//! Payload types shared between the import pipeline (writer) and progress
//! subscribers (SSE endpoints, UI).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stage of an artist import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportStage {
    Initializing,
    SyncingIdentifiers,
    ImportingShows,
    ImportingSongs,
    CreatingSetlists,
    Completed,
    Failed,
}

impl ImportStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStage::Initializing => "initializing",
            ImportStage::SyncingIdentifiers => "syncing-identifiers",
            ImportStage::ImportingShows => "importing-shows",
            ImportStage::ImportingSongs => "importing-songs",
            ImportStage::CreatingSetlists => "creating-setlists",
            ImportStage::Completed => "completed",
            ImportStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStage::Completed | ImportStage::Failed)
    }

    /// Non-terminal stages in execution order
    pub fn pipeline() -> [ImportStage; 5] {
        [
            ImportStage::Initializing,
            ImportStage::SyncingIdentifiers,
            ImportStage::ImportingShows,
            ImportStage::ImportingSongs,
            ImportStage::CreatingSetlists,
        ]
    }
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(ImportStage::Initializing),
            "syncing-identifiers" => Ok(ImportStage::SyncingIdentifiers),
            "importing-shows" => Ok(ImportStage::ImportingShows),
            "importing-songs" => Ok(ImportStage::ImportingSongs),
            "creating-setlists" => Ok(ImportStage::CreatingSetlists),
            "completed" => Ok(ImportStage::Completed),
            "failed" => Ok(ImportStage::Failed),
            other => Err(format!("unknown import stage: {other}")),
        }
    }
}

/// Aggregate counts for the imported artist
///
/// `None` means "not known yet"; merging never replaces a known count with
/// an unknown one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportTotals {
    pub songs: Option<u32>,
    pub shows: Option<u32>,
    pub venues: Option<u32>,
}

impl ImportTotals {
    pub fn merge(&mut self, other: &ImportTotals) {
        if other.songs.is_some() {
            self.songs = other.songs;
        }
        if other.shows.is_some() {
            self.shows = other.shows;
        }
        if other.venues.is_some() {
            self.venues = other.venues;
        }
    }
}

/// How a phase ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum PhaseOutcome {
    Completed,
    /// Phase intentionally not run (e.g. no catalog cross-reference)
    Skipped { reason: String },
    /// Phase attempted and failed upstream
    Failed { reason: String },
}

/// Current progress of one import run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStatus {
    pub job_id: Uuid,
    pub artist_id: Option<Uuid>,
    pub attraction_id: Option<String>,
    pub stage: ImportStage,
    /// 0-100, non-decreasing until a failure
    pub progress_percent: u8,
    pub message: String,
    pub error: Option<String>,
    pub totals: ImportTotals,
    /// Phase name → duration in milliseconds
    pub phase_timings: BTreeMap<String, u64>,
    pub phase_outcomes: BTreeMap<String, PhaseOutcome>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportStatus {
    pub fn new(job_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            artist_id: None,
            attraction_id: None,
            stage: ImportStage::Initializing,
            progress_percent: 0,
            message: "Initializing...".to_string(),
            error: None,
            totals: ImportTotals::default(),
            phase_timings: BTreeMap::new(),
            phase_outcomes: BTreeMap::new(),
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}
