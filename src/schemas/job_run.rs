//! JobRun Schema
//!
//! Ephemeral summary of one scheduler tick, emitted for observability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TickTrigger {
    Startup,
    Interval,
    Manual,
    Seed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SourceStatus {
    Succeeded { records: usize },
    Failed { kind: String, reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceOutcome {
    pub source: String,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub duration_ms: u64,
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, SourceStatus::Succeeded { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, SourceStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub run_id: uuid::Uuid,
    pub trigger: TickTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<SourceOutcome>,
    pub fetched: usize,
    pub rejected: usize,
    pub superseded: usize,
    pub inserted: usize,
    pub updated: usize,
    pub persisted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
    pub used_fallback: bool,
}

impl JobRun {
    pub fn start(trigger: TickTrigger) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
            fetched: 0,
            rejected: 0,
            superseded: 0,
            inserted: 0,
            updated: 0,
            persisted: 0,
            persist_error: None,
            used_fallback: false,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn attempted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o.status, SourceStatus::Skipped { .. }))
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    pub fn outcome(&self, source: &str) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.source == source)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|finished| (finished - self.started_at).num_milliseconds())
    }
}
