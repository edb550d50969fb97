use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fraction of expected units that moves a `pending` batch to `partial_complete`.
pub const PARTIAL_THRESHOLD: f64 = 0.5;
/// Fraction of expected units that completes the first stage.
pub const FULL_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    PartialComplete,
    Complete,
    AudioRequested,
    AudioComplete,
    AudioFailed,
    Failed,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 7] = [
        BatchStatus::Pending,
        BatchStatus::PartialComplete,
        BatchStatus::Complete,
        BatchStatus::AudioRequested,
        BatchStatus::AudioComplete,
        BatchStatus::AudioFailed,
        BatchStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::PartialComplete => "partial_complete",
            BatchStatus::Complete => "complete",
            BatchStatus::AudioRequested => "audio_requested",
            BatchStatus::AudioComplete => "audio_complete",
            BatchStatus::AudioFailed => "audio_failed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        BatchStatus::ALL.into_iter().find(|st| st.as_str() == s)
    }

    /// Column stamped when a batch enters this status. `Pending` is stamped at creation.
    pub fn timestamp_column(&self) -> Option<&'static str> {
        match self {
            BatchStatus::Pending => None,
            BatchStatus::PartialComplete => Some("partial_completed_at"),
            BatchStatus::Complete => Some("completed_at"),
            BatchStatus::AudioRequested => Some("audio_requested_at"),
            BatchStatus::AudioComplete => Some("audio_completed_at"),
            BatchStatus::AudioFailed => Some("audio_failed_at"),
            BatchStatus::Failed => Some("failed_at"),
        }
    }

    /// Statuses after which the second-stage worker has already been engaged
    /// for the batch as a whole.
    pub fn audio_engaged(&self) -> bool {
        matches!(
            self,
            BatchStatus::AudioRequested | BatchStatus::AudioComplete | BatchStatus::AudioFailed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::AudioComplete | BatchStatus::AudioFailed)
    }

    /// The lifecycle edge table. Any edge not listed here is never attempted.
    ///
    /// `audio_failed` is reachable from every state except `audio_complete`
    /// (including itself): permanent artifact failures are last-writer-wins.
    pub fn can_transition_to(&self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        match (self, to) {
            (Pending, PartialComplete) => true,
            (Pending | PartialComplete, Complete) => true,
            (PartialComplete | Complete, AudioRequested) => true,
            (AudioRequested | Complete, AudioComplete) => true,
            (Pending | PartialComplete, Failed) => true,
            (Failed, Complete | AudioComplete) => true,
            (AudioComplete, AudioFailed) => false,
            (_, AudioFailed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Retrying,
    Success,
    Failed,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::Retrying => "retrying",
            RetryStatus::Success => "success",
            RetryStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RetryStatus::Pending),
            "retrying" => Some(RetryStatus::Retrying),
            "success" => Some(RetryStatus::Success),
            "failed" => Some(RetryStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub expected_count: i64,
    pub received_count: i64,
    pub status: BatchStatus,
    pub user_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub partial_completed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub audio_requested_at: Option<DateTime<Utc>>,
    pub audio_completed_at: Option<DateTime<Utc>>,
    pub audio_failed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub audio_url: Option<String>,
    pub failure_reason: Option<String>,
}

impl Batch {
    pub fn completion_ratio(&self) -> f64 {
        completion_ratio(self.received_count, self.expected_count)
    }
}

pub fn completion_ratio(received: i64, expected: i64) -> f64 {
    if expected <= 0 {
        return 0.0;
    }
    received as f64 / expected as f64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: String,
    pub batch_id: String,
    pub user_id: String,
    pub content: String,
    pub artifact_generated: bool,
    pub artifact_url: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub id: i64,
    pub batch_id: String,
    pub unit_id: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub status: RetryStatus,
    pub last_error: Option<String>,
    pub next_retry_at: DateTime<Utc>,
}
