//! Write job data types

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

/// Write job status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum WriteStatus {
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl WriteStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, WriteStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStatus::Running => "running",
            WriteStatus::Completed => "completed",
            WriteStatus::Failed(_) => "failed",
            WriteStatus::Cancelled => "cancelled",
        }
    }
}

/// Snapshot of a job's progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteProgress {
    pub job_id: Uuid,
    pub device: PathBuf,
    /// Source image name
    pub source: String,
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub status: WriteStatus,
    pub started_at: DateTime<Utc>,
}

impl WriteProgress {
    /// Completion percentage (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.bytes_written as f64 / self.total_bytes as f64 * 100.0
    }

    /// Average throughput since start, in bytes per second
    pub fn bytes_per_sec(&self) -> f64 {
        let elapsed = (Utc::now() - self.started_at).num_milliseconds().max(1) as f64 / 1000.0;
        self.bytes_written as f64 / elapsed
    }
}
