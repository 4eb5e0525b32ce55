//! Lab tool event types

use serde::{Deserialize, Serialize};

/// Events broadcast by the engine and the writer
///
/// Serialized as `{"event": "gadget.state_changed", "data": {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum LabEvent {
    /// Gadget personality changed
    #[serde(rename = "gadget.state_changed")]
    GadgetStateChanged {
        /// "inactive", "mass_storage", "keyboard" or "error"
        state: String,
        /// Backing image while mass storage is active
        #[serde(skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        /// Reason while in error
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "image.selected")]
    ImageSelected { name: String, path: String, size: u64 },

    #[serde(rename = "write.started")]
    WriteStarted {
        job_id: String,
        device: String,
        source: String,
        total_bytes: u64,
    },

    /// Throttled progress update
    #[serde(rename = "write.progress")]
    WriteProgress {
        job_id: String,
        bytes_written: u64,
        total_bytes: u64,
    },

    #[serde(rename = "write.finished")]
    WriteFinished {
        job_id: String,
        /// "completed", "failed" or "cancelled"
        status: String,
        bytes_written: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl LabEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::GadgetStateChanged { .. } => "gadget.state_changed",
            Self::ImageSelected { .. } => "image.selected",
            Self::WriteStarted { .. } => "write.started",
            Self::WriteProgress { .. } => "write.progress",
            Self::WriteFinished { .. } => "write.finished",
        }
    }
}
