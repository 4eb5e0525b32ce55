//! Gadget and engine state

use serde::Serialize;

use crate::flash::WriteProgress;
use crate::msd::ImageSelection;

/// What the gadget currently exposes to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GadgetState {
    #[default]
    Inactive,
    MassStorageActive { image: ImageSelection },
    KeyboardActive,
    /// The hardware could not be returned to an unbound state
    Error { reason: String },
}

impl GadgetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GadgetState::Inactive => "inactive",
            GadgetState::MassStorageActive { .. } => "mass_storage",
            GadgetState::KeyboardActive => "keyboard",
            GadgetState::Error { .. } => "error",
        }
    }

    /// Whether the gadget is attached to the UDC in this state
    ///
    /// `Error` counts: it is only entered while a binding survives cleanup.
    pub fn is_bound(&self) -> bool {
        !matches!(self, GadgetState::Inactive)
    }
}

/// Coarse engine state; `Writing` wins whenever a job is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    MassStorageRunning,
    KeyboardRunning,
    Writing,
}

impl EngineState {
    pub fn derive(gadget: &GadgetState, writing: bool) -> Self {
        if writing {
            return EngineState::Writing;
        }
        match gadget {
            GadgetState::MassStorageActive { .. } => EngineState::MassStorageRunning,
            GadgetState::KeyboardActive => EngineState::KeyboardRunning,
            GadgetState::Inactive | GadgetState::Error { .. } => EngineState::Idle,
        }
    }
}

/// Status snapshot returned by `GadgetEngine::status`
#[derive(Debug, Clone, Serialize)]
pub struct LabStatus {
    pub selected_image: Option<ImageSelection>,
    pub gadget_state: GadgetState,
    pub engine_state: EngineState,
    /// The gadget is bound to the UDC, including a stale binding in `Error`
    pub gadget_configured: bool,
    pub keyboard_active: bool,
    pub emulation_active: bool,
    /// Running job, or the last one to finish
    pub write_progress: Option<WriteProgress>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn image() -> ImageSelection {
        ImageSelection {
            path: PathBuf::from("/srv/debian.iso"),
            name: "debian.iso".to_string(),
            size: 2048,
        }
    }

    #[test]
    fn test_engine_state_derivation() {
        let msd = GadgetState::MassStorageActive { image: image() };
        assert_eq!(EngineState::derive(&msd, false), EngineState::MassStorageRunning);
        assert_eq!(EngineState::derive(&msd, true), EngineState::Writing);
        assert_eq!(
            EngineState::derive(&GadgetState::KeyboardActive, false),
            EngineState::KeyboardRunning
        );
        assert_eq!(
            EngineState::derive(&GadgetState::Error { reason: "x".into() }, false),
            EngineState::Idle
        );
    }

    #[test]
    fn test_gadget_state_json() {
        let json = serde_json::to_value(GadgetState::MassStorageActive { image: image() }).unwrap();
        assert_eq!(json["state"], "mass_storage_active");
        assert_eq!(json["image"]["name"], "debian.iso");

        let json = serde_json::to_value(GadgetState::Inactive).unwrap();
        assert_eq!(json["state"], "inactive");
        assert!(!GadgetState::Inactive.is_bound());
        let error = GadgetState::Error { reason: "x".into() };
        assert!(error.is_bound());
    }
}
