//! Gadget lifecycle engine
//!
//! Owns the personality state machine and arbitrates between the gadget and
//! the block device writer.
//!
//! ```text
//!             emulate_start                 keyboard_start
//!   Inactive ---------------> MassStorage   Inactive ----------> Keyboard
//!      ^                          |            ^                    |
//!      +------ emulate_stop ------+            +--- keyboard_stop --+
//!
//!   any stop that leaves the gadget bound --> Error --reset--> Inactive
//! ```
//!
//! Transitions are serialized by `transition`. Configfs work runs on the
//! blocking pool while that lock is held; the snapshot read by `status()` is
//! replaced in one assignment once a transition has finished.

use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::claims::ResourceClaims;
use super::state::{EngineState, GadgetState, LabStatus};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, LabEvent};
use crate::flash::{BlockDeviceWriter, JobHandle, WriteStatus};
use crate::hid::{keymap, HidKeyboardFunction, KeyEvent, KeyboardModifiers};
use crate::msd::{ImageSelection, MassStorageFunction};
use crate::otg::GadgetConfigStore;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    gadget: GadgetState,
    selection: Option<ImageSelection>,
}

/// USB gadget lifecycle and emulation engine
pub struct GadgetEngine {
    store: Arc<dyn GadgetConfigStore>,
    claims: ResourceClaims,
    events: EventBus,
    msd: MassStorageFunction,
    keyboard: HidKeyboardFunction,
    writer: BlockDeviceWriter,
    transition: tokio::sync::Mutex<()>,
    snapshot: RwLock<Snapshot>,
}

impl GadgetEngine {
    pub fn new(store: Arc<dyn GadgetConfigStore>, config: &AppConfig, events: EventBus) -> Self {
        let claims = ResourceClaims::new();
        Self {
            msd: MassStorageFunction::new(store.clone(), claims.clone(), config.msd.clone()),
            keyboard: HidKeyboardFunction::new(store.clone(), config.keyboard.clone()),
            writer: BlockDeviceWriter::new(config.writer.clone(), claims.clone(), events.clone()),
            store,
            claims,
            events,
            transition: tokio::sync::Mutex::new(()),
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn claims(&self) -> &ResourceClaims {
        &self.claims
    }

    pub fn gadget_state(&self) -> GadgetState {
        self.snapshot.read().gadget.clone()
    }

    pub fn selected_image(&self) -> Option<ImageSelection> {
        self.snapshot.read().selection.clone()
    }

    /// Non-blocking status snapshot
    pub fn status(&self) -> LabStatus {
        let snapshot = self.snapshot.read().clone();
        let last_job = self.writer.current();
        let writing = last_job.as_ref().is_some_and(|job| job.is_running());

        LabStatus {
            engine_state: EngineState::derive(&snapshot.gadget, writing),
            gadget_configured: snapshot.gadget.is_bound(),
            keyboard_active: matches!(snapshot.gadget, GadgetState::KeyboardActive),
            emulation_active: matches!(snapshot.gadget, GadgetState::MassStorageActive { .. }),
            selected_image: snapshot.selection,
            gadget_state: snapshot.gadget,
            write_progress: last_job.map(|job| job.progress()),
        }
    }

    /// Validate `path` and make it the selected image
    pub async fn select_image(&self, path: &Path) -> Result<ImageSelection> {
        let path = path.to_path_buf();
        let image = tokio::task::spawn_blocking(move || ImageSelection::open(&path))
            .await
            .map_err(|e| AppError::Internal(format!("Task join error: {}", e)))??;

        self.snapshot.write().selection = Some(image.clone());
        info!("Selected image {} ({})", image.name, image.size_display());
        self.events.publish(LabEvent::ImageSelected {
            name: image.name.clone(),
            path: image.path.display().to_string(),
            size: image.size,
        });
        Ok(image)
    }

    /// Present the selected image to the host
    pub async fn emulate_start(&self) -> Result<()> {
        let _guard = self.transition.lock().await;

        let image = self.selected_image().ok_or(AppError::NoImageSelected)?;
        self.ensure_idle()?;

        self.msd.activate(&image).await?;
        self.set_gadget(GadgetState::MassStorageActive { image });
        Ok(())
    }

    pub async fn emulate_stop(&self) -> Result<()> {
        let _guard = self.transition.lock().await;

        if !matches!(self.gadget_state(), GadgetState::MassStorageActive { .. }) {
            return Err(AppError::NotActive("mass storage emulation".to_string()));
        }

        self.msd.deactivate().await;
        let state = self.settle("mass storage").await;
        self.set_gadget(state);
        Ok(())
    }

    pub async fn keyboard_start(&self) -> Result<()> {
        let _guard = self.transition.lock().await;

        self.ensure_idle()?;
        self.keyboard.activate().await?;
        self.set_gadget(GadgetState::KeyboardActive);
        Ok(())
    }

    /// Stop the keyboard after an all-released report
    pub async fn keyboard_stop(&self) -> Result<()> {
        let _guard = self.transition.lock().await;

        if !matches!(self.gadget_state(), GadgetState::KeyboardActive) {
            return Err(AppError::NotActive("keyboard".to_string()));
        }

        self.keyboard.deactivate().await;
        let state = self.settle("keyboard").await;
        self.set_gadget(state);
        Ok(())
    }

    /// Forward a key event; serialized with `keyboard_stop` by the HID mutex
    pub fn send_key(&self, event: KeyEvent) -> Result<()> {
        self.keyboard.send_key(event)
    }

    /// Press and release a named key or combination such as `ctrl+alt+delete`
    pub fn press_key(&self, name: &str) -> Result<()> {
        if !self.keyboard.is_active() {
            return Err(AppError::NotActive("keyboard".to_string()));
        }
        let (code, modifiers) = keymap::parse_combo(name)
            .ok_or_else(|| AppError::NotFound(format!("Unknown key: {}", name)))?;
        self.tap_key(code, modifiers)
    }

    /// Press and release one usage code
    pub fn tap_key(&self, code: u8, modifiers: KeyboardModifiers) -> Result<()> {
        if !self.keyboard.is_active() {
            return Err(AppError::NotActive("keyboard".to_string()));
        }
        self.keyboard.tap(code, modifiers)
    }

    /// Type ASCII text; returns the number of characters sent
    pub async fn type_text(&self, text: &str) -> Result<usize> {
        self.keyboard.type_text(text).await
    }

    /// Write the selected image onto `device`
    pub async fn write(&self, device: &Path) -> Result<JobHandle> {
        let _guard = self.transition.lock().await;

        let image = self.selected_image().ok_or(AppError::NoImageSelected)?;
        self.writer.start(&image, device).await
    }

    /// Cancel the running write
    pub fn cancel_write(&self) -> Result<JobHandle> {
        let job = self
            .writer
            .running()
            .ok_or_else(|| AppError::NotActive("no write in progress".to_string()))?;
        job.cancel();
        info!("Cancelling write to {}", job.device.display());
        Ok(job)
    }

    /// Running write, if any
    pub fn running_write(&self) -> Option<JobHandle> {
        self.writer.running()
    }

    /// Clear whatever an earlier run left in the gadget tree
    pub async fn recover(&self) -> Result<GadgetState> {
        let _guard = self.transition.lock().await;
        self.recover_locked().await
    }

    /// Stop any personality and re-probe; the way out of `Error`
    pub async fn reset(&self) -> Result<GadgetState> {
        let _guard = self.transition.lock().await;

        self.stop_personalities().await;
        self.recover_locked().await
    }

    /// Stop everything before exit; waits for a running write to settle
    pub async fn shutdown(&self) {
        let _guard = self.transition.lock().await;

        self.stop_personalities().await;

        if let Some(job) = self.writer.running() {
            info!("Cancelling write to {} for shutdown", job.device.display());
            job.cancel();
            let status = job.wait().await;
            debug!("Write finished during shutdown: {}", status.as_str());
        }

        if let Err(e) = self.recover_locked().await {
            warn!("Gadget cleanup on shutdown failed: {}", e);
        }
        info!("Engine shut down");
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.gadget_state() {
            GadgetState::Inactive => Ok(()),
            GadgetState::MassStorageActive { image } => Err(AppError::AlreadyActive(format!(
                "mass storage is emulating {}",
                image.name
            ))),
            GadgetState::KeyboardActive => {
                Err(AppError::AlreadyActive("keyboard is active".to_string()))
            }
            GadgetState::Error { reason } => Err(AppError::GadgetConfig(format!(
                "gadget is in error state ({}), run 'reset'",
                reason
            ))),
        }
    }

    async fn stop_personalities(&self) {
        if self.keyboard.is_active() {
            self.keyboard.deactivate().await;
        }
        if self.msd.is_active() {
            self.msd.deactivate().await;
        }
    }

    /// State after a personality has been torn down
    async fn settle(&self, what: &str) -> GadgetState {
        if self.store_is_bound().await {
            let reason = format!("gadget still bound after stopping {}", what);
            warn!("{}", reason);
            GadgetState::Error { reason }
        } else {
            GadgetState::Inactive
        }
    }

    async fn store_is_bound(&self) -> bool {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.is_bound()).await {
            Ok(bound) => bound,
            Err(e) => {
                warn!("UDC state check failed: {}", e);
                true
            }
        }
    }

    async fn recover_locked(&self) -> Result<GadgetState> {
        let store = self.store.clone();
        let cleared = tokio::task::spawn_blocking(move || {
            let stale = store.probe();
            for handle in &stale {
                info!("Clearing stale gadget function {}", handle.name);
                store.unbind(handle);
                store.destroy_function(handle);
            }
            if store.is_bound() {
                store.release_udc();
            }
            stale.len()
        })
        .await
        .map_err(|e| AppError::Internal(format!("Task join error: {}", e)))?;

        if cleared > 0 {
            info!("Cleared {} stale gadget function(s)", cleared);
        }

        let state = self.settle("recovery").await;
        self.set_gadget(state.clone());
        Ok(state)
    }

    fn set_gadget(&self, state: GadgetState) {
        let event = LabEvent::GadgetStateChanged {
            state: state.as_str().to_string(),
            image: match &state {
                GadgetState::MassStorageActive { image } => Some(image.name.clone()),
                _ => None,
            },
            reason: match &state {
                GadgetState::Error { reason } => Some(reason.clone()),
                _ => None,
            },
        };

        let next = state.as_str();
        let previous = std::mem::replace(&mut self.snapshot.write().gadget, state);
        if previous.as_str() != next {
            info!("Gadget state: {} -> {}", previous.as_str(), next);
        }
        self.events.publish(event);
    }
}

/// Outcome of a finished write, for display
pub fn describe_write(status: &WriteStatus, bytes: u64) -> String {
    match status {
        WriteStatus::Running => format!("running, {} bytes written", bytes),
        WriteStatus::Completed => format!("completed, {} bytes written", bytes),
        WriteStatus::Cancelled => format!("cancelled after {} bytes", bytes),
        WriteStatus::Failed(reason) => format!("failed after {} bytes: {}", bytes, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::claims::ClaimRole;
    use crate::otg::store::testing::FakeStore;
    use crate::otg::FunctionKind;
    use std::fs;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    struct Fixture {
        dir: TempDir,
        store: Arc<FakeStore>,
        engine: GadgetEngine,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_chunk_size(64 * 1024)
        }

        fn with_chunk_size(chunk_size: usize) -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(FakeStore::new());
            let mut config = AppConfig::default();
            config.keyboard.key_delay_ms = 0;
            config.writer.chunk_size = chunk_size;
            let engine = GadgetEngine::new(store.clone(), &config, EventBus::new());
            Self { dir, store, engine }
        }

        fn file(&self, name: &str, len: usize) -> std::path::PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, (0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>()).unwrap();
            path
        }
    }

    #[tokio::test]
    async fn test_emulate_without_selection() {
        let f = Fixture::new();

        let err = f.engine.emulate_start().await.unwrap_err();
        assert_eq!(err.code(), "no_image_selected");

        let status = f.engine.status();
        assert_eq!(status.gadget_state, GadgetState::Inactive);
        assert!(!status.gadget_configured);
        assert!(f.store.functions().is_empty());
    }

    #[tokio::test]
    async fn test_emulate_lifecycle() {
        let f = Fixture::new();
        let iso = f.file("debian.iso", 4096);
        let mut rx = f.engine.events().subscribe();

        let image = f.engine.select_image(&iso).await.unwrap();
        assert_ok!(f.engine.emulate_start().await);

        let status = f.engine.status();
        assert_eq!(status.engine_state, EngineState::MassStorageRunning);
        assert!(status.emulation_active);
        assert!(!status.keyboard_active);
        assert_eq!(f.engine.claims().holders(&image.path), vec![ClaimRole::Backing]);

        assert_ok!(f.engine.emulate_stop().await);
        assert_eq!(f.engine.gadget_state(), GadgetState::Inactive);
        assert!(f.engine.claims().is_empty());
        assert_eq!(f.engine.emulate_stop().await.unwrap_err().code(), "not_active");

        assert!(matches!(rx.recv().await.unwrap(), LabEvent::ImageSelected { .. }));
        match rx.recv().await.unwrap() {
            LabEvent::GadgetStateChanged { state, image, .. } => {
                assert_eq!(state, "mass_storage");
                assert_eq!(image.as_deref(), Some("debian.iso"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_personality() {
        let f = Fixture::new();
        let iso = f.file("debian.iso", 4096);
        f.engine.select_image(&iso).await.unwrap();
        f.engine.emulate_start().await.unwrap();

        let err = f.engine.keyboard_start().await.unwrap_err();
        assert_eq!(err.code(), "already_active");
        assert!(matches!(
            f.engine.gadget_state(),
            GadgetState::MassStorageActive { .. }
        ));
        assert_eq!(f.store.functions().len(), 1);

        let err = f.engine.emulate_start().await.unwrap_err();
        assert_eq!(err.code(), "already_active");
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_inactive() {
        let f = Fixture::new();
        let iso = f.file("debian.iso", 4096);
        f.engine.select_image(&iso).await.unwrap();
        f.store.fail_bind(true);

        let err = f.engine.emulate_start().await.unwrap_err();
        assert_eq!(err.code(), "bind");
        assert_eq!(f.engine.gadget_state(), GadgetState::Inactive);
        assert!(f.engine.claims().is_empty());
        assert!(f.store.functions().is_empty());

        f.store.fail_bind(false);
        assert_ok!(f.engine.emulate_start().await);
    }

    #[tokio::test]
    async fn test_keyboard_stop_sends_release() {
        let f = Fixture::new();
        f.engine.keyboard_start().await.unwrap();
        assert_eq!(f.engine.status().engine_state, EngineState::KeyboardRunning);

        f.engine
            .send_key(KeyEvent::down(0x04, KeyboardModifiers::shift()))
            .unwrap();
        assert_eq!(f.store.hid_output(), vec![0x02, 0, 0x04, 0, 0, 0, 0, 0]);

        f.engine.keyboard_stop().await.unwrap();
        let output = f.store.hid_output();
        assert_eq!(output.len(), 16);
        assert!(output[8..].iter().all(|b| *b == 0));
        assert_eq!(f.engine.gadget_state(), GadgetState::Inactive);

        let err = f.engine.send_key(KeyEvent::down(0x04, KeyboardModifiers::default()));
        assert_eq!(err.unwrap_err().code(), "not_active");
    }

    #[tokio::test]
    async fn test_press_key_and_type() {
        let f = Fixture::new();
        assert_eq!(f.engine.press_key("enter").unwrap_err().code(), "not_active");

        f.engine.keyboard_start().await.unwrap();
        f.engine.press_key("ctrl+alt+delete").unwrap();
        assert_eq!(f.engine.press_key("hyper").unwrap_err().code(), "not_found");

        assert_eq!(f.engine.type_text("ls\n").await.unwrap(), 3);
        assert_eq!(f.engine.status().write_progress, None);
        f.engine.keyboard_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tap_key_writes_press_and_release() {
        let f = Fixture::new();
        let err = f.engine.tap_key(0x04, KeyboardModifiers::default()).unwrap_err();
        assert_eq!(err.code(), "not_active");
        assert!(f.store.hid_output().is_empty());

        f.engine.keyboard_start().await.unwrap();
        f.engine.tap_key(0x06, KeyboardModifiers::shift()).unwrap();
        assert_eq!(
            f.store.hid_output(),
            vec![0x02, 0, 0x06, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        f.engine.keyboard_stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_conflicts_with_backing() {
        let f = Fixture::new();
        let iso = f.file("debian.iso", 200_000);
        let other = f.file("sdb", 400_000);
        f.engine.select_image(&iso).await.unwrap();
        f.engine.emulate_start().await.unwrap();

        let err = f.engine.write(&iso).await.err().unwrap();
        assert_eq!(err.code(), "device_busy");
        assert!(matches!(
            f.engine.gadget_state(),
            GadgetState::MassStorageActive { .. }
        ));

        let job = f.engine.write(&other).await.unwrap();
        assert_eq!(job.wait().await, WriteStatus::Completed);
        assert_eq!(job.bytes_written(), 200_000);
        assert_eq!(fs::read(&other).unwrap()[..200_000], fs::read(&iso).unwrap()[..]);

        let status = f.engine.status();
        assert_eq!(status.engine_state, EngineState::MassStorageRunning);
        assert_eq!(
            status.write_progress.map(|p| p.status),
            Some(WriteStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_write_requires_selection() {
        let f = Fixture::new();
        let device = f.file("sdb", 1024);
        let err = f.engine.write(&device).await.err().unwrap();
        assert_eq!(err.code(), "no_image_selected");
        assert_eq!(f.engine.cancel_write().err().unwrap().code(), "not_active");
    }

    #[tokio::test]
    async fn test_cancel_write_keeps_prefix() {
        const CHUNK: usize = 4096;
        let f = Fixture::with_chunk_size(CHUNK);
        let iso = f.file("big.iso", 64 * 1024 * 1024);
        let device = f.dir.path().join("sdb");
        fs::write(&device, vec![0u8; 64 * 1024 * 1024 + CHUNK]).unwrap();
        f.engine.select_image(&iso).await.unwrap();

        let job = f.engine.write(&device).await.unwrap();
        assert_eq!(f.engine.status().engine_state, EngineState::Writing);

        let mut samples = Vec::new();
        for _ in 0..3 {
            samples.push(job.progress().bytes_written);
        }
        let cancelled = f.engine.cancel_write().unwrap();
        assert_eq!(cancelled.id, job.id);

        assert_eq!(job.wait().await, WriteStatus::Cancelled);
        let written = job.bytes_written();
        samples.push(job.progress().bytes_written);
        assert!(samples.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*samples.last().unwrap(), written);

        assert!(written < 64 * 1024 * 1024);
        assert_eq!(written as usize % CHUNK, 0);
        let source = fs::read(&iso).unwrap();
        let target = fs::read(&device).unwrap();
        assert_eq!(target[..written as usize], source[..written as usize]);
        assert!(target[written as usize..].iter().all(|b| *b == 0));

        assert!(f.engine.claims().is_empty());
        assert!(f.engine.running_write().is_none());
        assert_eq!(f.engine.cancel_write().err().unwrap().code(), "not_active");
        assert_eq!(
            f.engine.status().write_progress.map(|p| p.status),
            Some(WriteStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_rejected_configuration_leaves_state() {
        let f = Fixture::new();
        let iso = f.file("debian.iso", 4096);
        let image = f.engine.select_image(&iso).await.unwrap();
        f.store.fail_create(true);

        let err = f.engine.keyboard_start().await.unwrap_err();
        assert_eq!(err.code(), "gadget_config");
        assert_eq!(f.engine.gadget_state(), GadgetState::Inactive);

        let err = f.engine.emulate_start().await.unwrap_err();
        assert_eq!(err.code(), "gadget_config");
        assert_eq!(f.engine.gadget_state(), GadgetState::Inactive);
        assert_eq!(f.engine.selected_image(), Some(image));
        assert!(f.engine.claims().is_empty());
        assert!(f.store.functions().is_empty());
        assert!(!f.store.is_bound());
        assert!(!f.engine.status().gadget_configured);

        f.store.fail_create(false);
        assert_ok!(f.engine.keyboard_start().await);
    }

    #[tokio::test]
    async fn test_recover_clears_stale_binding() {
        let f = Fixture::new();
        f.store
            .seed_stale("mass_storage.usb0", FunctionKind::MassStorage, true);

        let state = f.engine.recover().await.unwrap();
        assert_eq!(state, GadgetState::Inactive);
        assert!(f.store.functions().is_empty());
        assert!(!f.store.is_bound());
    }

    #[tokio::test]
    async fn test_stuck_binding_enters_error_until_reset() {
        let f = Fixture::new();
        f.engine.keyboard_start().await.unwrap();
        f.store.stuck_bound(true);

        f.engine.keyboard_stop().await.unwrap();
        assert!(matches!(f.engine.gadget_state(), GadgetState::Error { .. }));
        let status = f.engine.status();
        assert_eq!(status.engine_state, EngineState::Idle);
        assert!(status.gadget_configured);
        assert!(!status.keyboard_active);

        let err = f.engine.keyboard_start().await.unwrap_err();
        assert_eq!(err.code(), "gadget_config");

        let state = f.engine.reset().await.unwrap();
        assert!(matches!(state, GadgetState::Error { .. }));

        f.store.stuck_bound(false);
        assert_eq!(f.engine.reset().await.unwrap(), GadgetState::Inactive);
        assert_ok!(f.engine.keyboard_start().await);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let f = Fixture::new();
        let iso = f.file("debian.iso", 4096);
        f.engine.select_image(&iso).await.unwrap();
        f.engine.emulate_start().await.unwrap();

        f.engine.shutdown().await;
        assert_eq!(f.engine.gadget_state(), GadgetState::Inactive);
        assert!(f.store.functions().is_empty());
        assert!(f.engine.claims().is_empty());
        assert!(f.engine.running_write().is_none());
    }

    #[test]
    fn test_describe_write() {
        assert_eq!(
            describe_write(&WriteStatus::Cancelled, 512),
            "cancelled after 512 bytes"
        );
        assert!(describe_write(&WriteStatus::Failed("EIO".into()), 0).contains("EIO"));
    }
}
