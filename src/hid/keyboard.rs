//! Virtual keyboard personality
//!
//! Creates a boot-protocol HID function, waits for its `/dev/hidgN` node and
//! writes 8-byte reports to it. One mutex guards the device handle and the
//! report state, so at most one report is in flight and a stop can never race
//! a keystroke.
//!
//! Error handling follows the usual hidg behaviour:
//! - ESHUTDOWN: the endpoint went away (host reset, re-enumeration); the
//!   handle is closed and reopened on the next report.
//! - EAGAIN: the host has not picked up the previous report; reported as busy.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::keymap;
use super::types::{KeyEvent, KeyEventType, KeyboardModifiers, KeyboardReport};
use crate::config::KeyboardConfig;
use crate::error::{AppError, Result};
use crate::otg::{FunctionHandle, FunctionSpec, GadgetConfigStore};

#[derive(Default)]
struct KeyboardInner {
    /// Present while the personality is active
    handle: Option<FunctionHandle>,
    device: Option<File>,
    report: KeyboardReport,
    /// Last report the device accepted
    last_sent: Option<[u8; 8]>,
}

/// HID keyboard personality
pub struct HidKeyboardFunction {
    store: Arc<dyn GadgetConfigStore>,
    config: KeyboardConfig,
    inner: Mutex<KeyboardInner>,
}

impl HidKeyboardFunction {
    pub fn new(store: Arc<dyn GadgetConfigStore>, config: KeyboardConfig) -> Self {
        Self {
            store,
            config,
            inner: Mutex::new(KeyboardInner::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    /// Last report written to the device
    pub fn last_report(&self) -> Option<[u8; 8]> {
        self.inner.lock().last_sent
    }

    /// Create and bind the HID function, then open its device node
    pub async fn activate(&self) -> Result<()> {
        if self.is_active() {
            return Err(AppError::AlreadyActive("keyboard".to_string()));
        }

        let store = self.store.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let handle = store.create_function(&FunctionSpec::HidKeyboard)?;
            if let Err(e) = store.bind(&handle) {
                store.destroy_function(&handle);
                return Err(e);
            }
            Ok(handle)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Task join error: {}", e)))??;

        match self.open_bound(&handle).await {
            Ok(file) => {
                let mut inner = self.inner.lock();
                inner.device = Some(file);
                inner.report = KeyboardReport::default();
                inner.last_sent = None;
                inner.handle = Some(handle);
                info!("Keyboard active");
                Ok(())
            }
            Err(e) => {
                self.release(handle).await;
                Err(e)
            }
        }
    }

    async fn open_bound(&self, handle: &FunctionHandle) -> Result<File> {
        let path = handle.device.clone().ok_or_else(|| {
            AppError::Internal(format!("Function {} has no device node", handle.name))
        })?;

        let timeout = Duration::from_millis(self.config.device_wait_ms);
        if !wait_for_device(&path, timeout).await {
            return Err(AppError::HidError {
                reason: format!("{} did not appear within {:?}", path.display(), timeout),
                error_code: "enoent".to_string(),
            });
        }

        open_device(&path)
    }

    /// Send the all-released report, close the device and remove the function
    pub async fn deactivate(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            let Some(handle) = inner.handle.take() else {
                return;
            };
            inner.report.clear();
            let report = inner.report;
            if let Err(e) = write_report(&mut inner, &handle, &report) {
                warn!("Failed to send final keyboard report: {}", e);
            }
            inner.device = None;
            handle
        };

        self.release(handle).await;
        info!("Keyboard stopped");
    }

    async fn release(&self, handle: FunctionHandle) {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.unbind(&handle);
            store.destroy_function(&handle);
        })
        .await;
        if let Err(e) = result {
            warn!("Keyboard cleanup task failed: {}", e);
        }
    }

    /// Apply a key event and write the resulting report
    pub fn send_key(&self, event: KeyEvent) -> Result<()> {
        let mut inner = self.inner.lock();
        let handle = inner
            .handle
            .clone()
            .ok_or_else(|| AppError::NotActive("keyboard".to_string()))?;

        match event.modifier_bit() {
            Some(bit) => match event.kind {
                KeyEventType::Down => inner.report.modifiers |= bit,
                KeyEventType::Up => inner.report.modifiers &= !bit,
            },
            None => {
                inner.report.modifiers = event.modifiers.to_hid_byte();
                match event.kind {
                    KeyEventType::Down => {
                        if !inner.report.add_key(event.code) {
                            debug!("All key slots taken, dropping 0x{:02x}", event.code);
                        }
                    }
                    KeyEventType::Up => inner.report.remove_key(event.code),
                }
            }
        }

        let report = inner.report;
        write_report(&mut inner, &handle, &report)
    }

    /// Release every key and modifier
    pub fn release_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let handle = inner
            .handle
            .clone()
            .ok_or_else(|| AppError::NotActive("keyboard".to_string()))?;
        inner.report.clear();
        let report = inner.report;
        write_report(&mut inner, &handle, &report)
    }

    /// Press and release a key, holding `modifiers`
    pub fn tap(&self, code: u8, modifiers: KeyboardModifiers) -> Result<()> {
        self.send_key(KeyEvent::down(code, modifiers))?;
        self.release_all()
    }

    /// Type ASCII text, one press/release pair per character
    ///
    /// Returns the number of characters sent; unmapped ones are skipped.
    pub async fn type_text(&self, text: &str) -> Result<usize> {
        let delay = Duration::from_millis(self.config.key_delay_ms);
        let mut sent = 0;

        for c in text.chars() {
            let Some((code, shift)) = keymap::char_to_usb(c) else {
                debug!("No key for {:?}, skipping", c);
                continue;
            };
            let modifiers = if shift {
                KeyboardModifiers::shift()
            } else {
                KeyboardModifiers::default()
            };
            self.tap(code, modifiers)?;
            sent += 1;

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        Ok(sent)
    }
}

/// Write one report, reopening the device if a previous ESHUTDOWN closed it
fn write_report(
    inner: &mut KeyboardInner,
    handle: &FunctionHandle,
    report: &KeyboardReport,
) -> Result<()> {
    if inner.device.is_none() {
        let path = handle.device.as_deref().ok_or_else(|| {
            AppError::Internal(format!("Function {} has no device node", handle.name))
        })?;
        inner.device = Some(open_device(path)?);
        info!("Reopened HID device: {}", path.display());
    }

    let data = report.to_bytes();
    let Some(file) = inner.device.as_mut() else {
        return Err(AppError::Internal("Keyboard device not opened".to_string()));
    };

    match file.write_all(&data) {
        Ok(()) => {
            trace!("Sent keyboard report: {:02X?}", data);
            inner.last_sent = Some(data);
            Ok(())
        }
        Err(e) => {
            if e.raw_os_error() == Some(libc::ESHUTDOWN) {
                debug!("Keyboard ESHUTDOWN, closing for recovery");
                inner.device = None;
            }
            Err(io_error_to_hid_error(e, "Failed to write keyboard report"))
        }
    }
}

/// Open a HID device file with read/write access
fn open_device(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| io_error_to_hid_error(e, &format!("Failed to open {}", path.display())))
}

/// Convert I/O error to HidError with appropriate error code
fn io_error_to_hid_error(e: std::io::Error, operation: &str) -> AppError {
    let error_code = match e.raw_os_error() {
        Some(libc::EPIPE) => "epipe",
        Some(libc::ESHUTDOWN) => "eshutdown",
        Some(libc::EAGAIN) => "eagain",
        Some(libc::ENXIO) => "enxio",
        Some(libc::ENODEV) => "enodev",
        Some(libc::EIO) => "eio",
        Some(libc::ENOENT) => "enoent",
        _ => "io_error",
    };

    let reason = if error_code == "eagain" {
        format!("{}: device busy", operation)
    } else {
        format!("{}: {}", operation, e)
    };

    AppError::HidError {
        reason,
        error_code: error_code.to_string(),
    }
}

/// Wait for a device node to appear
///
/// Uses exponential backoff starting from 10ms, capped at 100ms.
pub async fn wait_for_device(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    let mut delay_ms = 10u64;
    const MAX_DELAY_MS: u64 = 100;

    loop {
        if path.exists() {
            return true;
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        let sleep_duration = Duration::from_millis(delay_ms).min(remaining);
        if sleep_duration.is_zero() {
            return false;
        }

        tokio::time::sleep(sleep_duration).await;
        delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
    }
}
