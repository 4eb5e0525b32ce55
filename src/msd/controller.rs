//! Mass storage personality
//!
//! Exposes the selected image through a single-LUN mass storage function.
//! The image is claimed as `Backing` for as long as it is attached.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use super::image::ImageSelection;
use crate::config::MsdConfig;
use crate::error::{AppError, Result};
use crate::lifecycle::claims::{Claim, ClaimRole, ResourceClaims};
use crate::otg::{FunctionHandle, FunctionSpec, GadgetConfigStore, MsdLunConfig};

struct ActiveImage {
    handle: FunctionHandle,
    image: ImageSelection,
    _claim: Claim,
}

/// Mass storage personality backed by an image file
pub struct MassStorageFunction {
    store: Arc<dyn GadgetConfigStore>,
    claims: ResourceClaims,
    policy: MsdConfig,
    active: Mutex<Option<ActiveImage>>,
}

impl MassStorageFunction {
    pub fn new(store: Arc<dyn GadgetConfigStore>, claims: ResourceClaims, policy: MsdConfig) -> Self {
        Self {
            store,
            claims,
            policy,
            active: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Image currently exposed to the host
    pub fn backing_image(&self) -> Option<ImageSelection> {
        self.active.lock().as_ref().map(|a| a.image.clone())
    }

    fn lun_config(&self, image: &ImageSelection) -> MsdLunConfig {
        let mut lun = if self.policy.cdrom {
            MsdLunConfig::cdrom(image.path.clone())
        } else {
            MsdLunConfig::disk(image.path.clone(), self.policy.read_only)
        };
        lun.removable = self.policy.removable;
        lun
    }

    /// Attach `image` and bind the gadget
    ///
    /// Any failure after the function is created removes it again; the
    /// backing claim is released with it.
    pub async fn activate(&self, image: &ImageSelection) -> Result<()> {
        if self.is_active() {
            return Err(AppError::AlreadyActive("mass storage".to_string()));
        }

        image.revalidate()?;
        let claim = self
            .claims
            .claim(&image.path, ClaimRole::Backing)
            .map_err(|c| AppError::ImageUnavailable(c.to_string()))?;

        let store = self.store.clone();
        let spec = FunctionSpec::MassStorage(self.lun_config(image));
        let handle = tokio::task::spawn_blocking(move || {
            let handle = store.create_function(&spec)?;
            if let Err(e) = store.bind(&handle) {
                store.destroy_function(&handle);
                return Err(e);
            }
            Ok(handle)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Task join error: {}", e)))??;

        info!(
            "Mass storage active: {} ({})",
            image.name,
            image.size_display()
        );
        *self.active.lock() = Some(ActiveImage {
            handle,
            image: image.clone(),
            _claim: claim,
        });
        Ok(())
    }

    /// Unbind and remove the function; always succeeds from the caller's view
    pub async fn deactivate(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };

        let store = self.store.clone();
        let handle = active.handle.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.unbind(&handle);
            store.destroy_function(&handle);
        })
        .await;
        if let Err(e) = result {
            warn!("Mass storage cleanup task failed: {}", e);
        }

        info!("Mass storage stopped: {}", active.image.name);
    }
}
