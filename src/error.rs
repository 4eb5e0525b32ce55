use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Kernel rejected a gadget configuration write (permissions, unsupported controller)
    #[error("Gadget configuration error: {0}")]
    GadgetConfig(String),

    /// No UDC available, or the controller refused the binding
    #[error("Gadget bind error: {0}")]
    Bind(String),

    #[error("Image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Device too small: {device} holds {capacity} bytes, image needs {required}")]
    DeviceTooSmall {
        device: String,
        required: u64,
        capacity: u64,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No image selected. Use 'iso' first.")]
    NoImageSelected,

    #[error("Already active: {0}")]
    AlreadyActive(String),

    #[error("Not active: {0}")]
    NotActive(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HID error: {reason} (code: {error_code})")]
    HidError { reason: String, error_code: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable error code for logs and JSON output
    pub fn code(&self) -> &'static str {
        match self {
            AppError::GadgetConfig(_) => "gadget_config",
            AppError::Bind(_) => "bind",
            AppError::ImageUnavailable(_) => "image_unavailable",
            AppError::DeviceBusy(_) => "device_busy",
            AppError::DeviceTooSmall { .. } => "device_too_small",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::NoImageSelected => "no_image_selected",
            AppError::AlreadyActive(_) => "already_active",
            AppError::NotActive(_) => "not_active",
            AppError::NotFound(_) => "not_found",
            AppError::HidError { .. } => "hid",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Internal(_) => "internal",
        }
    }

    /// Map an `open()` failure on a device or image node to a typed error
    pub fn from_open(e: std::io::Error, path: &std::path::Path) -> Self {
        match e.raw_os_error() {
            Some(libc::ENOENT) => AppError::NotFound(path.display().to_string()),
            Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS) => {
                AppError::PermissionDenied(format!("{}: {}", path.display(), e))
            }
            Some(libc::EBUSY) => AppError::DeviceBusy(format!("{}: {}", path.display(), e)),
            _ => AppError::Io(e),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
