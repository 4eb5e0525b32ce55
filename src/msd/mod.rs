//! Mass storage emulation
//!
//! Presents a selected ISO/IMG file to the host as a USB drive.

pub mod controller;
pub mod image;

pub use controller::MassStorageFunction;
pub use image::{list_available_images, size_display, ImageInfo, ImageSelection};
