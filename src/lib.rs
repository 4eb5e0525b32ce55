//! labtool - USB gadget lab tool
//!
//! Turns a board with a USB device controller into a virtual USB drive or a
//! virtual keyboard for a connected host, and writes images onto removable
//! media with the same hardware.

pub mod config;
pub mod error;
pub mod events;
pub mod flash;
pub mod hid;
pub mod lifecycle;
pub mod msd;
pub mod otg;
pub mod shell;

pub use error::{AppError, Result};
