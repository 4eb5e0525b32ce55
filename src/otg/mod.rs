//! USB gadget configuration through configfs
//!
//! Architecture:
//! ```text
//! GadgetConfigStore (trait, used by the lifecycle engine)
//!     └── ConfigFsStore (gadget skeleton, UDC binding)
//!             ├── HidFunction (boot keyboard)
//!             └── MsdFunction (mass storage, one LUN)
//! ```

pub mod configfs;
pub mod function;
pub mod hid;
pub mod msd;
pub mod store;

pub use configfs::ConfigFsLayout;
pub use function::{FunctionHandle, FunctionKind, FunctionSpec, GadgetFunction};
pub use hid::HidFunction;
pub use msd::{MsdFunction, MsdLunConfig};
pub use store::{ConfigFsStore, GadgetConfigStore, GadgetDescriptor};
