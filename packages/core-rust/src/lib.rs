//! `muxgate` core: named, prioritized modules and their ordered lifecycle.
//!
//! A [`ModuleRegistry`] owns every [`Module`] of a process and drives them
//! through `initialize -> serve -> shutdown -> finalize`:
//!
//! - initialization is sequential, by ascending priority, and all-or-nothing
//! - serving is concurrent, one task per module
//! - the first unexpected serve failure shuts every module down

pub mod registry;
pub mod traits;
pub mod types;

pub use registry::{ModuleRegistry, RegistryError};
pub use traits::Module;
pub use types::{is_not_implemented, ModuleState, NotImplemented};
