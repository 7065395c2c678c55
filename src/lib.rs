//! res_hook_rs: resolution override engine for closed Windows games
//!
//! Attaches to a target process, translates link-time addresses to its
//! relocated image, patches memory through fault-isolated primitives, and
//! intercepts graphics entry points by rewriting import, export and virtual
//! dispatch table slots. When no address for the resolution setting is
//! known, a candidate scanner finds it empirically and remembers it.
//!
//! # Features
//!
//! - **Fault-isolated memory access**: every read and write of foreign or
//!   unverified memory returns a `Result` instead of crashing the host.
//! - **Transactional interception**: sites are prepared and committed
//!   all-or-nothing, and detach restores the exact original pointer.
//! - **Relocation aware**: static addresses are re-based per attach.
//! - **32-bit and 64-bit**: pointer width follows the build.
//!
//! # Example
//!
//! ```rust,no_run
//! use res_hook_rs::{StaticAddress, VirtualAddress, translate};
//!
//! // Peggle's width cell, in a process whose image was rebased by 0x10000
//! let width = translate(StaticAddress::new(0x0055_E034), VirtualAddress::new(0x0041_0000))?;
//! assert_eq!(width, VirtualAddress::new(0x0056_E034));
//! # Ok::<(), res_hook_rs::TranslateError>(())
//! ```
//!
//! # Safety
//!
//! The graphics replacements and the apply-settings call execute code in the
//! target. They assume:
//!
//! - The configured slot indices match the target's interface layout
//! - The apply-settings signature identifies a function taking no arguments
//! - The payload pins itself at load; `res_hook_shutdown` withdraws the
//!   interceptions, and the code stays mapped until the process exits

pub mod address;
pub mod config;
pub mod engine;
pub mod error;
pub mod graphics;
pub mod hook;
pub mod inject;
pub mod logging;
pub mod memory;
pub mod pattern;
pub mod pe;
pub mod process;
pub mod scanner;
pub mod signal;
pub mod store;
pub mod window;

#[cfg(windows)]
mod payload;

#[cfg(test)]
mod testing;

// Re-export the main API
pub use address::{AddressSpace, StaticAddress, VirtualAddress, translate};
pub use config::{EngineConfig, ResolutionTarget};
pub use engine::{EngineContext, EngineHandle, apply_static_patch, start};
pub use error::{
    Error, HookError, InjectionError, LocateError, MemoryError, Result, TranslateError,
};
pub use hook::{InterceptionEngine, InterceptionTarget};
pub use memory::{MemoryAccess, Protection};
pub use scanner::{CandidateScanner, ScanState};
pub use store::{JsonFileStore, PersistenceStore};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if the current platform is supported
pub fn is_supported() -> bool {
    cfg!(target_os = "windows")
}
