//! Error handling for res_hook_rs
//!
//! Each component reports its own error type; [`Error`] ties them together for
//! callers that drive the whole attach sequence.

use thiserror::Error;

use crate::address::VirtualAddress;

/// Result type for crate-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures at the foreign-memory boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The address could not be read or written (unmapped, guarded, or denied)
    #[error("memory fault at {address}")]
    Fault { address: VirtualAddress },

    /// The OS accepted the write but reading back returned different bytes
    #[error("write to {address} did not take effect")]
    VerificationFailed { address: VirtualAddress },

    /// Page protection could not be changed
    #[error("failed to change protection at {address} (os error {code})")]
    ProtectFailed { address: VirtualAddress, code: u32 },
}

impl MemoryError {
    /// Address the failing operation targeted
    pub fn address(&self) -> VirtualAddress {
        match *self {
            MemoryError::Fault { address }
            | MemoryError::VerificationFailed { address }
            | MemoryError::ProtectFailed { address, .. } => address,
        }
    }
}

/// Process and module discovery failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocateError {
    /// No running process (or window) matched; usually transient
    #[error("{0} not found")]
    NotFound(String),

    /// The process exists but could not be opened with the required rights
    #[error("access denied opening {name} (pid {pid})")]
    AccessDenied { name: String, pid: u32 },

    /// Any other OS failure during enumeration
    #[error("{call} failed (os error {code})")]
    Os { call: &'static str, code: u32 },

    /// The wait was cancelled before the target appeared
    #[error("wait for target cancelled")]
    Cancelled,
}

impl LocateError {
    /// Whether retrying could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, LocateError::NotFound(_))
    }
}

/// Address translation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// The module base has not been resolved yet
    #[error("module base address is not resolved")]
    Unresolved,

    /// The static address lies below the expected image base
    #[error("static address {address:#x} is below the expected image base {base:#x}")]
    BelowImageBase { address: usize, base: usize },
}

/// Remote module injection failures. Every variant is reported after any
/// remote allocation has already been released.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InjectionError {
    #[error("failed to allocate {size} bytes in the target (os error {code})")]
    AllocFailed { size: usize, code: u32 },

    #[error("failed to write the module path into the target (os error {code})")]
    WriteFailed { code: u32 },

    #[error("failed to resolve the module loader entry point")]
    ResolveEntryFailed,

    #[error("failed to start the remote thread (os error {code})")]
    RemoteThreadFailed { code: u32 },

    #[error("remote thread did not finish within {millis} ms")]
    Timeout { millis: u64 },

    #[error("module loader returned null in the target")]
    LoadFailed,

    #[error("payload bitness does not match the target process")]
    ArchitectureMismatch,
}

/// Interception engine failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// The entry point already has a live interception
    #[error("interception already installed for {0}")]
    AlreadyInstalled(String),

    /// The same entry point was prepared twice in one transaction
    #[error("{0} is already prepared in this transaction")]
    AlreadyPrepared(String),

    #[error("module {0} is not loaded")]
    ModuleNotFound(String),

    #[error("function {module}!{symbol} not found")]
    FunctionNotFound { module: String, symbol: String },

    #[error("{module}!{symbol} is neither imported nor exported through a patchable slot")]
    ImportNotFound { module: String, symbol: String },

    #[error("{module}!{symbol} is a forwarded export")]
    UnsupportedExport { module: String, symbol: String },

    #[error("object {object} has no readable dispatch table")]
    InvalidObject { object: VirtualAddress },

    /// Commit failed; every slot written by the transaction was restored
    #[error("transaction rolled back: {source}")]
    Transaction { source: MemoryError },

    /// Commit failed and some written slots could not be restored. They
    /// still hold the replacement and are retried by `detach_all`.
    #[error("transaction failed ({source}); {} slot(s) left redirected", .stranded.len())]
    RollbackIncomplete {
        source: MemoryError,
        stranded: Vec<VirtualAddress>,
    },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Image(#[from] PeError),
}

/// Malformed or unexpected PE images.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeError {
    #[error("missing MZ signature at {0}")]
    BadDosSignature(VirtualAddress),

    #[error("missing PE signature at {0}")]
    BadNtSignature(VirtualAddress),

    #[error("unknown optional header magic {0:#x}")]
    UnknownMagic(u16),

    #[error("image bitness does not match this build")]
    WrongBitness,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Persistence store failures (a missing store is not an error).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration file failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Injection(#[from] InjectionError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Image(#[from] PeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_error_transience() {
        assert!(LocateError::NotFound("Peggle.exe".into()).is_transient());
        assert!(
            !LocateError::AccessDenied {
                name: "Peggle.exe".into(),
                pid: 42
            }
            .is_transient()
        );
    }

    #[test]
    fn test_memory_error_address() {
        let address = VirtualAddress::new(0x1234);
        assert_eq!(MemoryError::Fault { address }.address(), address);
        assert_eq!(
            MemoryError::VerificationFailed { address }.to_string(),
            "write to 0x1234 did not take effect"
        );
    }

    #[test]
    fn test_hook_error_from_memory() {
        let address = VirtualAddress::new(0x10);
        let err: HookError = MemoryError::Fault { address }.into();
        assert_eq!(err, HookError::Memory(MemoryError::Fault { address }));
    }
}
