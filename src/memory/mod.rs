//! Fault-isolated memory access
//!
//! Every read or write of foreign memory (another process, or unverified
//! addresses in our own) goes through [`MemoryAccess`]. Implementations must
//! turn an invalid address into [`MemoryError::Fault`] instead of crashing the
//! caller; the candidate scanner depends on this for every read it makes.

use std::mem::size_of;

use tracing::warn;

use crate::address::{AddressSpace, VirtualAddress};
use crate::error::MemoryError;

#[cfg(windows)]
mod process;

#[cfg(windows)]
pub use process::ProcessMemory;

/// Granularity of protection changes and of the scanner's readability checks
pub const PAGE_SIZE: usize = 0x1000;

/// Read-back granularity of verified writes
const VERIFY_CHUNK: usize = 64;

/// Page protection, mirroring the Win32 `PAGE_*` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    WriteCopy,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
    ExecuteWriteCopy,
    /// Anything else (guard pages, caching modifiers)
    Other(u32),
}

impl Protection {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0x01 => Protection::NoAccess,
            0x02 => Protection::ReadOnly,
            0x04 => Protection::ReadWrite,
            0x08 => Protection::WriteCopy,
            0x10 => Protection::Execute,
            0x20 => Protection::ExecuteRead,
            0x40 => Protection::ExecuteReadWrite,
            0x80 => Protection::ExecuteWriteCopy,
            other => Protection::Other(other),
        }
    }

    pub const fn to_raw(self) -> u32 {
        match self {
            Protection::NoAccess => 0x01,
            Protection::ReadOnly => 0x02,
            Protection::ReadWrite => 0x04,
            Protection::WriteCopy => 0x08,
            Protection::Execute => 0x10,
            Protection::ExecuteRead => 0x20,
            Protection::ExecuteReadWrite => 0x40,
            Protection::ExecuteWriteCopy => 0x80,
            Protection::Other(raw) => raw,
        }
    }

    pub const fn is_readable(self) -> bool {
        matches!(
            self,
            Protection::ReadOnly
                | Protection::ReadWrite
                | Protection::WriteCopy
                | Protection::ExecuteRead
                | Protection::ExecuteReadWrite
                | Protection::ExecuteWriteCopy
        )
    }

    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            Protection::ReadWrite
                | Protection::WriteCopy
                | Protection::ExecuteReadWrite
                | Protection::ExecuteWriteCopy
        )
    }

    pub const fn is_executable(self) -> bool {
        matches!(
            self,
            Protection::Execute
                | Protection::ExecuteRead
                | Protection::ExecuteReadWrite
                | Protection::ExecuteWriteCopy
        )
    }

    /// The least permissive protection that allows writing while keeping
    /// execute permission if the page had it
    pub const fn writable_variant(self) -> Self {
        if self.is_executable() {
            Protection::ExecuteReadWrite
        } else {
            Protection::ReadWrite
        }
    }

    pub const fn class(self) -> ProtectionClass {
        match self {
            Protection::ReadOnly => ProtectionClass::ReadOnly,
            Protection::ReadWrite | Protection::WriteCopy => ProtectionClass::ReadWrite,
            Protection::ExecuteReadWrite | Protection::ExecuteWriteCopy => {
                ProtectionClass::ExecutableReadWrite
            }
            _ => ProtectionClass::Other,
        }
    }
}

/// Coarse classification used for module sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ProtectionClass {
    ReadOnly,
    ReadWrite,
    ExecutableReadWrite,
    Other,
}

/// What the OS reports about the region containing an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub base: VirtualAddress,
    pub size: usize,
    pub protection: Protection,
    pub committed: bool,
}

impl RegionInfo {
    pub fn is_readable(&self) -> bool {
        self.committed && self.protection.is_readable()
    }
}

/// Read/write primitives over one address space.
pub trait MemoryAccess: Send + Sync {
    /// Address space these primitives operate on
    fn space(&self) -> AddressSpace;

    /// Fill `buf` from `address`. Partial reads are faults.
    fn read_into(&self, address: VirtualAddress, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Write without read-back verification.
    fn write_unchecked(&self, address: VirtualAddress, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Change protection of the pages covering `address..address+size`,
    /// returning the previous protection.
    fn protect(
        &self,
        address: VirtualAddress,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, MemoryError>;

    /// Describe the region containing `address`, or `None` if unmapped
    fn query(&self, address: VirtualAddress) -> Option<RegionInfo>;

    fn read(&self, address: VirtualAddress, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read_into(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u16(&self, address: VirtualAddress) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read_into(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: VirtualAddress) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_into(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a pointer-sized value of this build's width
    fn read_usize(&self, address: VirtualAddress) -> Result<usize, MemoryError> {
        let mut buf = [0u8; size_of::<usize>()];
        self.read_into(address, &mut buf)?;
        Ok(usize::from_le_bytes(buf))
    }

    /// Write and verify by reading back. A mismatch after a successful write
    /// is [`MemoryError::VerificationFailed`].
    fn write(&self, address: VirtualAddress, bytes: &[u8]) -> Result<(), MemoryError> {
        self.write_unchecked(address, bytes)?;

        if !self.holds(address, bytes)? {
            return Err(MemoryError::VerificationFailed { address });
        }
        Ok(())
    }

    /// Whether memory at `address` currently equals `bytes`. Reads through a
    /// stack buffer, never the heap.
    fn holds(&self, address: VirtualAddress, bytes: &[u8]) -> Result<bool, MemoryError> {
        let mut chunk = [0u8; VERIFY_CHUNK];
        for (i, expected) in bytes.chunks(VERIFY_CHUNK).enumerate() {
            let current = &mut chunk[..expected.len()];
            self.read_into(address.add(i * VERIFY_CHUNK), current)?;
            if *current != *expected {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn write_u32(&self, address: VirtualAddress, value: u32) -> Result<(), MemoryError> {
        self.write(address, &value.to_le_bytes())
    }

    fn write_usize(&self, address: VirtualAddress, value: usize) -> Result<(), MemoryError> {
        self.write(address, &value.to_le_bytes())
    }

    fn is_readable(&self, address: VirtualAddress) -> bool {
        self.query(address).is_some_and(|info| info.is_readable())
    }
}

/// Restores the original protection of a range when dropped.
pub struct ProtectionGuard<'a, M: MemoryAccess + ?Sized> {
    memory: &'a M,
    address: VirtualAddress,
    size: usize,
    original: Protection,
}

impl<'a, M: MemoryAccess + ?Sized> ProtectionGuard<'a, M> {
    pub fn acquire(
        memory: &'a M,
        address: VirtualAddress,
        size: usize,
        desired: Protection,
    ) -> Result<Self, MemoryError> {
        let original = memory.protect(address, size, desired)?;
        Ok(Self {
            memory,
            address,
            size,
            original,
        })
    }

    pub fn original(&self) -> Protection {
        self.original
    }

    /// Restore the original protection now and return the outcome instead
    /// of logging it
    pub fn release(self) -> Result<(), MemoryError> {
        let restored = self
            .memory
            .protect(self.address, self.size, self.original)
            .map(|_| ());
        std::mem::forget(self);
        restored
    }
}

impl<M: MemoryAccess + ?Sized> Drop for ProtectionGuard<'_, M> {
    fn drop(&mut self) {
        if let Err(e) = self.memory.protect(self.address, self.size, self.original) {
            warn!("Failed to restore protection at {}: {}", self.address, e);
        }
    }
}

/// Run `body` with `address..address+size` set to `desired`, restoring the
/// original protection afterwards whether or not `body` succeeds. A failed
/// restore is returned, never logged.
pub fn with_temporary_protection<M, T, E, F>(
    memory: &M,
    address: VirtualAddress,
    size: usize,
    desired: Protection,
    body: F,
) -> Result<T, E>
where
    M: MemoryAccess + ?Sized,
    E: From<MemoryError>,
    F: FnOnce() -> Result<T, E>,
{
    let guard = ProtectionGuard::acquire(memory, address, size, desired)?;
    let outcome = body();
    let restored = guard.release();
    let value = outcome?;
    restored?;
    Ok(value)
}

/// Verified write that lifts write protection for the duration of the write
/// when the target page is not already writable.
///
/// Neither allocates nor logs, so it may run while other threads of the
/// process are suspended.
pub fn patch<M: MemoryAccess + ?Sized>(
    memory: &M,
    address: VirtualAddress,
    bytes: &[u8],
) -> Result<(), MemoryError> {
    let info = memory
        .query(address)
        .filter(|info| info.committed)
        .ok_or(MemoryError::Fault { address })?;

    if info.protection.is_writable() {
        return memory.write(address, bytes);
    }

    with_temporary_protection(
        memory,
        address,
        bytes.len(),
        info.protection.writable_variant(),
        || memory.write(address, bytes),
    )
}
