//! [`MemoryAccess`] over a Win32 process handle.
//!
//! The same implementation serves both sides of the injection: a remote
//! target opened by PID, and our own process after the payload is loaded.
//! `ReadProcessMemory`/`WriteProcessMemory` report an invalid address as a
//! failed call instead of raising an access violation, which is what makes
//! probing unverified addresses in our own process survivable.

use std::ffi::c_void;
use std::mem::size_of;
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::sync::Arc;

use windows_sys::Win32::Foundation::*;
use windows_sys::Win32::System::Diagnostics::Debug::*;
use windows_sys::Win32::System::Memory::*;
use windows_sys::Win32::System::Threading::*;

use super::{MemoryAccess, Protection, RegionInfo};
use crate::address::{AddressSpace, VirtualAddress};
use crate::error::MemoryError;

/// Memory primitives bound to one process handle
pub struct ProcessMemory {
    /// Keeps a remote handle open; `None` for the current-process pseudo handle
    owner: Option<Arc<OwnedHandle>>,
    space: AddressSpace,
}

impl ProcessMemory {
    /// Accessor for the calling process
    pub fn current() -> Self {
        Self {
            owner: None,
            space: AddressSpace::Local,
        }
    }

    /// Accessor sharing an already opened process handle
    pub fn from_handle(handle: Arc<OwnedHandle>, pid: u32) -> Self {
        let space = if pid == unsafe { GetCurrentProcessId() } {
            AddressSpace::Local
        } else {
            AddressSpace::Remote(pid)
        };
        Self {
            owner: Some(handle),
            space,
        }
    }

    fn raw(&self) -> HANDLE {
        match &self.owner {
            Some(handle) => handle.as_raw_handle() as HANDLE,
            None => unsafe { GetCurrentProcess() },
        }
    }
}

impl MemoryAccess for ProcessMemory {
    fn space(&self) -> AddressSpace {
        self.space
    }

    fn read_into(&self, address: VirtualAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.raw(),
                address.value() as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                &mut read,
            )
        };

        if ok == 0 || read != buf.len() {
            return Err(MemoryError::Fault { address });
        }
        Ok(())
    }

    fn write_unchecked(&self, address: VirtualAddress, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                self.raw(),
                address.value() as *const c_void,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                &mut written,
            )
        };

        if ok == 0 || written != bytes.len() {
            return Err(MemoryError::Fault { address });
        }

        unsafe {
            FlushInstructionCache(self.raw(), address.value() as *const c_void, bytes.len());
        }
        Ok(())
    }

    fn protect(
        &self,
        address: VirtualAddress,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, MemoryError> {
        let mut old = 0u32;
        let ok = unsafe {
            VirtualProtectEx(
                self.raw(),
                address.value() as *const c_void,
                size,
                protection.to_raw(),
                &mut old,
            )
        };

        if ok == 0 {
            let code = unsafe { GetLastError() };
            return Err(MemoryError::ProtectFailed { address, code });
        }
        Ok(Protection::from_raw(old))
    }

    fn query(&self, address: VirtualAddress) -> Option<RegionInfo> {
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let len = unsafe {
            VirtualQueryEx(
                self.raw(),
                address.value() as *const c_void,
                &mut mbi,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if len == 0 || mbi.State == MEM_FREE {
            return None;
        }

        let committed = mbi.State == MEM_COMMIT;
        Some(RegionInfo {
            base: VirtualAddress::new(mbi.BaseAddress as usize),
            size: mbi.RegionSize,
            protection: if committed {
                Protection::from_raw(mbi.Protect)
            } else {
                Protection::NoAccess
            },
            committed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_roundtrip() {
        let memory = ProcessMemory::current();
        let mut cell = Box::new(0x1122_3344u32);
        let ptr = &mut *cell as *mut u32;
        let address = VirtualAddress::new(ptr as usize);

        assert_eq!(memory.read_u32(address).unwrap(), 0x1122_3344);
        memory.write_u32(address, 0x5566_7788).unwrap();
        assert_eq!(unsafe { ptr.read_volatile() }, 0x5566_7788);
    }

    #[test]
    fn test_null_page_is_fault_not_crash() {
        let memory = ProcessMemory::current();
        let address = VirtualAddress::new(0x10);
        assert_eq!(memory.read_u32(address), Err(MemoryError::Fault { address }));
        assert!(!memory.is_readable(address));
    }
}
