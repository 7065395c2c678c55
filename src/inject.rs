//! Remote module injection
//!
//! Classic loader-thread injection: write the module path into the target,
//! then start a thread at the OS module loader with that path as argument.
//! The steps are expressed over [`RemoteProcess`] so the unwinding guarantees
//! (no remote allocation survives an error) are testable without a target.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::address::VirtualAddress;
use crate::error::InjectionError;

/// Default bound on the loader thread
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The primitives injection needs from a foreign process
pub trait RemoteProcess {
    /// Commit a read/write region of `size` bytes
    fn alloc(&self, size: usize) -> Result<VirtualAddress, InjectionError>;

    fn write(&self, address: VirtualAddress, bytes: &[u8]) -> Result<(), InjectionError>;

    /// Release a region returned by [`alloc`](Self::alloc). Best effort.
    fn free(&self, address: VirtualAddress);

    /// Address of the module loader entry point, valid in the target
    fn loader_entry(&self) -> Result<VirtualAddress, InjectionError>;

    /// Start a thread at `entry(argument)` and wait for its exit code
    fn run_thread(
        &self,
        entry: VirtualAddress,
        argument: VirtualAddress,
        timeout: Duration,
    ) -> Result<u32, InjectionError>;

    /// Refuse targets the payload cannot be loaded into
    fn check_architecture(&self) -> Result<(), InjectionError> {
        Ok(())
    }

    /// Whether a module with this file name is loaded in the target, or
    /// `None` if that cannot be determined
    fn module_loaded(&self, _file_name: &str) -> Option<bool> {
        None
    }
}

/// Frees its remote region when dropped
struct RemoteAllocation<'a, R: RemoteProcess + ?Sized> {
    process: &'a R,
    address: VirtualAddress,
}

impl<'a, R: RemoteProcess + ?Sized> RemoteAllocation<'a, R> {
    fn new(process: &'a R, size: usize) -> Result<Self, InjectionError> {
        let address = process.alloc(size)?;
        debug!("Allocated {} bytes at {} in target", size, address);
        Ok(Self { process, address })
    }
}

impl<R: RemoteProcess + ?Sized> Drop for RemoteAllocation<'_, R> {
    fn drop(&mut self) {
        self.process.free(self.address);
    }
}

/// NUL-terminated UTF-16 path, as the wide-character loader expects
pub fn encode_module_path(path: &Path) -> Vec<u8> {
    #[cfg(windows)]
    let wide: Vec<u16> = {
        use std::os::windows::ffi::OsStrExt;
        path.as_os_str().encode_wide().collect()
    };
    #[cfg(not(windows))]
    let wide: Vec<u16> = path.to_string_lossy().encode_utf16().collect();

    wide.into_iter()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

/// Load `module_path` into the target.
///
/// Returns the loader thread's exit code: the low 32 bits of the module
/// handle, which are zero for a 64-bit handle aligned to 4 GiB. A zero exit
/// code is therefore checked against the target's module list before it is
/// reported as [`InjectionError::LoadFailed`].
///
/// On every error path the remote path buffer has already been freed.
pub fn inject<R: RemoteProcess + ?Sized>(
    process: &R,
    module_path: &Path,
    timeout: Duration,
) -> Result<u32, InjectionError> {
    process.check_architecture()?;

    let payload = encode_module_path(module_path);
    let buffer = RemoteAllocation::new(process, payload.len())?;
    process.write(buffer.address, &payload)?;

    let entry = process.loader_entry()?;
    let exit_code = process.run_thread(entry, buffer.address, timeout)?;
    if exit_code == 0 {
        let file_name = module_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if process.module_loaded(&file_name) != Some(true) {
            warn!("Loader returned null for {}", module_path.display());
            return Err(InjectionError::LoadFailed);
        }
        debug!("Loader exit code truncated to zero, but {} is loaded", file_name);
    }

    info!("Injected {} (loader returned {:#x})", module_path.display(), exit_code);
    Ok(exit_code)
}

#[cfg(windows)]
mod win {
    use std::ffi::c_void;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
    use std::ptr;
    use std::time::Duration;

    use windows_sys::Win32::Foundation::*;
    use windows_sys::Win32::System::Diagnostics::Debug::*;
    use windows_sys::Win32::System::LibraryLoader::*;
    use windows_sys::Win32::System::Memory::*;
    use windows_sys::Win32::System::Threading::*;

    use super::RemoteProcess;
    use crate::address::VirtualAddress;
    use crate::error::{InjectionError, LocateError};
    use crate::process::TargetProcess;

    /// [`RemoteProcess`] over an opened target
    pub struct Win32Remote<'a> {
        target: &'a TargetProcess,
    }

    impl<'a> Win32Remote<'a> {
        pub fn new(target: &'a TargetProcess) -> Self {
            Self { target }
        }
    }

    fn is_wow64(process: HANDLE) -> Option<bool> {
        let mut wow64 = 0;
        (unsafe { IsWow64Process(process, &mut wow64) } != 0).then_some(wow64 != 0)
    }

    impl RemoteProcess for Win32Remote<'_> {
        fn alloc(&self, size: usize) -> Result<VirtualAddress, InjectionError> {
            let address = unsafe {
                VirtualAllocEx(
                    self.target.raw_handle(),
                    ptr::null(),
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };
            if address.is_null() {
                return Err(InjectionError::AllocFailed {
                    size,
                    code: unsafe { GetLastError() },
                });
            }
            Ok(VirtualAddress::new(address as usize))
        }

        fn write(&self, address: VirtualAddress, bytes: &[u8]) -> Result<(), InjectionError> {
            let mut written = 0usize;
            let ok = unsafe {
                WriteProcessMemory(
                    self.target.raw_handle(),
                    address.value() as *const c_void,
                    bytes.as_ptr() as *const c_void,
                    bytes.len(),
                    &mut written,
                )
            };
            if ok == 0 || written != bytes.len() {
                return Err(InjectionError::WriteFailed {
                    code: unsafe { GetLastError() },
                });
            }
            Ok(())
        }

        fn free(&self, address: VirtualAddress) {
            unsafe {
                VirtualFreeEx(
                    self.target.raw_handle(),
                    address.value() as *mut c_void,
                    0,
                    MEM_RELEASE,
                );
            }
        }

        fn loader_entry(&self) -> Result<VirtualAddress, InjectionError> {
            let kernel32: Vec<u16> = "kernel32.dll\0".encode_utf16().collect();
            let module = unsafe { GetModuleHandleW(kernel32.as_ptr()) };
            if module.is_null() {
                return Err(InjectionError::ResolveEntryFailed);
            }

            // kernel32 is mapped at the same base in every process of a boot
            let entry = unsafe { GetProcAddress(module, c"LoadLibraryW".as_ptr() as *const u8) }
                .ok_or(InjectionError::ResolveEntryFailed)?;
            Ok(VirtualAddress::new(entry as usize))
        }

        fn run_thread(
            &self,
            entry: VirtualAddress,
            argument: VirtualAddress,
            timeout: Duration,
        ) -> Result<u32, InjectionError> {
            let start = unsafe {
                std::mem::transmute::<usize, unsafe extern "system" fn(*mut c_void) -> u32>(
                    entry.value(),
                )
            };

            let raw = unsafe {
                CreateRemoteThread(
                    self.target.raw_handle(),
                    ptr::null(),
                    0,
                    Some(start),
                    argument.value() as *const c_void,
                    0,
                    ptr::null_mut(),
                )
            };
            if raw.is_null() {
                return Err(InjectionError::RemoteThreadFailed {
                    code: unsafe { GetLastError() },
                });
            }
            let thread = unsafe { OwnedHandle::from_raw_handle(raw) };

            let millis = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;
            if unsafe { WaitForSingleObject(thread.as_raw_handle(), millis) } != WAIT_OBJECT_0 {
                return Err(InjectionError::Timeout {
                    millis: millis as u64,
                });
            }

            let mut exit_code = 0u32;
            unsafe {
                GetExitCodeThread(thread.as_raw_handle(), &mut exit_code);
            }
            Ok(exit_code)
        }

        fn check_architecture(&self) -> Result<(), InjectionError> {
            let ours = is_wow64(unsafe { GetCurrentProcess() });
            let theirs = is_wow64(self.target.raw_handle());
            match (ours, theirs) {
                (Some(a), Some(b)) if a != b => Err(InjectionError::ArchitectureMismatch),
                _ => Ok(()),
            }
        }

        fn module_loaded(&self, file_name: &str) -> Option<bool> {
            match crate::process::find_module(self.target.pid, file_name) {
                Ok(_) => Some(true),
                Err(LocateError::NotFound(_)) => Some(false),
                Err(_) => None,
            }
        }
    }
}

#[cfg(windows)]
pub use win::Win32Remote;
