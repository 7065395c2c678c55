//! Process & module discovery
//!
//! Finds the target by executable name with a Toolhelp snapshot, opens it
//! with the rights the rest of the engine needs, and resolves the main
//! module's live base. [`wait_for`] turns the startup race into a bounded,
//! cancellable retry loop.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::address::{StaticAddress, VirtualAddress, translate};
use crate::error::{LocateError, TranslateError};
use crate::signal::CancelToken;

#[cfg(windows)]
use std::os::windows::io::OwnedHandle;
#[cfg(windows)]
use std::sync::Arc;

/// A located process and its main module
#[derive(Debug)]
pub struct TargetProcess {
    pub pid: u32,
    pub name: String,
    pub base: VirtualAddress,
    pub size: usize,
    /// `None` when the target is the calling process
    #[cfg(windows)]
    handle: Option<Arc<OwnedHandle>>,
}

impl TargetProcess {
    /// Relocation-adjust a link-time address using this attach's base
    pub fn translate(&self, address: StaticAddress) -> Result<VirtualAddress, TranslateError> {
        translate(address, self.base)
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.base && address.offset_from(self.base) < self.size
    }
}

/// Bounds for [`wait_for`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Give up after this long
    pub max_wait: Duration,
    /// First retry delay; doubled after each miss
    pub poll: Duration,
    /// Upper bound on the retry delay
    pub max_poll: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(10),
            poll: Duration::from_millis(500),
            max_poll: Duration::from_secs(2),
        }
    }
}

/// Retry `attempt` while it fails with a transient error.
///
/// Permanent errors (e.g. `AccessDenied`) are returned immediately. After
/// `policy.max_wait` the last transient error is returned.
pub fn wait_for<T, F>(
    policy: &WaitPolicy,
    cancel: &CancelToken,
    mut attempt: F,
) -> Result<T, LocateError>
where
    F: FnMut() -> Result<T, LocateError>,
{
    let deadline = Instant::now() + policy.max_wait;
    let mut delay = policy.poll;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(LocateError::Cancelled);
        }
        attempts += 1;

        let err = match attempt() {
            Ok(found) => {
                if attempts > 1 {
                    info!("Target found after {} attempts", attempts);
                }
                return Ok(found);
            }
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(err);
        }

        debug!("{} (attempt {}), retrying in {:?}", err, attempts, delay);
        if cancel.wait(delay.min(deadline - now)) {
            return Err(LocateError::Cancelled);
        }
        delay = (delay * 2).min(policy.max_poll);
    }
}

#[cfg(windows)]
mod win {
    use std::os::windows::io::{FromRawHandle, OwnedHandle};
    use std::sync::Arc;

    use windows_sys::Win32::Foundation::*;
    use windows_sys::Win32::System::Diagnostics::ToolHelp::*;
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows_sys::Win32::System::Threading::*;

    use super::TargetProcess;
    use crate::address::VirtualAddress;
    use crate::error::LocateError;
    use crate::memory::ProcessMemory;
    use crate::pe::ModuleImage;

    /// Rights for reading, patching and starting a loader thread
    const TARGET_ACCESS: u32 = PROCESS_QUERY_INFORMATION
        | PROCESS_VM_READ
        | PROCESS_VM_WRITE
        | PROCESS_VM_OPERATION
        | PROCESS_CREATE_THREAD;

    /// Toolhelp snapshot closed on drop
    struct Snapshot(HANDLE);

    impl Snapshot {
        fn take(flags: u32, pid: u32) -> Result<Self, LocateError> {
            let handle = unsafe { CreateToolhelp32Snapshot(flags, pid) };
            if handle == INVALID_HANDLE_VALUE {
                let code = unsafe { GetLastError() };
                // Module snapshots of a process still starting up fail transiently
                if code == ERROR_PARTIAL_COPY || code == ERROR_BAD_LENGTH {
                    return Err(LocateError::NotFound(format!("modules of pid {pid}")));
                }
                return Err(LocateError::Os {
                    call: "CreateToolhelp32Snapshot",
                    code,
                });
            }
            Ok(Self(handle))
        }
    }

    impl Drop for Snapshot {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    fn wide_to_string(wide: &[u16]) -> String {
        let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
        String::from_utf16_lossy(&wide[..len])
    }

    fn find_pid(exe_name: &str) -> Result<u32, LocateError> {
        let snapshot = Snapshot::take(TH32CS_SNAPPROCESS, 0)?;

        let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<PROCESSENTRY32W>() as u32;

        let mut ok = unsafe { Process32FirstW(snapshot.0, &mut entry) };
        while ok != 0 {
            if wide_to_string(&entry.szExeFile).eq_ignore_ascii_case(exe_name) {
                return Ok(entry.th32ProcessID);
            }
            ok = unsafe { Process32NextW(snapshot.0, &mut entry) };
        }

        Err(LocateError::NotFound(exe_name.to_string()))
    }

    /// Executable name of a running process
    pub fn exe_name_of(pid: u32) -> Option<String> {
        let snapshot = Snapshot::take(TH32CS_SNAPPROCESS, 0).ok()?;

        let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<PROCESSENTRY32W>() as u32;

        let mut ok = unsafe { Process32FirstW(snapshot.0, &mut entry) };
        while ok != 0 {
            if entry.th32ProcessID == pid {
                return Some(wide_to_string(&entry.szExeFile));
            }
            ok = unsafe { Process32NextW(snapshot.0, &mut entry) };
        }
        None
    }

    /// Base and size of `module_name` inside `pid`
    pub fn find_module(pid: u32, module_name: &str) -> Result<(VirtualAddress, usize), LocateError> {
        let snapshot = Snapshot::take(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid)?;

        let mut entry: MODULEENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<MODULEENTRY32W>() as u32;

        let mut ok = unsafe { Module32FirstW(snapshot.0, &mut entry) };
        while ok != 0 {
            if wide_to_string(&entry.szModule).eq_ignore_ascii_case(module_name) {
                return Ok((
                    VirtualAddress::new(entry.modBaseAddr as usize),
                    entry.modBaseSize as usize,
                ));
            }
            ok = unsafe { Module32NextW(snapshot.0, &mut entry) };
        }

        Err(LocateError::NotFound(format!("{module_name} in pid {pid}")))
    }

    /// Base of every module loaded in `pid`
    pub fn module_bases(pid: u32) -> Result<Vec<VirtualAddress>, LocateError> {
        let snapshot = Snapshot::take(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid)?;

        let mut entry: MODULEENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<MODULEENTRY32W>() as u32;

        let mut bases = Vec::new();
        let mut ok = unsafe { Module32FirstW(snapshot.0, &mut entry) };
        while ok != 0 {
            bases.push(VirtualAddress::new(entry.modBaseAddr as usize));
            ok = unsafe { Module32NextW(snapshot.0, &mut entry) };
        }
        Ok(bases)
    }

    /// Find a running process by executable name and open it.
    ///
    /// The handle is opened fresh and the base queried fresh on every call.
    pub fn locate(exe_name: &str) -> Result<TargetProcess, LocateError> {
        let pid = find_pid(exe_name)?;

        let raw = unsafe { OpenProcess(TARGET_ACCESS, 0, pid) };
        if raw.is_null() {
            let code = unsafe { GetLastError() };
            return Err(if code == ERROR_ACCESS_DENIED {
                LocateError::AccessDenied {
                    name: exe_name.to_string(),
                    pid,
                }
            } else {
                LocateError::Os {
                    call: "OpenProcess",
                    code,
                }
            });
        }
        let handle = Arc::new(unsafe { OwnedHandle::from_raw_handle(raw) });

        let (base, size) = find_module(pid, exe_name)?;
        Ok(TargetProcess {
            pid,
            name: exe_name.to_string(),
            base,
            size,
            handle: Some(handle),
        })
    }

    /// The calling process's main module
    pub fn current() -> Result<TargetProcess, LocateError> {
        let module = unsafe { GetModuleHandleW(std::ptr::null()) };
        if module.is_null() {
            return Err(LocateError::Os {
                call: "GetModuleHandleW",
                code: unsafe { GetLastError() },
            });
        }

        let base = VirtualAddress::new(module as usize);
        let memory = ProcessMemory::current();
        let size = ModuleImage::parse(&memory, base)
            .map(|image| image.size_of_image)
            .unwrap_or(0);
        let pid = unsafe { GetCurrentProcessId() };

        Ok(TargetProcess {
            pid,
            name: exe_name_of(pid).unwrap_or_default(),
            base,
            size,
            handle: None,
        })
    }

    impl TargetProcess {
        /// Memory accessor sharing this process's handle
        pub fn memory(&self) -> ProcessMemory {
            match &self.handle {
                Some(handle) => ProcessMemory::from_handle(Arc::clone(handle), self.pid),
                None => ProcessMemory::current(),
            }
        }

        pub fn raw_handle(&self) -> HANDLE {
            use std::os::windows::io::AsRawHandle;
            match &self.handle {
                Some(handle) => handle.as_raw_handle() as HANDLE,
                None => unsafe { GetCurrentProcess() },
            }
        }
    }
}

#[cfg(windows)]
pub use win::{current, exe_name_of, find_module, locate, module_bases};

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> WaitPolicy {
        WaitPolicy {
            max_wait: Duration::from_millis(120),
            poll: Duration::from_millis(5),
            max_poll: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_wait_for_succeeds_after_retries() {
        let calls = Cell::new(0);
        let found = wait_for(&fast(), &CancelToken::new(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(LocateError::NotFound("Peggle.exe".into()))
            } else {
                Ok(42u32)
            }
        });
        assert_eq!(found, Ok(42));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_wait_for_gives_up_at_bound() {
        let start = Instant::now();
        let calls = Cell::new(0);
        let result: Result<(), _> = wait_for(&fast(), &CancelToken::new(), || {
            calls.set(calls.get() + 1);
            Err(LocateError::NotFound("Peggle.exe".into()))
        });

        assert_eq!(result, Err(LocateError::NotFound("Peggle.exe".into())));
        assert!(calls.get() > 1);
        assert!(start.elapsed() >= Duration::from_millis(120));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_wait_for_does_not_retry_access_denied() {
        let calls = Cell::new(0);
        let result: Result<(), _> = wait_for(&fast(), &CancelToken::new(), || {
            calls.set(calls.get() + 1);
            Err(LocateError::AccessDenied {
                name: "Peggle.exe".into(),
                pid: 7,
            })
        });

        assert!(matches!(result, Err(LocateError::AccessDenied { pid: 7, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_wait_for_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            wait_for(&fast(), &cancel, || Err(LocateError::NotFound("x".into())));
        assert_eq!(result, Err(LocateError::Cancelled));
    }

    #[cfg(windows)]
    #[test]
    fn test_locate_missing_process() {
        let result = locate("definitely-not-running-7f3a.exe");
        assert!(matches!(result, Err(LocateError::NotFound(_))));
    }
}
