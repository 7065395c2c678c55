//! Injectable payload entry points
//!
//! `DllMain` only records and pins the module and starts a bootstrap
//! thread; the engine is brought up from there, outside the loader lock.
//!
//! A pinned module is never unmapped before process exit. Engine threads and
//! redirected slots keep pointing at mapped code even after a `FreeLibrary`
//! from the host, so there is no teardown under the loader lock.

use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{error, info};
use windows_sys::Win32::Foundation::{HMODULE, MAX_PATH, TRUE};
use windows_sys::Win32::System::LibraryLoader::{
    DisableThreadLibraryCalls, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_PIN,
    GetModuleFileNameW, GetModuleHandleExW,
};
use windows_sys::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

use crate::config::{CONFIG_FILE, EngineConfig};
use crate::engine;
use crate::logging;

static MODULE: AtomicUsize = AtomicUsize::new(0);

/// Directory holding this module, where config, log and store live
fn module_dir() -> Option<PathBuf> {
    let module = MODULE.load(Ordering::SeqCst) as HMODULE;
    let mut buffer = vec![0u16; MAX_PATH as usize];
    let len = unsafe { GetModuleFileNameW(module, buffer.as_mut_ptr(), buffer.len() as u32) };
    if len == 0 {
        return None;
    }
    let path = PathBuf::from(String::from_utf16_lossy(&buffer[..len as usize]));
    path.parent().map(|dir| dir.to_path_buf())
}

/// Keep `module` loaded until the process exits
fn pin(module: HMODULE) -> bool {
    let mut pinned = std::ptr::null_mut();
    unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_PIN | GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
            module as *const u16,
            &mut pinned,
        ) != 0
    }
}

fn bootstrap() {
    let dir = module_dir().unwrap_or_default();
    logging::init(&dir);
    info!("==== res_hook {} loaded ====", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load_or_default(dir.join(CONFIG_FILE));
    let result = engine::in_process_context(config, &dir)
        .and_then(|context| engine::start_global(Arc::new(context)));
    if let Err(e) = result {
        error!("Engine failed to start: {}", e);
    }
}

/// Orderly shutdown: joins the engine threads and withdraws every
/// interception. Call from a thread that does not hold the loader lock. The
/// module itself stays mapped.
#[unsafe(no_mangle)]
pub extern "system" fn res_hook_shutdown() -> i32 {
    match engine::stop_global() {
        Ok(()) => 1,
        Err(e) => {
            error!("Shutdown incomplete: {}", e);
            0
        }
    }
}

#[unsafe(no_mangle)]
pub extern "system" fn DllMain(module: HMODULE, reason: u32, _reserved: *mut c_void) -> i32 {
    if reason == DLL_PROCESS_ATTACH {
        // Refuse to load rather than run unpinned
        if !pin(module) {
            return 0;
        }
        MODULE.store(module as usize, Ordering::SeqCst);
        unsafe { DisableThreadLibraryCalls(module) };
        if std::thread::Builder::new()
            .name("res-hook-bootstrap".into())
            .spawn(bootstrap)
            .is_err()
        {
            return 0;
        }
    }
    TRUE
}
