//! Engine lifecycle
//!
//! One [`EngineContext`] is built at attach and handed to [`start`], which
//! patches what it can up front, installs the graphics interceptions and
//! starts the background threads. [`EngineHandle::stop`] undoes all of it.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::address::{StaticAddress, VirtualAddress, translate};
use crate::config::{EngineConfig, ResolutionTarget};
use crate::error::{Error, Result};
use crate::graphics::{SurfaceCheck, SurfaceState};
use crate::hook::InterceptionEngine;
use crate::memory::{self, MemoryAccess};
use crate::pattern::Pattern;
use crate::pe::ModuleImage;
use crate::scanner::{AbortSource, ApplyHook, CandidateScanner, ScanInputs, ScanReport};
use crate::signal::CancelToken;
use crate::store::PersistenceStore;

/// Process-wide engine state, shared by every component
pub struct EngineContext {
    pub config: EngineConfig,
    pub memory: Arc<dyn MemoryAccess>,
    pub interceptor: Arc<InterceptionEngine>,
    pub store: Arc<dyn PersistenceStore>,
    pub surface: Arc<SurfaceState>,
    /// Live base of the target module, queried at this attach
    pub module_base: VirtualAddress,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        memory: Arc<dyn MemoryAccess>,
        interceptor: Arc<InterceptionEngine>,
        store: Arc<dyn PersistenceStore>,
        module_base: VirtualAddress,
    ) -> Self {
        Self {
            config,
            memory,
            interceptor,
            store,
            surface: Arc::new(SurfaceState::new()),
            module_base,
        }
    }

    pub fn resolution(&self) -> ResolutionTarget {
        self.config.settings
    }
}

/// Write the desired width and height into the target's own settings cells.
///
/// Both writes are verified. Works on any address space, so the front end
/// uses it against a remote process too.
pub fn apply_static_patch(
    memory: &dyn MemoryAccess,
    module_base: VirtualAddress,
    cells: (StaticAddress, StaticAddress),
    resolution: &ResolutionTarget,
) -> Result<()> {
    let width = translate(cells.0, module_base)?;
    let height = translate(cells.1, module_base)?;

    for (address, value) in [(width, resolution.width), (height, resolution.height)] {
        let previous = memory.read_u32(address).ok();
        memory::patch(memory, address, &value.to_le_bytes())?;
        info!("Patched {}: {:?} -> {}", address, previous, value);
    }
    Ok(())
}

/// Scan inputs for a module loaded at `image.base`: the persisted address
/// first, then the configured known addresses, then the data sections.
pub fn scan_inputs(
    config: &EngineConfig,
    memory: &dyn MemoryAccess,
    image: &ModuleImage,
    store: &dyn PersistenceStore,
) -> ScanInputs {
    let persisted = match store.load() {
        Ok(persisted) => persisted,
        Err(e) => {
            warn!("Persisted address unavailable: {}", e);
            None
        }
    };

    let translate_logged = |address: StaticAddress| match translate(address, image.base) {
        Ok(live) => Some(live),
        Err(e) => {
            warn!("Skipping {}: {}", address, e);
            None
        }
    };

    let apply_function = config
        .scan
        .apply_signature
        .as_deref()
        .and_then(|signature| locate_apply_function(memory, image, signature))
        .or_else(|| {
            persisted
                .as_ref()
                .and_then(|p| p.apply_function_address)
                .and_then(translate_logged)
        });

    ScanInputs {
        module_base: image.base,
        persisted: persisted
            .as_ref()
            .and_then(|p| translate_logged(p.validated_address)),
        known: config.known_addresses().filter_map(translate_logged).collect(),
        regions: image.sections.clone(),
        apply_function,
    }
}

/// First match of `signature` in the module's executable sections
pub fn locate_apply_function(
    memory: &dyn MemoryAccess,
    image: &ModuleImage,
    signature: &str,
) -> Option<VirtualAddress> {
    let Some(pattern) = Pattern::parse(signature) else {
        warn!("Ignoring malformed signature {:?}", signature);
        return None;
    };

    let found = image
        .executable_sections()
        .find_map(|section| pattern.scan(memory, section));
    match found {
        Some(address) => info!("Apply-settings function at {}", address),
        None => debug!("Signature {} not found", pattern),
    }
    found
}

/// Run one scan pass over the module at `context.module_base`
pub fn run_scan(
    context: &EngineContext,
    abort: &dyn AbortSource,
    apply: Option<&dyn ApplyHook>,
) -> Result<ScanReport> {
    let memory = context.memory.as_ref();
    let image = ModuleImage::parse(memory, context.module_base)?;
    let inputs = scan_inputs(&context.config, memory, &image, context.store.as_ref());
    let check = SurfaceCheck::new(Arc::clone(&context.surface), context.resolution());

    let mut scanner = CandidateScanner::new(memory, &check, abort, context.config.scan_config())
        .with_store(context.store.as_ref());
    if let Some(apply) = apply {
        scanner = scanner.with_apply(apply);
    }

    let report = scanner.run(&inputs);
    info!(
        "Scan finished: {:?} after {} candidate(s){}",
        report.state,
        report.candidates.len(),
        report
            .accepted
            .map(|a| format!(", accepted {a}"))
            .unwrap_or_default()
    );
    Ok(report)
}

/// Running engine; dropping it without [`EngineHandle::stop`] leaves the
/// threads and interceptions in place.
pub struct EngineHandle {
    context: Arc<EngineContext>,
    cancel: CancelToken,
    threads: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Cancel, wait for the threads, then detach every interception
    pub fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("engine").to_string();
            if thread.join().is_err() {
                warn!("{} thread panicked", name);
            }
        }
        self.teardown()
    }

    fn spawn_workers(&mut self, scan: bool) -> Result<()> {
        if scan && self.context.config.scan.enabled {
            let context = Arc::clone(&self.context);
            let cancel = self.cancel.clone();
            self.threads
                .push(spawn("res-hook-scan", move || scan_thread(&context, &cancel))?);
        }

        #[cfg(windows)]
        {
            let context = Arc::clone(&self.context);
            let cancel = self.cancel.clone();
            self.threads
                .push(spawn("res-hook-window", move || window_thread(&context, &cancel))?);
        }
        Ok(())
    }

    fn teardown(&self) -> Result<()> {
        crate::graphics::deactivate();
        self.context.interceptor.detach_all()?;
        info!("Engine stopped");
        Ok(())
    }
}

/// Bring the engine up: static patch, graphics interceptions, background
/// threads. Failures of individual parts are logged and the rest proceeds.
pub fn start(context: Arc<EngineContext>) -> Result<EngineHandle> {
    let resolution = context.resolution();
    info!(
        "Engine starting: {}x{} enabled={} backend={:?}",
        resolution.width, resolution.height, resolution.enabled, context.config.target.backend
    );

    if resolution.enabled
        && let Some(cells) = context.config.static_cells()
    {
        let memory = context.memory.as_ref();
        if let Err(e) = apply_static_patch(memory, context.module_base, cells, &resolution) {
            warn!("Static patch failed: {}", e);
        }
    }

    let graphics = install_graphics(&context);

    let mut handle = EngineHandle {
        context,
        cancel: CancelToken::new(),
        threads: Vec::new(),
    };
    if let Err(e) = handle.spawn_workers(graphics) {
        return Err(abandon(handle, e));
    }
    Ok(handle)
}

/// Undo a partial start. `cause` stays the reported error; a failed
/// cleanup is logged.
fn abandon(handle: EngineHandle, cause: Error) -> Error {
    if let Err(e) = handle.stop() {
        warn!("Cleanup after failed start incomplete: {}", e);
    }
    cause
}

fn spawn(name: &'static str, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.into())
        .spawn(body)
        .map_err(|source| Error::Spawn { name, source })
}

/// Whether a graphics path is installed, so a scan has something to observe
#[cfg(windows)]
fn install_graphics(context: &Arc<EngineContext>) -> bool {
    use crate::config::GraphicsBackend;
    use crate::graphics::{self, GraphicsContext, d3d9, ddraw};
    use crate::window::{Win32Windows, WindowEnforcer};

    let backend = context.config.target.backend;
    if backend == GraphicsBackend::None {
        return false;
    }

    let matcher = window_match(&context.config);
    let resolution = context.resolution();
    let graphics = GraphicsContext::new(
        Arc::clone(&context.interceptor),
        Arc::clone(&context.surface),
        resolution,
    )
    .with_nudge(move || {
        WindowEnforcer::new(Win32Windows, matcher.clone(), resolution).enforce();
    });
    let graphics = Arc::new(graphics);
    graphics::activate(Arc::clone(&graphics));

    let installed = match backend {
        GraphicsBackend::D3d9 => d3d9::install(&graphics),
        GraphicsBackend::Ddraw => ddraw::install(&graphics),
        GraphicsBackend::None => return false,
    };
    match installed {
        Ok(()) => true,
        Err(e) => {
            error!("Graphics interception unavailable ({:?}): {}", backend, e);
            false
        }
    }
}

#[cfg(not(windows))]
fn install_graphics(context: &Arc<EngineContext>) -> bool {
    debug!(
        "No graphics interception on this platform ({:?})",
        context.config.target.backend
    );
    false
}

fn scan_thread(context: &EngineContext, cancel: &CancelToken) {
    // Nothing to observe until the target has asked for a surface
    while context.surface.requested().is_none() {
        if cancel.wait(std::time::Duration::from_millis(250)) {
            return;
        }
    }

    let abort = scan_abort(cancel);
    let apply = apply_hook(context);
    if let Err(e) = run_scan(context, &abort, apply.as_ref().map(|a| a as &dyn ApplyHook)) {
        error!("Scan could not start: {}", e);
    }
}

#[cfg(windows)]
fn scan_abort(cancel: &CancelToken) -> crate::scanner::ScanAbort {
    use windows_sys::Win32::UI::Input::KeyboardAndMouse::{GetAsyncKeyState, VK_END};

    fn end_pressed() -> bool {
        (unsafe { GetAsyncKeyState(VK_END as i32) } as u16 & 0x8000) != 0
    }
    crate::scanner::ScanAbort::with_key(cancel.clone(), end_pressed)
}

#[cfg(not(windows))]
fn scan_abort(cancel: &CancelToken) -> crate::scanner::ScanAbort {
    crate::scanner::ScanAbort::new(cancel.clone())
}

/// Calls the target's apply-settings function in place
#[cfg(windows)]
struct InProcessApply(VirtualAddress);

#[cfg(windows)]
impl ApplyHook for InProcessApply {
    fn apply(&self) {
        let apply = unsafe { std::mem::transmute::<usize, unsafe extern "C" fn()>(self.0.value()) };
        unsafe { apply() };
    }
}

#[cfg(windows)]
fn apply_hook(context: &EngineContext) -> Option<InProcessApply> {
    // Only meaningful in our own address space
    if context.memory.space() != crate::address::AddressSpace::Local {
        return None;
    }
    let signature = context.config.scan.apply_signature.as_deref()?;
    let image = ModuleImage::parse(context.memory.as_ref(), context.module_base).ok()?;
    locate_apply_function(context.memory.as_ref(), &image, signature).map(InProcessApply)
}

#[cfg(not(windows))]
fn apply_hook(_context: &EngineContext) -> Option<NoApply> {
    None
}

#[cfg(not(windows))]
struct NoApply;

#[cfg(not(windows))]
impl ApplyHook for NoApply {
    fn apply(&self) {}
}

#[cfg(windows)]
fn window_match(config: &EngineConfig) -> crate::window::WindowMatch {
    use crate::window::WindowMatch;

    match &config.target.window_class {
        Some(class) => WindowMatch::Class(class.clone()),
        None => WindowMatch::Process(std::process::id()),
    }
}

#[cfg(windows)]
fn window_thread(context: &EngineContext, cancel: &CancelToken) {
    use crate::window::{Win32Windows, WindowEnforcer};

    let surface = Arc::clone(&context.surface);
    let matcher = window_match(&context.config);
    let enforcer = WindowEnforcer::new(Win32Windows, matcher, context.resolution())
        .on_resize(move |_, _| surface.request_reset());
    enforcer.run(context.config.enforce_interval(), cancel);
}

static RUNNING: Mutex<Option<EngineHandle>> = Mutex::new(None);

/// Start the process-wide engine once
pub fn start_global(context: Arc<EngineContext>) -> Result<()> {
    let mut running = RUNNING.lock().unwrap_or_else(|p| p.into_inner());
    if running.is_some() {
        return Err(Error::AlreadyRunning);
    }
    *running = Some(start(context)?);
    Ok(())
}

/// Stop the process-wide engine, if running. Returns once its threads have
/// exited and its interceptions are withdrawn.
pub fn stop_global() -> Result<()> {
    let handle = RUNNING.lock().unwrap_or_else(|p| p.into_inner()).take();
    match handle {
        Some(handle) => handle.stop(),
        None => Ok(()),
    }
}

/// Build the context for the process this module is loaded into
#[cfg(windows)]
pub fn in_process_context(config: EngineConfig, store_dir: &std::path::Path) -> Result<EngineContext> {
    use crate::hook::LoadedModules;
    use crate::memory::ProcessMemory;
    use crate::store::JsonFileStore;

    let target = crate::process::current()?;
    info!("Attached to {} (pid {}) at {}", target.name, target.pid, target.base);

    let memory: Arc<dyn MemoryAccess> = Arc::new(ProcessMemory::current());
    let interceptor = Arc::new(InterceptionEngine::new(
        Arc::clone(&memory),
        Arc::new(LoadedModules::process()),
    ));

    let installation = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_default();
    let store = Arc::new(JsonFileStore::in_dir(store_dir, &installation));

    Ok(EngineContext::new(config, memory, interceptor, store, target.base))
}
