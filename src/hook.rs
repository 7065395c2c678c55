//! Interception engine
//!
//! Redirects calls by rewriting function-pointer slots rather than code:
//! import address table entries of the importing modules (plus the export
//! table entry, when the replacement is expressible as an RVA) for export
//! redirects, and one dispatch-table entry for vtable redirects. Because the
//! original function is left untouched, the saved original pointer is itself
//! the trampoline: calling it runs the unmodified target.
//!
//! Installation is transactional. [`InterceptionEngine::begin`] takes the
//! process-wide transaction lock; sites are prepared with
//! [`Transaction::attach`] and written together by [`Transaction::commit`].
//! If any slot fails to write, every slot already written is restored and
//! no site is installed.
//!
//! While other threads are suspended, the engine neither allocates nor logs:
//! a suspended thread may hold the heap or a log sink lock. Buffers are
//! reserved before the freeze and messages are emitted after it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::address::VirtualAddress;
use crate::error::{HookError, MemoryError};
use crate::memory::{self, MemoryAccess};
use crate::pe::{ModuleImage, module_name_matches};

/// What to intercept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptionTarget {
    /// A named export, redirected process-wide
    ExportRedirect { module: String, symbol: String },
    /// Entry `slot_index` of the dispatch table `object` points to
    VtableSlot {
        object: VirtualAddress,
        slot_index: usize,
    },
}

impl InterceptionTarget {
    pub fn export(module: &str, symbol: &str) -> Self {
        InterceptionTarget::ExportRedirect {
            module: module.to_string(),
            symbol: symbol.to_string(),
        }
    }

    pub fn vtable(object: VirtualAddress, slot_index: usize) -> Self {
        InterceptionTarget::VtableSlot { object, slot_index }
    }

    pub fn kind(&self) -> InterceptionKind {
        match self {
            InterceptionTarget::ExportRedirect { .. } => InterceptionKind::ExportRedirect,
            InterceptionTarget::VtableSlot { .. } => InterceptionKind::VtableSlot,
        }
    }
}

impl fmt::Display for InterceptionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptionTarget::ExportRedirect { module, symbol } => write!(f, "{module}!{symbol}"),
            InterceptionTarget::VtableSlot { object, slot_index } => {
                write!(f, "vtable[{slot_index}] of {object}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptionKind {
    ExportRedirect,
    VtableSlot,
}

/// Handle to an installed interception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(u64);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of preparing a site: the original stays callable through
/// `original` for as long as the site is installed, and after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    pub id: SiteId,
    pub original: VirtualAddress,
}

/// Identity of an entry point, used to refuse double installation
#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKey {
    Export { module: String, symbol: String },
    Slot(VirtualAddress),
}

impl EntryKey {
    fn matches(&self, other: &EntryKey) -> bool {
        match (self, other) {
            (
                EntryKey::Export { module, symbol },
                EntryKey::Export {
                    module: other_module,
                    symbol: other_symbol,
                },
            ) => symbol == other_symbol && module_name_matches(module, other_module),
            (EntryKey::Slot(a), EntryKey::Slot(b)) => a == b,
            _ => false,
        }
    }
}

/// How a slot stores a function address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotEncoding {
    /// Pointer-sized absolute address (IAT entries, vtable entries)
    Absolute,
    /// 32-bit RVA relative to a module base (EAT entries)
    Rva { base: VirtualAddress },
}

impl SlotEncoding {
    fn encode(self, function: VirtualAddress) -> Option<Vec<u8>> {
        match self {
            SlotEncoding::Absolute => Some(function.value().to_le_bytes().to_vec()),
            SlotEncoding::Rva { base } => {
                let offset = function.offset_from(base);
                #[cfg(target_pointer_width = "64")]
                if function < base || offset > u32::MAX as usize {
                    return None;
                }
                Some((offset as u32).to_le_bytes().to_vec())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PatchSlot {
    address: VirtualAddress,
    original: Vec<u8>,
    replacement: Vec<u8>,
}

/// One hooked entry point
#[derive(Debug, Clone)]
pub struct InterceptionSite {
    pub id: SiteId,
    pub target: InterceptionTarget,
    pub original: VirtualAddress,
    pub replacement: VirtualAddress,
    pub installed: bool,
    key: EntryKey,
    slots: Vec<PatchSlot>,
}

impl InterceptionSite {
    pub fn kind(&self) -> InterceptionKind {
        self.target.kind()
    }

    /// Number of pointer slots this site rewrites
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Finds loaded modules for export redirects
pub trait ModuleResolver: Send + Sync {
    /// Base of a loaded module, by file name
    fn module_base(&self, module: &str) -> Option<VirtualAddress>;

    /// Modules whose import tables should be redirected
    fn importers(&self) -> Vec<VirtualAddress>;
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Suspend the process's other threads while slots are written. Only
    /// honoured when patching our own address space.
    pub suspend_threads: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            suspend_threads: cfg!(windows),
        }
    }
}

#[derive(Default)]
struct EngineState {
    sites: Vec<InterceptionSite>,
    /// Slots a failed rollback left redirected
    stranded: Vec<PatchSlot>,
    next_id: u64,
}

impl EngineState {
    fn find(&self, id: SiteId) -> Option<usize> {
        self.sites.iter().position(|site| site.id == id)
    }
}

/// Installs and removes interceptions in one address space
pub struct InterceptionEngine {
    memory: Arc<dyn MemoryAccess>,
    resolver: Arc<dyn ModuleResolver>,
    options: EngineOptions,
    state: Mutex<EngineState>,
}

impl InterceptionEngine {
    pub fn new(memory: Arc<dyn MemoryAccess>, resolver: Arc<dyn ModuleResolver>) -> Self {
        Self::with_options(memory, resolver, EngineOptions::default())
    }

    pub fn with_options(
        memory: Arc<dyn MemoryAccess>,
        resolver: Arc<dyn ModuleResolver>,
        options: EngineOptions,
    ) -> Self {
        Self {
            memory,
            resolver,
            options,
            state: Mutex::new(EngineState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // A panic mid-commit leaves the table consistent: sites are only
        // recorded after all their slots are written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a transaction, waiting for any other to finish
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            engine: self,
            state: self.lock(),
            pending: Vec::new(),
        }
    }

    /// Prepare and commit a single site
    pub fn install(
        &self,
        target: InterceptionTarget,
        replacement: VirtualAddress,
    ) -> Result<Attached, HookError> {
        let mut transaction = self.begin();
        let attached = transaction.attach(target, replacement)?;
        transaction.commit()?;
        Ok(attached)
    }

    /// Restore a site's original slots. Unknown or already detached sites
    /// are a no-op.
    pub fn detach(&self, id: SiteId) -> Result<(), HookError> {
        let mut state = self.lock();
        let Some(pos) = state.find(id) else {
            return Ok(());
        };

        let memory = self.memory.as_ref();
        let restored = {
            let _frozen = self.quiesce();
            state.sites[pos]
                .slots
                .iter()
                .try_for_each(|slot| memory::patch(memory, slot.address, &slot.original))
        };
        restored?;

        let site = state.sites.remove(pos);
        info!("Detached {} ({})", site.target, site.id);
        Ok(())
    }

    /// Detach every installed site and retry slots a failed rollback left
    /// behind, continuing past failures. Returns the first failure, if any.
    pub fn detach_all(&self) -> Result<(), HookError> {
        let mut state = self.lock();
        let memory = self.memory.as_ref();
        let restore = |slot: &PatchSlot| memory::patch(memory, slot.address, &slot.original);

        let mut site_outcomes = Vec::with_capacity(state.sites.len());
        let mut stranded_outcomes = Vec::with_capacity(state.stranded.len());
        {
            let _frozen = self.quiesce();
            for slot in &state.stranded {
                stranded_outcomes.push(restore(slot));
            }
            // Newest first, so stacked slots unwind in reverse
            for site in state.sites.iter().rev() {
                site_outcomes.push(site.slots.iter().rev().try_for_each(&restore));
            }
        }

        let mut first_error = None;
        let mut kept = Vec::new();
        let sites = std::mem::take(&mut state.sites);
        for (site, outcome) in sites.into_iter().rev().zip(site_outcomes) {
            match outcome {
                Ok(()) => info!("Detached {} ({})", site.target, site.id),
                Err(e) => {
                    warn!("Failed to detach {}: {}", site.target, e);
                    first_error.get_or_insert(HookError::Memory(e));
                    kept.push(site);
                }
            }
        }
        kept.reverse();
        state.sites = kept;

        let stranded = std::mem::take(&mut state.stranded);
        for (slot, outcome) in stranded.into_iter().zip(stranded_outcomes) {
            match outcome {
                Ok(()) => info!("Restored stranded slot {}", slot.address),
                Err(e) => {
                    warn!("Slot {} is still redirected: {}", slot.address, e);
                    first_error.get_or_insert(HookError::Memory(e));
                    state.stranded.push(slot);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub fn is_installed(&self, id: SiteId) -> bool {
        self.lock().find(id).is_some()
    }

    pub fn installed_count(&self) -> usize {
        self.lock().sites.len()
    }

    /// Snapshot of the installed sites
    pub fn sites(&self) -> Vec<InterceptionSite> {
        self.lock().sites.clone()
    }

    /// Slots left redirected by a failed rollback, awaiting `detach_all`
    pub fn stranded_count(&self) -> usize {
        self.lock().stranded.len()
    }

    fn quiesce(&self) -> Option<freeze::FrozenThreads> {
        use crate::address::AddressSpace;

        if self.options.suspend_threads && self.memory.space() == AddressSpace::Local {
            Some(freeze::FrozenThreads::suspend_others())
        } else {
            None
        }
    }

    fn resolve(
        &self,
        target: &InterceptionTarget,
        replacement: VirtualAddress,
    ) -> Result<(EntryKey, VirtualAddress, Vec<PatchSlot>), HookError> {
        match target {
            InterceptionTarget::ExportRedirect { module, symbol } => {
                self.resolve_export(module, symbol, replacement)
            }
            InterceptionTarget::VtableSlot { object, slot_index } => {
                self.resolve_vtable(*object, *slot_index, replacement)
            }
        }
    }

    fn resolve_export(
        &self,
        module: &str,
        symbol: &str,
        replacement: VirtualAddress,
    ) -> Result<(EntryKey, VirtualAddress, Vec<PatchSlot>), HookError> {
        let memory = self.memory.as_ref();
        let base = self
            .resolver
            .module_base(module)
            .ok_or_else(|| HookError::ModuleNotFound(module.to_string()))?;

        let image = ModuleImage::parse(memory, base)?;
        let export = image
            .export(memory, symbol)?
            .ok_or_else(|| HookError::FunctionNotFound {
                module: module.to_string(),
                symbol: symbol.to_string(),
            })?;
        if export.forwarded {
            return Err(HookError::UnsupportedExport {
                module: module.to_string(),
                symbol: symbol.to_string(),
            });
        }

        let mut slots = Vec::new();
        for importer in self.resolver.importers() {
            // Modules can unload between enumeration and parsing
            let found = ModuleImage::parse(memory, importer)
                .and_then(|image| image.import_slots(memory, module, symbol, Some(export.address)));
            let found = match found {
                Ok(found) => found,
                Err(e) => {
                    debug!("Skipping importer {}: {}", importer, e);
                    continue;
                }
            };
            for address in found {
                let bound = memory.read_usize(address)?;
                // Already pointing elsewhere (another hook); leave it alone
                if bound != export.address.value() {
                    debug!("Skipping IAT slot {} not bound to {}!{}", address, module, symbol);
                    continue;
                }
                slots.push(PatchSlot {
                    address,
                    original: bound.to_le_bytes().to_vec(),
                    replacement: replacement.value().to_le_bytes().to_vec(),
                });
            }
        }

        // Export table entry catches later GetProcAddress lookups
        let rva = SlotEncoding::Rva { base: image.base };
        match rva.encode(replacement) {
            Some(encoded) => slots.push(PatchSlot {
                address: export.slot,
                original: export.rva.to_le_bytes().to_vec(),
                replacement: encoded,
            }),
            None => debug!(
                "Replacement {} not expressible as an RVA of {}; export table left as is",
                replacement, module
            ),
        }

        if slots.is_empty() {
            return Err(HookError::ImportNotFound {
                module: module.to_string(),
                symbol: symbol.to_string(),
            });
        }

        let key = EntryKey::Export {
            module: module.to_string(),
            symbol: symbol.to_string(),
        };
        Ok((key, export.address, slots))
    }

    fn resolve_vtable(
        &self,
        object: VirtualAddress,
        slot_index: usize,
        replacement: VirtualAddress,
    ) -> Result<(EntryKey, VirtualAddress, Vec<PatchSlot>), HookError> {
        let memory = self.memory.as_ref();
        let invalid = |_: MemoryError| HookError::InvalidObject { object };

        let table = VirtualAddress::new(memory.read_usize(object).map_err(invalid)?);
        if table.is_null() {
            return Err(HookError::InvalidObject { object });
        }

        let slot = table.add(slot_index * size_of::<usize>());
        let original = VirtualAddress::new(memory.read_usize(slot).map_err(invalid)?);
        if original.is_null() {
            return Err(HookError::InvalidObject { object });
        }

        let encoded = SlotEncoding::Absolute.encode(replacement).unwrap_or_default();
        let patch = PatchSlot {
            address: slot,
            original: original.value().to_le_bytes().to_vec(),
            replacement: encoded,
        };
        Ok((EntryKey::Slot(slot), original, vec![patch]))
    }
}

/// A batch of sites installed all-or-nothing. Holds the transaction lock
/// until committed or dropped; dropping without commit writes nothing.
pub struct Transaction<'a> {
    engine: &'a InterceptionEngine,
    state: MutexGuard<'a, EngineState>,
    pending: Vec<InterceptionSite>,
}

impl Transaction<'_> {
    /// Prepare `target` to be redirected to `replacement`.
    ///
    /// Fails without side effects if the entry point is already installed
    /// or already prepared in this transaction.
    pub fn attach(
        &mut self,
        target: InterceptionTarget,
        replacement: VirtualAddress,
    ) -> Result<Attached, HookError> {
        let (key, original, slots) = self.engine.resolve(&target, replacement)?;

        if self.state.sites.iter().any(|site| site.key.matches(&key)) {
            return Err(HookError::AlreadyInstalled(target.to_string()));
        }
        if self.pending.iter().any(|site| site.key.matches(&key)) {
            return Err(HookError::AlreadyPrepared(target.to_string()));
        }

        let id = SiteId(self.state.next_id);
        self.state.next_id += 1;

        debug!(
            "Prepared {} ({}): {} slot(s), original {}",
            target,
            id,
            slots.len(),
            original
        );
        self.pending.push(InterceptionSite {
            id,
            target,
            original,
            replacement,
            installed: false,
            key,
            slots,
        });

        Ok(Attached { id, original })
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Write every prepared slot. On failure all written slots are
    /// restored and no site is installed. Slots that cannot be restored are
    /// reported in [`HookError::RollbackIncomplete`] and kept for
    /// [`InterceptionEngine::detach_all`].
    pub fn commit(mut self) -> Result<Vec<SiteId>, HookError> {
        let memory = self.engine.memory.as_ref();
        let total: usize = self.pending.iter().map(|site| site.slots.len()).sum();

        let mut written: Vec<&PatchSlot> = Vec::with_capacity(total);
        let mut stranded: Vec<(&PatchSlot, MemoryError)> = Vec::with_capacity(total);
        let mut failure = None;

        let frozen = self.engine.quiesce();
        'sites: for (index, site) in self.pending.iter().enumerate() {
            for slot in &site.slots {
                if let Err(e) = memory::patch(memory, slot.address, &slot.replacement) {
                    // A write that failed verification may still have changed the slot
                    if memory.holds(slot.address, &slot.original) == Ok(false) {
                        written.push(slot);
                    }
                    failure = Some((index, slot.address, e));
                    break 'sites;
                }
                written.push(slot);
            }
        }
        if failure.is_some() {
            for &slot in written.iter().rev() {
                if let Err(e) = memory::patch(memory, slot.address, &slot.original) {
                    stranded.push((slot, e));
                }
            }
        }
        drop(frozen);

        if let Some((index, address, source)) = failure {
            warn!(
                "Commit failed writing {} for {}: {}",
                address, self.pending[index].target, source
            );
            if stranded.is_empty() {
                return Err(HookError::Transaction { source });
            }

            for (slot, e) in &stranded {
                warn!("Rollback of {} failed: {}", slot.address, e);
            }
            let addresses = stranded.iter().map(|(slot, _)| slot.address).collect();
            self.state
                .stranded
                .extend(stranded.into_iter().map(|(slot, _)| slot.clone()));
            return Err(HookError::RollbackIncomplete {
                source,
                stranded: addresses,
            });
        }

        let pending = std::mem::take(&mut self.pending);
        let mut ids = Vec::with_capacity(pending.len());
        for mut site in pending {
            site.installed = true;
            info!("Installed {} ({}) -> {}", site.target, site.id, site.replacement);
            ids.push(site.id);
            self.state.sites.push(site);
        }
        Ok(ids)
    }
}

#[cfg(all(windows, not(test)))]
mod freeze {
    use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};

    use windows_sys::Win32::Foundation::*;
    use windows_sys::Win32::System::Diagnostics::ToolHelp::*;
    use windows_sys::Win32::System::Threading::*;

    /// Thread access rights for suspending/resuming threads
    const THREAD_ACCESS: u32 = THREAD_SUSPEND_RESUME | THREAD_QUERY_INFORMATION;

    /// Threads suspended for a slot rewrite; resumed on drop
    pub struct FrozenThreads {
        /// Thread id and, once suspended, its handle
        threads: Vec<(u32, Option<OwnedHandle>)>,
    }

    impl FrozenThreads {
        /// Enumerate all threads in the current process, then suspend every
        /// one except the caller. Threads that cannot be opened are skipped.
        ///
        /// Nothing is allocated after the first suspension; the list is
        /// sized during enumeration.
        pub fn suspend_others() -> Self {
            let mut threads = other_thread_ids();

            for (id, handle) in threads.iter_mut() {
                unsafe {
                    let thread = OpenThread(THREAD_ACCESS, 0, *id);
                    if thread.is_null() {
                        continue;
                    }
                    if SuspendThread(thread) != u32::MAX {
                        *handle = Some(OwnedHandle::from_raw_handle(thread));
                    } else {
                        CloseHandle(thread);
                    }
                }
            }

            Self { threads }
        }
    }

    fn other_thread_ids() -> Vec<(u32, Option<OwnedHandle>)> {
        let mut threads = Vec::new();

        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0);
            if snapshot == INVALID_HANDLE_VALUE {
                return threads;
            }

            let mut te: THREADENTRY32 = std::mem::zeroed();
            te.dwSize = size_of::<THREADENTRY32>() as u32;

            let pid = GetCurrentProcessId();
            let tid = GetCurrentThreadId();
            if Thread32First(snapshot, &mut te) != 0 {
                loop {
                    if te.th32OwnerProcessID == pid && te.th32ThreadID != tid {
                        threads.push((te.th32ThreadID, None));
                    }

                    te.dwSize = size_of::<THREADENTRY32>() as u32;
                    if Thread32Next(snapshot, &mut te) == 0 {
                        break;
                    }
                }
            }

            CloseHandle(snapshot);
        }

        threads
    }

    impl Drop for FrozenThreads {
        fn drop(&mut self) {
            for (_, handle) in &self.threads {
                if let Some(handle) = handle {
                    unsafe {
                        ResumeThread(handle.as_raw_handle());
                    }
                }
            }
        }
    }
}

#[cfg(any(not(windows), test))]
mod freeze {
    /// Thread suspension is a Win32 facility. Elsewhere, and in unit tests,
    /// this only marks the window in which nothing may allocate.
    pub struct FrozenThreads;

    impl FrozenThreads {
        pub fn suspend_others() -> Self {
            #[cfg(test)]
            crate::testing::frozen_allocations::set_frozen(true);
            FrozenThreads
        }
    }

    #[cfg(test)]
    impl Drop for FrozenThreads {
        fn drop(&mut self) {
            crate::testing::frozen_allocations::set_frozen(false);
        }
    }
}

/// Resolver for the calling process. Every loaded module except this one
/// is an importer: overlays and wrapper DLLs resolve the graphics factory
/// through their own import tables, not the host's.
#[cfg(windows)]
pub struct LoadedModules {
    own: Option<VirtualAddress>,
}

#[cfg(windows)]
impl LoadedModules {
    pub fn process() -> Self {
        use windows_sys::Win32::System::LibraryLoader::{
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            GetModuleHandleExW,
        };

        let mut module = std::ptr::null_mut();
        let found = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                Self::process as *const () as *const u16,
                &mut module,
            )
        } != 0;
        Self {
            own: found.then(|| VirtualAddress::new(module as usize)),
        }
    }
}

#[cfg(windows)]
impl ModuleResolver for LoadedModules {
    /// Loads the module if the host has not yet, so its factory can be
    /// redirected before the first call.
    fn module_base(&self, module: &str) -> Option<VirtualAddress> {
        use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, LoadLibraryW};

        let wide: Vec<u16> = module.encode_utf16().chain(std::iter::once(0)).collect();
        let mut handle = unsafe { GetModuleHandleW(wide.as_ptr()) };
        if handle.is_null() {
            handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        }
        (!handle.is_null()).then(|| VirtualAddress::new(handle as usize))
    }

    /// Enumerated on every call, so modules loaded after start are covered
    fn importers(&self) -> Vec<VirtualAddress> {
        use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
        use windows_sys::Win32::System::Threading::GetCurrentProcessId;

        let pid = unsafe { GetCurrentProcessId() };
        match crate::process::module_bases(pid) {
            Ok(bases) => bases.into_iter().filter(|base| Some(*base) != self.own).collect(),
            Err(e) => {
                warn!("Module enumeration failed, redirecting the host only: {}", e);
                let host = unsafe { GetModuleHandleW(std::ptr::null()) };
                vec![VirtualAddress::new(host as usize)]
            }
        }
    }
}
