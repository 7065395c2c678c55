//! Test doubles: a paged fake address space and a PE image builder.

use std::collections::{BTreeMap, HashMap};
use std::mem::size_of;
use std::sync::Mutex;

use crate::address::{AddressSpace, VirtualAddress};
use crate::error::MemoryError;
use crate::memory::{MemoryAccess, PAGE_SIZE, Protection, RegionInfo};

/// Counts the heap operations a thread performs while the interception
/// engine has other threads frozen.
pub mod frozen_allocations {
    use std::alloc::{GlobalAlloc, Layout, System};
    use std::cell::Cell;

    thread_local! {
        static FROZEN: Cell<bool> = const { Cell::new(false) };
        static COUNT: Cell<usize> = const { Cell::new(0) };
    }

    pub fn set_frozen(frozen: bool) {
        FROZEN.with(|cell| cell.set(frozen));
    }

    /// Heap operations this thread made inside frozen windows so far
    pub fn count() -> usize {
        COUNT.with(Cell::get)
    }

    fn note() {
        let _ = FROZEN.try_with(|frozen| {
            if frozen.get() {
                let _ = COUNT.try_with(|count| count.set(count.get() + 1));
            }
        });
    }

    struct CountingAllocator;

    unsafe impl GlobalAlloc for CountingAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            note();
            unsafe { System.alloc(layout) }
        }

        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            note();
            unsafe { System.alloc_zeroed(layout) }
        }

        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            note();
            unsafe { System.realloc(ptr, layout, new_size) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            note();
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    #[global_allocator]
    static ALLOCATOR: CountingAllocator = CountingAllocator;
}

struct MockPage {
    data: Vec<u8>,
    protection: Protection,
}

#[derive(Default)]
struct MockState {
    pages: BTreeMap<usize, MockPage>,
    /// Address -> writes still accepted before later ones are dropped
    ignored: HashMap<usize, usize>,
    writes: usize,
    reads: usize,
}

/// Fake address space with per-page protection and unmapped holes.
#[derive(Default)]
pub struct MockMemory {
    state: Mutex<MockState>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map zeroed pages covering `base..base+size`
    pub fn map(&self, base: usize, size: usize, protection: Protection) {
        let mut state = self.state.lock().unwrap();
        let start = base - base % PAGE_SIZE;
        let mut page = start;
        while page < base + size {
            state.pages.insert(
                page,
                MockPage {
                    data: vec![0; PAGE_SIZE],
                    protection,
                },
            );
            page += PAGE_SIZE;
        }
    }

    pub fn unmap(&self, base: usize) {
        self.state.lock().unwrap().pages.remove(&(base - base % PAGE_SIZE));
    }

    /// Silently drop writes to this exact address
    pub fn ignore_writes_at(&self, address: usize) {
        self.ignore_writes_at_after(address, 0);
    }

    /// Accept `accepted` writes to this exact address, then drop the rest
    pub fn ignore_writes_at_after(&self, address: usize, accepted: usize) {
        self.state.lock().unwrap().ignored.insert(address, accepted);
    }

    pub fn accept_writes_at(&self, address: usize) {
        self.state.lock().unwrap().ignored.remove(&address);
    }

    /// Write ignoring protection
    pub fn poke(&self, address: usize, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        for (i, byte) in bytes.iter().enumerate() {
            let at = address + i;
            let page = state
                .pages
                .get_mut(&(at - at % PAGE_SIZE))
                .expect("poke into unmapped page");
            page.data[at % PAGE_SIZE] = *byte;
        }
    }

    pub fn poke_u16(&self, address: usize, value: u16) {
        self.poke(address, &value.to_le_bytes());
    }

    pub fn poke_u32(&self, address: usize, value: u32) {
        self.poke(address, &value.to_le_bytes());
    }

    pub fn poke_usize(&self, address: usize, value: usize) {
        self.poke(address, &value.to_le_bytes());
    }

    /// Read ignoring protection
    pub fn peek_u32(&self, address: usize) -> u32 {
        let state = self.state.lock().unwrap();
        let mut buf = [0u8; 4];
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = address + i;
            *byte = state.pages[&(at - at % PAGE_SIZE)].data[at % PAGE_SIZE];
        }
        u32::from_le_bytes(buf)
    }

    pub fn peek_usize(&self, address: usize) -> usize {
        let state = self.state.lock().unwrap();
        let mut buf = [0u8; size_of::<usize>()];
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = address + i;
            *byte = state.pages[&(at - at % PAGE_SIZE)].data[at % PAGE_SIZE];
        }
        usize::from_le_bytes(buf)
    }

    pub fn protection_at(&self, address: usize) -> Option<Protection> {
        let state = self.state.lock().unwrap();
        state
            .pages
            .get(&(address - address % PAGE_SIZE))
            .map(|page| page.protection)
    }

    /// Number of successful `write_unchecked` calls
    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Number of `read_into` calls, failed ones included
    pub fn read_count(&self) -> usize {
        self.state.lock().unwrap().reads
    }
}

impl MemoryAccess for MockMemory {
    fn space(&self) -> AddressSpace {
        AddressSpace::Local
    }

    fn read_into(&self, address: VirtualAddress, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut state = self.state.lock().unwrap();
        state.reads += 1;
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = address.value() + i;
            match state.pages.get(&(at - at % PAGE_SIZE)) {
                Some(page) if page.protection.is_readable() => *byte = page.data[at % PAGE_SIZE],
                _ => return Err(MemoryError::Fault { address }),
            }
        }
        Ok(())
    }

    fn write_unchecked(&self, address: VirtualAddress, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut state = self.state.lock().unwrap();
        for i in 0..bytes.len() {
            let at = address.value() + i;
            match state.pages.get(&(at - at % PAGE_SIZE)) {
                Some(page) if page.protection.is_writable() => {}
                _ => return Err(MemoryError::Fault { address }),
            }
        }

        let ignored = match state.ignored.get_mut(&address.value()) {
            Some(0) => true,
            Some(accepted) => {
                *accepted -= 1;
                false
            }
            None => false,
        };
        if !ignored {
            for (i, byte) in bytes.iter().enumerate() {
                let at = address.value() + i;
                if let Some(page) = state.pages.get_mut(&(at - at % PAGE_SIZE)) {
                    page.data[at % PAGE_SIZE] = *byte;
                }
            }
        }
        state.writes += 1;
        Ok(())
    }

    fn protect(
        &self,
        address: VirtualAddress,
        size: usize,
        protection: Protection,
    ) -> Result<Protection, MemoryError> {
        let mut state = self.state.lock().unwrap();
        let first = address.page_floor(PAGE_SIZE).value();
        let end = address.value() + size.max(1);

        let mut page = first;
        while page < end {
            if !state.pages.contains_key(&page) {
                return Err(MemoryError::ProtectFailed { address, code: 487 });
            }
            page += PAGE_SIZE;
        }

        let old = state.pages[&first].protection;
        let mut page = first;
        while page < end {
            if let Some(entry) = state.pages.get_mut(&page) {
                entry.protection = protection;
            }
            page += PAGE_SIZE;
        }
        Ok(old)
    }

    fn query(&self, address: VirtualAddress) -> Option<RegionInfo> {
        let state = self.state.lock().unwrap();
        let base = address.page_floor(PAGE_SIZE);
        state.pages.get(&base.value()).map(|page| RegionInfo {
            base,
            size: PAGE_SIZE,
            protection: page.protection,
            committed: true,
        })
    }
}

pub const SCN_CODE: u32 = 0x6000_0020;
pub const SCN_RDATA: u32 = 0x4000_0040;
pub const SCN_DATA: u32 = 0xC000_0040;

struct SectionDef {
    name: &'static str,
    rva: u32,
    size: u32,
    characteristics: u32,
}

struct ImportDef {
    dll: String,
    symbols: Vec<(String, usize)>,
}

struct TableCursor<'a> {
    memory: &'a MockMemory,
    base: usize,
    next: u32,
}

impl TableCursor<'_> {
    fn alloc(&mut self, len: usize) -> u32 {
        let rva = self.next;
        self.next += (len as u32).next_multiple_of(8);
        rva
    }

    fn string(&mut self, s: &str) -> u32 {
        let rva = self.alloc(s.len() + 1);
        self.memory.poke(self.base + rva as usize, s.as_bytes());
        rva
    }
}

/// Slots created by [`ImageBuilder::build`]
pub struct BuiltImage {
    pub base: VirtualAddress,
    /// IAT entry per imported symbol
    pub iat: HashMap<String, VirtualAddress>,
    /// AddressOfFunctions entry per exported symbol
    pub eat: HashMap<String, VirtualAddress>,
}

/// Writes a minimal PE image of this build's bitness into a [`MockMemory`].
pub struct ImageBuilder {
    base: usize,
    dll_name: String,
    sections: Vec<SectionDef>,
    imports: Vec<ImportDef>,
    exports: Vec<(String, u32)>,
    forwarded: Vec<String>,
}

impl ImageBuilder {
    pub fn new(base: usize) -> Self {
        Self {
            base,
            dll_name: "target.exe".into(),
            sections: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            forwarded: Vec::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.dll_name = name.into();
        self
    }

    pub fn section(mut self, name: &'static str, rva: u32, size: u32, characteristics: u32) -> Self {
        self.sections.push(SectionDef {
            name,
            rva,
            size,
            characteristics,
        });
        self
    }

    /// Import `symbol` from `dll`, with the IAT pre-bound to `bound`
    pub fn import(mut self, dll: &str, symbol: &str, bound: usize) -> Self {
        match self.imports.iter_mut().find(|import| import.dll == dll) {
            Some(import) => import.symbols.push((symbol.into(), bound)),
            None => self.imports.push(ImportDef {
                dll: dll.into(),
                symbols: vec![(symbol.into(), bound)],
            }),
        }
        self
    }

    pub fn export(mut self, symbol: &str, rva: u32) -> Self {
        self.exports.push((symbol.into(), rva));
        self
    }

    /// Export whose RVA points back into the export directory
    pub fn forwarded_export(mut self, symbol: &str) -> Self {
        self.forwarded.push(symbol.into());
        self
    }

    pub fn build(self, memory: &MockMemory) -> BuiltImage {
        let is_64 = size_of::<usize>() == 8;
        let ptr = size_of::<usize>();
        let base = self.base;

        let tables_rva = self
            .sections
            .iter()
            .map(|s| (s.rva + s.size).next_multiple_of(PAGE_SIZE as u32))
            .max()
            .unwrap_or(0x1000);
        let tables_size = 0x2000u32;

        memory.map(base, PAGE_SIZE, Protection::ReadOnly);
        for section in &self.sections {
            let protection = match section.characteristics {
                c if c & 0x8000_0000 != 0 && c & 0x2000_0000 != 0 => Protection::ExecuteReadWrite,
                c if c & 0x8000_0000 != 0 => Protection::ReadWrite,
                c if c & 0x2000_0000 != 0 => Protection::ExecuteRead,
                _ => Protection::ReadOnly,
            };
            memory.map(base + section.rva as usize, section.size as usize, protection);
        }
        memory.map(base + tables_rva as usize, tables_size as usize, Protection::ReadOnly);

        // Headers
        let nt = 0x80usize;
        let opt = nt + 24;
        let opt_size: u16 = if is_64 { 240 } else { 224 };
        let section_count = self.sections.len() as u16 + 1;
        memory.poke(base, b"MZ");
        memory.poke_u32(base + 0x3c, nt as u32);
        memory.poke(base + nt, b"PE\0\0");
        memory.poke_u16(base + nt + 4, if is_64 { 0x8664 } else { 0x14c });
        memory.poke_u16(base + nt + 6, section_count);
        memory.poke_u16(base + nt + 20, opt_size);
        memory.poke_u16(base + opt, if is_64 { 0x20b } else { 0x10b });
        if is_64 {
            memory.poke(base + opt + 24, &(base as u64).to_le_bytes());
        } else {
            memory.poke_u32(base + opt + 28, base as u32);
        }
        memory.poke_u32(base + opt + 56, tables_rva + tables_size);
        let (count_at, dirs_at) = if is_64 { (108, 112) } else { (92, 96) };
        memory.poke_u32(base + opt + count_at, 16);
        let dirs = base + opt + dirs_at;

        let mut table = base + opt + opt_size as usize;
        let mut write_section = |name: &str, rva: u32, size: u32, characteristics: u32| {
            let mut raw = [0u8; 8];
            raw[..name.len()].copy_from_slice(name.as_bytes());
            memory.poke(table, &raw);
            memory.poke_u32(table + 8, size);
            memory.poke_u32(table + 12, rva);
            memory.poke_u32(table + 16, size);
            memory.poke_u32(table + 36, characteristics);
            table += 40;
        };
        for section in &self.sections {
            write_section(section.name, section.rva, section.size, section.characteristics);
        }
        write_section(".rdata", tables_rva, tables_size, SCN_RDATA);

        // Tables
        let mut cursor = TableCursor {
            memory,
            base,
            next: tables_rva,
        };
        let mut iat = HashMap::new();
        if !self.imports.is_empty() {
            let descriptors = cursor.alloc((self.imports.len() + 1) * 20);
            memory.poke_u32(dirs + 8, descriptors);
            memory.poke_u32(dirs + 12, ((self.imports.len() + 1) * 20) as u32);

            for (i, import) in self.imports.iter().enumerate() {
                let name = cursor.string(&import.dll);
                let oft = cursor.alloc((import.symbols.len() + 1) * ptr);
                let ft = cursor.alloc((import.symbols.len() + 1) * ptr);
                for (j, (symbol, bound)) in import.symbols.iter().enumerate() {
                    let hint_name = cursor.alloc(2 + symbol.len() + 1);
                    memory.poke(base + hint_name as usize + 2, symbol.as_bytes());
                    memory.poke_usize(base + oft as usize + j * ptr, hint_name as usize);
                    let slot = base + ft as usize + j * ptr;
                    memory.poke_usize(slot, *bound);
                    iat.insert(symbol.clone(), VirtualAddress::new(slot));
                }
                let descriptor = base + descriptors as usize + i * 20;
                memory.poke_u32(descriptor, oft);
                memory.poke_u32(descriptor + 12, name);
                memory.poke_u32(descriptor + 16, ft);
            }
        }

        let mut eat = HashMap::new();
        let export_count = self.exports.len() + self.forwarded.len();
        if export_count > 0 {
            let directory = cursor.alloc(40);
            let functions = cursor.alloc(export_count * 4);
            let names = cursor.alloc(export_count * 4);
            let ordinals = cursor.alloc(export_count * 2);
            let dll = cursor.string(&self.dll_name);

            let d = base + directory as usize;
            memory.poke_u32(d + 12, dll);
            memory.poke_u32(d + 16, 1);
            memory.poke_u32(d + 20, export_count as u32);
            memory.poke_u32(d + 24, export_count as u32);
            memory.poke_u32(d + 28, functions);
            memory.poke_u32(d + 32, names);
            memory.poke_u32(d + 36, ordinals);

            let entries = self
                .exports
                .iter()
                .map(|(symbol, rva)| (symbol.clone(), *rva))
                .chain(self.forwarded.iter().map(|symbol| (symbol.clone(), directory + 4)));
            for (i, (symbol, rva)) in entries.enumerate() {
                let name = cursor.string(&symbol);
                let slot = base + functions as usize + i * 4;
                memory.poke_u32(slot, rva);
                memory.poke_u32(base + names as usize + i * 4, name);
                memory.poke_u16(base + ordinals as usize + i * 2, i as u16);
                eat.insert(symbol, VirtualAddress::new(slot));
            }

            memory.poke_u32(dirs, directory);
            memory.poke_u32(dirs + 4, cursor.next - directory);
        }

        BuiltImage {
            base: VirtualAddress::new(base),
            iat,
            eat,
        }
    }
}
