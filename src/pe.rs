//! Minimal PE image reader
//!
//! Reads a loaded module's headers through [`MemoryAccess`], so the same code
//! walks our own modules after injection and a remote target's image from the
//! front end. Only what the engine needs is parsed: sections, the import
//! address table and the export address table.

use crate::address::VirtualAddress;
use crate::error::PeError;
use crate::memory::{MemoryAccess, ProtectionClass};

const DOS_SIGNATURE: u16 = 0x5A4D;
const NT_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;

const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const SCN_MEM_READ: u32 = 0x4000_0000;
const SCN_MEM_WRITE: u32 = 0x8000_0000;

const SECTION_HEADER_SIZE: usize = 40;
const IMPORT_DESCRIPTOR_SIZE: usize = 20;

/// Longest import/export name we are willing to read
const MAX_NAME_LEN: usize = 256;
const NAME_CHUNK: usize = 64;

/// A module section as mapped in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: VirtualAddress,
    pub size: usize,
    pub section_name: String,
    pub protection_class: ProtectionClass,
    pub characteristics: u32,
}

impl MemoryRegion {
    pub fn end(&self) -> VirtualAddress {
        self.base.add(self.size)
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.base && address < self.end()
    }

    /// Writable, non-executable section: where configuration cells live
    pub fn is_writable_data(&self) -> bool {
        self.characteristics & SCN_MEM_WRITE != 0 && self.characteristics & SCN_MEM_EXECUTE == 0
    }

    pub fn is_executable(&self) -> bool {
        self.characteristics & SCN_MEM_EXECUTE != 0
    }
}

fn classify(characteristics: u32) -> ProtectionClass {
    let read = characteristics & SCN_MEM_READ != 0;
    let write = characteristics & SCN_MEM_WRITE != 0;
    let execute = characteristics & SCN_MEM_EXECUTE != 0;

    match (read, write, execute) {
        (_, true, true) => ProtectionClass::ExecutableReadWrite,
        (_, true, false) => ProtectionClass::ReadWrite,
        (true, false, false) => ProtectionClass::ReadOnly,
        _ => ProtectionClass::Other,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DataDirectory {
    rva: u32,
    size: u32,
}

impl DataDirectory {
    fn is_present(&self) -> bool {
        self.rva != 0 && self.size != 0
    }

    fn contains(&self, rva: u32) -> bool {
        rva >= self.rva && rva < self.rva.saturating_add(self.size)
    }
}

/// One entry of the export address table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportEntry {
    /// Location of the 32-bit RVA in `AddressOfFunctions`
    pub slot: VirtualAddress,
    pub rva: u32,
    /// Live address of the export
    pub address: VirtualAddress,
    /// The RVA names another module's export instead of code
    pub forwarded: bool,
}

/// Parsed headers of a module loaded at `base`
#[derive(Debug, Clone)]
pub struct ModuleImage {
    pub base: VirtualAddress,
    /// `ImageBase` from the optional header
    pub preferred_base: usize,
    pub size_of_image: usize,
    pub is_64: bool,
    pub sections: Vec<MemoryRegion>,
    exports: DataDirectory,
    imports: DataDirectory,
}

impl ModuleImage {
    pub fn parse<M: MemoryAccess + ?Sized>(
        memory: &M,
        base: VirtualAddress,
    ) -> Result<Self, PeError> {
        if memory.read_u16(base)? != DOS_SIGNATURE {
            return Err(PeError::BadDosSignature(base));
        }

        let nt = base.add(memory.read_u32(base.add(0x3c))? as usize);
        if memory.read_u32(nt)? != NT_SIGNATURE {
            return Err(PeError::BadNtSignature(nt));
        }

        let section_count = memory.read_u16(nt.add(6))? as usize;
        let optional_size = memory.read_u16(nt.add(20))? as usize;
        let optional = nt.add(24);

        let (is_64, preferred_base, directories) = match memory.read_u16(optional)? {
            PE32_MAGIC => (false, memory.read_u32(optional.add(28))? as usize, 96),
            PE32_PLUS_MAGIC => {
                let mut raw = [0u8; 8];
                memory.read_into(optional.add(24), &mut raw)?;
                (true, u64::from_le_bytes(raw) as usize, 112)
            }
            other => return Err(PeError::UnknownMagic(other)),
        };

        let size_of_image = memory.read_u32(optional.add(56))? as usize;
        let directory_count = memory.read_u32(optional.add(directories - 4))?;
        let read_directory = |index: u32| -> Result<DataDirectory, PeError> {
            if index >= directory_count {
                return Ok(DataDirectory::default());
            }
            let at = optional.add(directories + index as usize * 8);
            Ok(DataDirectory {
                rva: memory.read_u32(at)?,
                size: memory.read_u32(at.add(4))?,
            })
        };
        let exports = read_directory(0)?;
        let imports = read_directory(1)?;

        let table = optional.add(optional_size);
        let mut sections = Vec::with_capacity(section_count);
        for i in 0..section_count {
            let header = memory.read(table.add(i * SECTION_HEADER_SIZE), SECTION_HEADER_SIZE)?;
            let field = |at: usize| {
                u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
            };

            let name_len = header[..8].iter().position(|&b| b == 0).unwrap_or(8);
            let virtual_size = field(8);
            let raw_size = field(16);
            let characteristics = field(36);

            sections.push(MemoryRegion {
                base: base.add(field(12) as usize),
                size: (if virtual_size != 0 { virtual_size } else { raw_size }) as usize,
                section_name: String::from_utf8_lossy(&header[..name_len]).into_owned(),
                protection_class: classify(characteristics),
                characteristics,
            });
        }

        Ok(Self {
            base,
            preferred_base,
            size_of_image,
            is_64,
            sections,
            exports,
            imports,
        })
    }

    /// Pointer width of the image, in bytes
    pub fn pointer_width(&self) -> usize {
        if self.is_64 { 8 } else { 4 }
    }

    pub fn section(&self, name: &str) -> Option<&MemoryRegion> {
        self.sections.iter().find(|s| s.section_name == name)
    }

    /// Writable data sections in ascending section order
    pub fn writable_data_sections(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.sections.iter().filter(|s| s.is_writable_data())
    }

    pub fn executable_sections(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.sections.iter().filter(|s| s.is_executable())
    }

    /// Find the IAT entries through which this image calls `module!symbol`.
    ///
    /// An entry matches when its hint/name names `symbol`, or, when the
    /// import carries no name table, when its bound value equals `resolved`.
    pub fn import_slots<M: MemoryAccess + ?Sized>(
        &self,
        memory: &M,
        module: &str,
        symbol: &str,
        resolved: Option<VirtualAddress>,
    ) -> Result<Vec<VirtualAddress>, PeError> {
        let mut slots = Vec::new();
        if !self.imports.is_present() {
            return Ok(slots);
        }
        if self.pointer_width() != std::mem::size_of::<usize>() {
            return Err(PeError::WrongBitness);
        }

        let width = self.pointer_width();
        let mut descriptor = self.base.add(self.imports.rva as usize);
        loop {
            let name_thunks = memory.read_u32(descriptor)?;
            let name_rva = memory.read_u32(descriptor.add(12))?;
            let address_thunks = memory.read_u32(descriptor.add(16))?;
            if name_rva == 0 && address_thunks == 0 {
                break;
            }
            descriptor = descriptor.add(IMPORT_DESCRIPTOR_SIZE);

            let dll = read_c_string(memory, self.base.add(name_rva as usize))?;
            if !module_name_matches(&dll, module) {
                continue;
            }

            for index in 0.. {
                let slot = self.base.add(address_thunks as usize + index * width);
                let bound = memory.read_usize(slot)?;
                if bound == 0 {
                    break;
                }

                let by_name = if name_thunks != 0 {
                    let entry = memory.read_usize(self.base.add(name_thunks as usize + index * width))?;
                    let ordinal_flag = 1usize << (width * 8 - 1);
                    entry & ordinal_flag == 0
                        && read_c_string(memory, self.base.add(entry + 2))? == symbol
                } else {
                    false
                };
                let by_value = resolved.is_some_and(|r| r.value() == bound);

                if by_name || by_value {
                    slots.push(slot);
                }
            }
        }

        Ok(slots)
    }

    /// Look up a named export
    pub fn export<M: MemoryAccess + ?Sized>(
        &self,
        memory: &M,
        symbol: &str,
    ) -> Result<Option<ExportEntry>, PeError> {
        if !self.exports.is_present() {
            return Ok(None);
        }

        let directory = self.base.add(self.exports.rva as usize);
        let function_count = memory.read_u32(directory.add(20))?;
        let name_count = memory.read_u32(directory.add(24))? as usize;
        let functions = self.base.add(memory.read_u32(directory.add(28))? as usize);
        let names = self.base.add(memory.read_u32(directory.add(32))? as usize);
        let ordinals = self.base.add(memory.read_u32(directory.add(36))? as usize);

        for i in 0..name_count {
            let name_rva = memory.read_u32(names.add(i * 4))?;
            if read_c_string(memory, self.base.add(name_rva as usize))? != symbol {
                continue;
            }

            let ordinal = memory.read_u16(ordinals.add(i * 2))? as u32;
            if ordinal >= function_count {
                return Ok(None);
            }
            let slot = functions.add(ordinal as usize * 4);
            let rva = memory.read_u32(slot)?;
            return Ok(Some(ExportEntry {
                slot,
                rva,
                address: self.base.add(rva as usize),
                forwarded: self.exports.contains(rva),
            }));
        }

        Ok(None)
    }
}

/// Compare module names case-insensitively, ignoring a `.dll` suffix
pub fn module_name_matches(a: &str, b: &str) -> bool {
    fn stem(name: &str) -> String {
        let lower = name.to_ascii_lowercase();
        match lower.strip_suffix(".dll") {
            Some(stem) => stem.to_string(),
            None => lower,
        }
    }
    stem(a) == stem(b)
}

fn read_c_string<M: MemoryAccess + ?Sized>(
    memory: &M,
    address: VirtualAddress,
) -> Result<String, PeError> {
    let mut bytes = Vec::new();
    let mut chunk = [0u8; NAME_CHUNK];
    let mut offset = 0;
    while offset < MAX_NAME_LEN {
        // Chunks end on a chunk boundary so a name at the end of a region never reads past it
        let at = address.add(offset);
        let len = (NAME_CHUNK - at.value() % NAME_CHUNK).min(MAX_NAME_LEN - offset);
        memory.read_into(at, &mut chunk[..len])?;

        if let Some(end) = chunk[..len].iter().position(|&b| b == 0) {
            bytes.extend_from_slice(&chunk[..end]);
            break;
        }
        bytes.extend_from_slice(&chunk[..len]);
        offset += len;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ImageBuilder, MockMemory, SCN_CODE, SCN_DATA, SCN_RDATA};

    const BASE: usize = 0x0040_0000;

    fn sample(memory: &MockMemory) -> crate::testing::BuiltImage {
        ImageBuilder::new(BASE)
            .section(".text", 0x1000, 0x3000, SCN_CODE)
            .section(".rdata", 0x4000, 0x1000, SCN_RDATA)
            .section(".data", 0x5000, 0x2000, SCN_DATA)
            .import("d3d9.dll", "Direct3DCreate9", 0x6100_2000)
            .import("USER32.dll", "SetWindowPos", 0x7700_1000)
            .import("USER32.dll", "FindWindowW", 0x7700_2000)
            .build(memory)
    }

    #[test]
    fn test_parse_sections() {
        let memory = MockMemory::new();
        sample(&memory);

        let image = ModuleImage::parse(&memory, VirtualAddress::new(BASE)).unwrap();
        assert_eq!(image.preferred_base, BASE);
        assert_eq!(image.is_64, std::mem::size_of::<usize>() == 8);

        let names: Vec<_> = image.sections.iter().map(|s| s.section_name.as_str()).collect();
        assert_eq!(names, [".text", ".rdata", ".data", ".rdata"]);

        let data = image.section(".data").unwrap();
        assert_eq!(data.base, VirtualAddress::new(BASE + 0x5000));
        assert_eq!(data.size, 0x2000);
        assert_eq!(data.protection_class, ProtectionClass::ReadWrite);
        assert_eq!(image.section(".text").unwrap().protection_class, ProtectionClass::Other);
        assert_eq!(
            image.section(".rdata").unwrap().protection_class,
            ProtectionClass::ReadOnly
        );
    }

    #[test]
    fn test_writable_data_sections_excludes_code() {
        let memory = MockMemory::new();
        sample(&memory);
        let image = ModuleImage::parse(&memory, VirtualAddress::new(BASE)).unwrap();

        let data: Vec<_> = image.writable_data_sections().map(|s| s.section_name.clone()).collect();
        assert_eq!(data, [".data"]);
        assert_eq!(image.executable_sections().count(), 1);
    }

    #[test]
    fn test_import_slot_by_name() {
        let memory = MockMemory::new();
        let built = sample(&memory);
        let image = ModuleImage::parse(&memory, built.base).unwrap();

        let slots = image
            .import_slots(&memory, "user32", "FindWindowW", None)
            .unwrap();
        assert_eq!(slots, vec![built.iat["FindWindowW"]]);
        assert_eq!(memory.peek_usize(slots[0].value()), 0x7700_2000);
    }

    #[test]
    fn test_import_slot_missing() {
        let memory = MockMemory::new();
        let built = sample(&memory);
        let image = ModuleImage::parse(&memory, built.base).unwrap();

        assert!(image
            .import_slots(&memory, "ddraw.dll", "DirectDrawCreate", None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_export_lookup_and_forwarding() {
        let memory = MockMemory::new();
        let built = ImageBuilder::new(0x1000_0000)
            .named("d3d9.dll")
            .section(".text", 0x1000, 0x1000, SCN_CODE)
            .export("Direct3DCreate9", 0x1230)
            .forwarded_export("Direct3DShaderValidatorCreate9")
            .build(&memory);
        let image = ModuleImage::parse(&memory, built.base).unwrap();

        let entry = image.export(&memory, "Direct3DCreate9").unwrap().unwrap();
        assert_eq!(entry.slot, built.eat["Direct3DCreate9"]);
        assert_eq!(entry.address, VirtualAddress::new(0x1000_1230));
        assert!(!entry.forwarded);

        let forwarded = image
            .export(&memory, "Direct3DShaderValidatorCreate9")
            .unwrap()
            .unwrap();
        assert!(forwarded.forwarded);

        assert_eq!(image.export(&memory, "Nope").unwrap(), None);
    }

    #[test]
    fn test_bad_signature() {
        let memory = MockMemory::new();
        memory.map(BASE, 0x1000, crate::memory::Protection::ReadOnly);
        assert_eq!(
            ModuleImage::parse(&memory, VirtualAddress::new(BASE)).unwrap_err(),
            PeError::BadDosSignature(VirtualAddress::new(BASE))
        );
    }

    #[test]
    fn test_c_string_read_in_chunks() {
        let memory = MockMemory::new();
        memory.map(0x2000_0000, 0x1000, crate::memory::Protection::ReadOnly);
        let name = "x".repeat(100);
        memory.poke(0x2000_0000, name.as_bytes());

        let before = memory.read_count();
        let read = read_c_string(&memory, VirtualAddress::new(0x2000_0000)).unwrap();
        assert_eq!(read, name);
        assert_eq!(memory.read_count() - before, 2);
    }

    #[test]
    fn test_c_string_ending_at_region_end() {
        let memory = MockMemory::new();
        memory.map(0x2000_0000, 0x1000, crate::memory::Protection::ReadOnly);
        memory.poke(0x2000_0ffc, b"abc\0");

        let read = read_c_string(&memory, VirtualAddress::new(0x2000_0ffc)).unwrap();
        assert_eq!(read, "abc");
    }

    #[test]
    fn test_module_name_matches() {
        assert!(module_name_matches("D3D9.DLL", "d3d9"));
        assert!(module_name_matches("ddraw.dll", "DDRAW.dll"));
        assert!(!module_name_matches("d3d9.dll", "d3d8.dll"));
    }
}
