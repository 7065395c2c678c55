//! Byte signatures with wildcards, e.g. `"8B 0D ?? ?? ?? ?? 6A 01"`.

use std::fmt;

use crate::address::VirtualAddress;
use crate::memory::{MemoryAccess, PAGE_SIZE};
use crate::pe::MemoryRegion;

/// A parsed signature; `None` entries match any byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<Option<u8>>,
}

impl Pattern {
    /// Parse space-separated hex bytes; `?` or `??` is a wildcard.
    /// Returns `None` for an empty or malformed signature.
    pub fn parse(signature: &str) -> Option<Self> {
        let mut bytes = Vec::new();
        for token in signature.split_whitespace() {
            if token.chars().all(|c| c == '?') && token.len() <= 2 {
                bytes.push(None);
            } else {
                bytes.push(Some(u8::from_str_radix(token, 16).ok()?));
            }
        }

        if bytes.is_empty() || bytes.iter().all(Option::is_none) {
            return None;
        }
        Some(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches_at(&self, haystack: &[u8], at: usize) -> bool {
        self.bytes
            .iter()
            .zip(&haystack[at..])
            .all(|(want, have)| want.is_none_or(|b| b == *have))
    }

    /// Offset of the first match in `haystack`
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        if self.bytes.len() > haystack.len() {
            return None;
        }
        (0..=haystack.len() - self.bytes.len()).find(|&i| self.matches_at(haystack, i))
    }

    /// First match inside `region`, reading it page by page. Unreadable pages
    /// are skipped and break any match spanning them.
    pub fn scan<M: MemoryAccess + ?Sized>(
        &self,
        memory: &M,
        region: &MemoryRegion,
    ) -> Option<VirtualAddress> {
        let mut carry: Vec<u8> = Vec::new();
        let mut carry_start = region.base;
        let mut page = region.base;

        while page < region.end() {
            let len = (PAGE_SIZE - page.value() % PAGE_SIZE).min(region.end().offset_from(page));

            match memory.read(page, len) {
                Ok(chunk) => {
                    if carry.is_empty() {
                        carry_start = page;
                    }
                    carry.extend_from_slice(&chunk);
                    if let Some(offset) = self.find_in(&carry) {
                        return Some(carry_start.add(offset));
                    }

                    // Keep just enough tail to catch a match straddling pages
                    let keep = self.bytes.len().saturating_sub(1).min(carry.len());
                    let drop = carry.len() - keep;
                    carry.drain(..drop);
                    carry_start = carry_start.add(drop);
                }
                Err(_) => carry.clear(),
            }
            page = page.add(len);
        }

        None
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match byte {
                Some(b) => write!(f, "{b:02X}")?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Protection, ProtectionClass};
    use crate::testing::MockMemory;

    fn region(base: usize, size: usize) -> MemoryRegion {
        MemoryRegion {
            base: VirtualAddress::new(base),
            size,
            section_name: ".text".into(),
            protection_class: ProtectionClass::Other,
            characteristics: 0x6000_0020,
        }
    }

    #[test]
    fn test_parse() {
        let pattern = Pattern::parse("8B 0D ?? ? 6a").unwrap();
        assert_eq!(pattern.len(), 5);
        assert_eq!(pattern.to_string(), "8B 0D ?? ?? 6A");

        assert!(Pattern::parse("").is_none());
        assert!(Pattern::parse("?? ??").is_none());
        assert!(Pattern::parse("8B ZZ").is_none());
    }

    #[test]
    fn test_find_in_with_wildcards() {
        let pattern = Pattern::parse("55 8B ?? 83").unwrap();
        let haystack = [0x90, 0x55, 0x8B, 0xEC, 0x83, 0xC4];
        assert_eq!(pattern.find_in(&haystack), Some(1));
        assert_eq!(pattern.find_in(&haystack[2..]), None);
    }

    #[test]
    fn test_scan_across_page_boundary() {
        let memory = MockMemory::new();
        memory.map(0x10000, 0x2000, Protection::ExecuteRead);
        memory.poke(0x10ffe, &[0xDE, 0xAD, 0xBE, 0xEF]);

        let pattern = Pattern::parse("DE AD ?? EF").unwrap();
        assert_eq!(
            pattern.scan(&memory, &region(0x10000, 0x2000)),
            Some(VirtualAddress::new(0x10ffe))
        );
    }

    #[test]
    fn test_scan_skips_unreadable_pages() {
        let memory = MockMemory::new();
        memory.map(0x10000, 0x3000, Protection::ExecuteRead);
        memory.poke(0x12010, &[0x6A, 0x01, 0xE8]);
        memory.unmap(0x11000);

        let pattern = Pattern::parse("6A 01 E8").unwrap();
        assert_eq!(
            pattern.scan(&memory, &region(0x10000, 0x3000)),
            Some(VirtualAddress::new(0x12010))
        );
        assert_eq!(pattern.scan(&memory, &region(0x10000, 0x2000)), None);
    }
}
