//! Addresses in local and foreign address spaces, and relocation-adjusted
//! translation of link-time addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TranslateError;

/// The linker's default image base for executables. Static addresses taken
/// from offline analysis of the target assume the module loaded here.
pub const EXPECTED_DEFAULT_BASE: usize = 0x0040_0000;

/// Which address space an address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// The caller's own process
    Local,
    /// Another process, identified by its PID
    Remote(u32),
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::Local => write!(f, "local"),
            AddressSpace::Remote(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// An opaque address. It is never dereferenced directly; all access goes
/// through a [`MemoryAccess`](crate::memory::MemoryAccess) implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    pub const NULL: VirtualAddress = VirtualAddress(0);

    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub const fn value(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `offset` bytes further on; wraps like pointer arithmetic in the
    /// target would.
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Signed distance from `base` to `self`
    pub const fn offset_from(self, base: VirtualAddress) -> usize {
        self.0.wrapping_sub(base.0)
    }

    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 % align == 0
    }

    /// Round down to the start of the page containing this address
    pub const fn page_floor(self, page_size: usize) -> Self {
        Self(self.0 - self.0 % page_size)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for VirtualAddress {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// A link-time virtual address known from offline analysis, relative to
/// [`EXPECTED_DEFAULT_BASE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticAddress(usize);

impl StaticAddress {
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub const fn value(self) -> usize {
        self.0
    }

    /// Recover the link-time form of a live address in a module loaded at
    /// `actual_base`. Inverse of [`translate`].
    pub fn from_live(address: VirtualAddress, actual_base: VirtualAddress) -> Self {
        Self(EXPECTED_DEFAULT_BASE.wrapping_add(address.offset_from(actual_base)))
    }
}

impl fmt::Display for StaticAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Relocation-adjust `address` for a module whose live base is `actual_base`:
/// `actual_base + (address - EXPECTED_DEFAULT_BASE)`.
///
/// Pure arithmetic. The result is not checked against the module bounds.
pub fn translate(
    address: StaticAddress,
    actual_base: VirtualAddress,
) -> Result<VirtualAddress, TranslateError> {
    if actual_base.is_null() {
        return Err(TranslateError::Unresolved);
    }
    if address.0 < EXPECTED_DEFAULT_BASE {
        return Err(TranslateError::BelowImageBase {
            address: address.0,
            base: EXPECTED_DEFAULT_BASE,
        });
    }

    Ok(actual_base.add(address.0 - EXPECTED_DEFAULT_BASE))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDTH_CELL: StaticAddress = StaticAddress::new(0x0055_E034);

    #[test]
    fn test_translate_unrelocated_is_identity() {
        let live = translate(WIDTH_CELL, VirtualAddress::new(EXPECTED_DEFAULT_BASE)).unwrap();
        assert_eq!(live.value(), 0x0055_E034);
    }

    #[test]
    fn test_translate_relocated_adds_delta() {
        let delta = 0x0123_0000;
        let live =
            translate(WIDTH_CELL, VirtualAddress::new(EXPECTED_DEFAULT_BASE + delta)).unwrap();
        assert_eq!(live.value(), 0x0055_E034 + delta);
    }

    #[test]
    fn test_translate_difference_matches_base_difference() {
        let bases = [0x0040_0000usize, 0x0001_0000, 0x00A0_0000, 0x7FF0_0000];
        let statics = [0x0040_0000usize, 0x0040_1000, 0x0055_E038, 0x0060_0000];

        for &a in &statics {
            for &b1 in &bases {
                for &b2 in &bases {
                    let s = StaticAddress::new(a);
                    let t1 = translate(s, VirtualAddress::new(b1)).unwrap();
                    let t2 = translate(s, VirtualAddress::new(b2)).unwrap();
                    assert_eq!(t1.value().wrapping_sub(t2.value()), b1.wrapping_sub(b2));
                }
            }
        }
    }

    #[test]
    fn test_translate_unresolved_base() {
        assert_eq!(
            translate(WIDTH_CELL, VirtualAddress::NULL),
            Err(TranslateError::Unresolved)
        );
    }

    #[test]
    fn test_translate_rejects_address_below_base() {
        let err = translate(StaticAddress::new(0x1000), VirtualAddress::new(0x0040_0000));
        assert!(matches!(err, Err(TranslateError::BelowImageBase { .. })));
    }

    #[test]
    fn test_from_live_inverts_translate() {
        let base = VirtualAddress::new(0x0087_0000);
        let live = translate(WIDTH_CELL, base).unwrap();
        assert_eq!(StaticAddress::from_live(live, base), WIDTH_CELL);
    }

    #[test]
    fn test_page_floor() {
        assert_eq!(
            VirtualAddress::new(0x1234).page_floor(0x1000),
            VirtualAddress::new(0x1000)
        );
    }
}
