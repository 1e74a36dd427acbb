// =============================================================================
// Tern OS - Translation Table Descriptors
// =============================================================================
// VMSAv8-64 stage 1 descriptors for the 4 KiB granule.
//
//   bit  0      valid
//   bit  1      1 = table (L0-L2) / page (L3), 0 = block (L1-L2)
//   bits 2-4    AttrIndx into MAIR_EL1
//   bits 6-7    AP[2:1]
//   bits 8-9    SH
//   bit  10     AF
//   bits 12-47  output / next-level table address
//   bit  53     PXN
//   bit  54     UXN
// =============================================================================

use bitflags::bitflags;
use core::fmt;

/// Output address field of a 4 KiB granule descriptor.
pub const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

const ATTR_INDEX_SHIFT: u64 = 2;
const ATTR_INDEX_MASK: u64 = 0b111 << ATTR_INDEX_SHIFT;

/// Bit position of each level's 9-bit index slice, L0 first.
pub const LEVEL_SHIFTS: [u64; 4] = [39, 30, 21, 12];

/// Entries per translation table.
pub const ENTRIES: usize = 512;

/// Index of `va` in a table of the given level (0..=3).
#[inline]
pub const fn index(va: u64, level: usize) -> usize {
    ((va >> LEVEL_SHIFTS[level]) & 0x1FF) as usize
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u64 {
        const VALID = 1 << 0;
        /// Table descriptor at L0-L2, page descriptor at L3
        const TABLE = 1 << 1;
        /// AP[1]: EL0 may access
        const AP_EL0 = 1 << 6;
        /// AP[2]: read-only
        const AP_READ_ONLY = 1 << 7;
        const SH_INNER = 0b11 << 8;
        const ACCESS = 1 << 10;
        const PXN = 1 << 53;
        const UXN = 1 << 54;
    }
}

/// Memory types installed in MAIR_EL1; the discriminant is the AttrIndx.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryAttr {
    /// Device-nGnRnE: no gathering, no reordering, no early write ack
    Device = 0,
    /// Normal, inner and outer non-cacheable
    NormalNonCacheable = 1,
}

impl MemoryAttr {
    /// MAIR_EL1 byte encoding of this attribute.
    pub const fn mair_encoding(self) -> u64 {
        match self {
            MemoryAttr::Device => 0x00,
            MemoryAttr::NormalNonCacheable => 0x44,
        }
    }

    /// MAIR_EL1 with every attribute at its index.
    pub const fn mair() -> u64 {
        (MemoryAttr::Device.mair_encoding() << (8 * MemoryAttr::Device as u64))
            | (MemoryAttr::NormalNonCacheable.mair_encoding()
                << (8 * MemoryAttr::NormalNonCacheable as u64))
    }
}

/// Who may touch a 4 KiB page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// EL0 read/write and execute; EL1 may not execute.
    User,
    /// EL1 read/write and execute; EL0 has no access.
    Kernel,
    /// EL0 and EL1 read/write, execute-never for both.
    Shared,
}

impl Privilege {
    fn flags(self) -> DescriptorFlags {
        match self {
            Privilege::User => DescriptorFlags::AP_EL0 | DescriptorFlags::PXN,
            Privilege::Kernel => DescriptorFlags::UXN,
            Privilege::Shared => {
                DescriptorFlags::AP_EL0 | DescriptorFlags::UXN | DescriptorFlags::PXN
            }
        }
    }
}

/// One 64-bit translation table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Descriptor(u64);

impl Descriptor {
    pub const INVALID: Descriptor = Descriptor(0);

    /// Pointer to a next-level table at physical address `table`.
    pub const fn table(table: u64) -> Self {
        Descriptor((table & ADDR_MASK) | DescriptorFlags::VALID.bits() | DescriptorFlags::TABLE.bits())
    }

    /// 2 MiB L2 block: kernel read/write, EL0 execute-never.
    pub fn block(pa: u64, attr: MemoryAttr) -> Self {
        let flags = DescriptorFlags::VALID
            | DescriptorFlags::ACCESS
            | DescriptorFlags::SH_INNER
            | DescriptorFlags::UXN;
        Descriptor((pa & ADDR_MASK) | flags.bits() | Self::attr_bits(attr))
    }

    /// 4 KiB L3 page.
    pub fn page(pa: u64, attr: MemoryAttr, privilege: Privilege) -> Self {
        let flags = DescriptorFlags::VALID
            | DescriptorFlags::TABLE
            | DescriptorFlags::ACCESS
            | DescriptorFlags::SH_INNER
            | privilege.flags();
        Descriptor((pa & ADDR_MASK) | flags.bits() | Self::attr_bits(attr))
    }

    const fn attr_bits(attr: MemoryAttr) -> u64 {
        (attr as u64) << ATTR_INDEX_SHIFT
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn flags(self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.0)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(DescriptorFlags::VALID)
    }

    /// Valid with bit 1 set: a table pointer above L3, a page at L3.
    pub fn is_table(self) -> bool {
        self.flags().contains(DescriptorFlags::VALID | DescriptorFlags::TABLE)
    }

    /// Valid with bit 1 clear.
    pub fn is_block(self) -> bool {
        self.is_valid() && !self.flags().contains(DescriptorFlags::TABLE)
    }

    pub const fn address(self) -> u64 {
        self.0 & ADDR_MASK
    }

    pub const fn attr_index(self) -> u8 {
        ((self.0 & ATTR_INDEX_MASK) >> ATTR_INDEX_SHIFT) as u8
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("Descriptor(invalid)");
        }
        f.debug_struct("Descriptor")
            .field("addr", &format_args!("{:#x}", self.address()))
            .field("attr", &self.attr_index())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_slices_follow_level_shifts() {
        let va = (3 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0xABC;
        assert_eq!(index(va, 0), 3);
        assert_eq!(index(va, 1), 5);
        assert_eq!(index(va, 2), 7);
        assert_eq!(index(va, 3), 9);
    }

    #[test]
    fn page_keeps_attributes_outside_the_address_field() {
        let d = Descriptor::page(0x0900_0FFF, MemoryAttr::Device, Privilege::Kernel);
        assert_eq!(d.address(), 0x0900_0000);
        assert_eq!(d.bits() & !ADDR_MASK & 0xFFF & !0b11, (1 << 10) | (0b11 << 8));
        assert!(d.is_table());
        assert!(d.flags().contains(DescriptorFlags::UXN));
        assert!(!d.flags().contains(DescriptorFlags::PXN));
        assert_eq!(d.attr_index(), 0);
    }

    #[test]
    fn block_is_valid_but_not_table() {
        let d = Descriptor::block(0x4020_0000, MemoryAttr::NormalNonCacheable);
        assert!(d.is_block());
        assert!(!d.is_table());
        assert_eq!(d.attr_index(), 1);
        assert_eq!(d.address(), 0x4020_0000);
    }

    #[test]
    fn privilege_profiles_differ_in_access_and_execute() {
        let user = Descriptor::page(0, MemoryAttr::NormalNonCacheable, Privilege::User).flags();
        let shared = Descriptor::page(0, MemoryAttr::NormalNonCacheable, Privilege::Shared).flags();
        assert!(user.contains(DescriptorFlags::AP_EL0));
        assert!(!user.contains(DescriptorFlags::UXN));
        assert!(shared.contains(DescriptorFlags::AP_EL0 | DescriptorFlags::UXN | DescriptorFlags::PXN));
    }

    #[test]
    fn mair_places_device_at_zero_and_normal_nc_at_one() {
        assert_eq!(MemoryAttr::mair(), 0x44 << 8);
    }
}
