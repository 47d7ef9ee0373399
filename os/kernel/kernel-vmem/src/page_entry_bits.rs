use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress, PhysicalPage};

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// This models the **common superset** of the fields found in all four
/// paging levels (PML4E, PDPTE, PDE, PTE). The kernel never sets `PS`, so
/// an entry is either a pointer to the next-level table or, at the PT
/// level, a 4 KiB leaf.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`/`PAT`        | Large page (always clear here) |
/// | 8         | `G`               | Global (leaf only) |
/// | 9–11      | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–58     | OS avail high     | Reserved for OS use |
/// | 59–62     | `PKU` / OS use    | Protection key or OS use |
/// | 63        | `NX`              | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::new();
/// e.set_present(true);
/// e.set_writable(true);
/// e.set_physical_address(PhysicalAddress::new(0x12345));
/// assert!(e.present());
/// assert_eq!(e.physical_address().as_u64(), 0x12000);
/// ```
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// A clear bit makes every access through this entry fault; the fault
    /// resolver uses that to materialize demand-paged memory.
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Cleared on private leaves shared by a copy-on-write fork.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6), **leaf only**. Set by the CPU on first write.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7). Never set by this kernel.
    pub large_page: bool,

    /// Global (G, bit 8), **leaf only**.
    ///
    /// Survives CR3 reloads; used for the kernel half only.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> PAGE_SHIFT);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage {
        PhysicalPage::containing(self.physical_address())
    }

    /// A present leaf for `page` carrying `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(page: PhysicalPage, flags: PageFlags) -> Self {
        let mut bits = Self::new()
            .with_present(true)
            .with_writable(flags.contains(PageFlags::WRITABLE))
            .with_user_access(flags.contains(PageFlags::USER))
            .with_global_translation(flags.contains(PageFlags::GLOBAL))
            .with_no_execute(flags.contains(PageFlags::NO_EXECUTE));
        bits.set_physical_address(page.base());
        bits
    }

    /// A present pointer to a next-level table.
    ///
    /// Intermediate levels are always writable; user-half pointers also
    /// carry `US`. Effective permissions are decided by the leaf.
    #[inline]
    #[must_use]
    pub const fn table(page: PhysicalPage, user: bool) -> Self {
        let mut bits = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user);
        bits.set_physical_address(page.base());
        bits
    }

    /// The permission part of a leaf.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        let mut flags = PageFlags::empty();
        if self.writable() {
            flags = flags.union(PageFlags::WRITABLE);
        }
        if self.user_access() {
            flags = flags.union(PageFlags::USER);
        }
        if self.global_translation() {
            flags = flags.union(PageFlags::GLOBAL);
        }
        if self.no_execute() {
            flags = flags.union(PageFlags::NO_EXECUTE);
        }
        flags
    }
}

bitflags::bitflags! {
    /// Permissions of a leaf mapping.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PageFlags: u8 {
        const WRITABLE = 1 << 0;
        const USER = 1 << 1;
        const GLOBAL = 1 << 2;
        const NO_EXECUTE = 1 << 3;
    }
}

impl PageFlags {
    /// Kernel data: direct map, kernel stacks.
    pub const KERNEL_DATA: Self = Self::WRITABLE.union(Self::GLOBAL).union(Self::NO_EXECUTE);

    /// Kernel text and data mapped from the kernel image.
    pub const KERNEL_IMAGE: Self = Self::WRITABLE.union(Self::GLOBAL);

    /// Ordinary user data.
    pub const USER_DATA: Self = Self::WRITABLE.union(Self::USER).union(Self::NO_EXECUTE);
}
