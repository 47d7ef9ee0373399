//! Copy-on-write duplication of the user half.

use crate::address_space::{AddressSpace, MapError};
use crate::page_table::{PageTableEntry, TableIndex, TableLevel};
use crate::{FrameAlloc, Mmu, PhysMapper};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use log::{debug, warn};

/// Fork could not complete; the partially built child has been torn down.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum ForkError {
    #[error("out of memory while duplicating page tables ({0:?} level)")]
    OutOfMemory(TableLevel),
}

impl From<MapError> for ForkError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory(level) => Self::OutOfMemory(level),
            // Table allocation is the only fallible step of a fork.
            MapError::AlreadyMapped(_) | MapError::NonCanonical(_) => {
                Self::OutOfMemory(TableLevel::Pml4)
            }
        }
    }
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Clone this address space copy-on-write.
    ///
    /// Every user-half table is duplicated. Leaves are not: each present
    /// leaf is copied into the child as-is, its frame gains one reference,
    /// and unless `is_shared` reports the page as a shared mapping, the
    /// entry loses its writable bit in **both** spaces.
    ///
    /// When this space is active on the calling core the TLB is flushed, so
    /// stale writable translations can't bypass the copy.
    ///
    /// # Errors
    /// On allocation failure the child is destroyed, which releases the
    /// reference of every leaf already copied into it: reference counts end
    /// up exactly where they started. Leaves that were already downgraded
    /// in the parent stay read-only; the fault resolver restores them
    /// without a copy because the parent is their sole owner again.
    pub fn fork<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        mmu: &impl Mmu,
        is_shared: impl Fn(VirtualAddress) -> bool,
    ) -> Result<Self, ForkError> {
        let child_root = self.alloc_table(alloc, TableLevel::Pml4)?;
        let child = Self::from_root(self.mapper, child_root);

        let parent_pml4 = self.table_mut(self.root);
        let child_pml4 = self.table_mut(child_root);
        for i in TableIndex::kernel_half() {
            child_pml4.set(i, parent_pml4.get(i));
        }

        let result = self.fork_level(
            alloc,
            &is_shared,
            self.root,
            child_root,
            TableLevel::Pml4,
            0,
        );

        if self.is_active(mmu) {
            mmu.flush_all();
        }

        match result {
            Ok(shared) => {
                debug!(
                    "forked {:?} into {:?}: {shared} leaves shared",
                    self.root, child_root
                );
                Ok(child)
            }
            Err(e) => {
                warn!("fork of {:?} failed: {e}", self.root);
                child.destroy(alloc);
                Err(e)
            }
        }
    }

    /// Duplicate the subtree under `parent` into `child` at `level`.
    ///
    /// Returns the number of leaves shared.
    fn fork_level<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        is_shared: &impl Fn(VirtualAddress) -> bool,
        parent: PhysicalPage,
        child: PhysicalPage,
        level: TableLevel,
        prefix: u64,
    ) -> Result<usize, ForkError> {
        let parent_table = self.table_mut(parent);
        let child_table = self.table_mut(child);
        let mut shared = 0;

        for i in TableIndex::all() {
            if level == TableLevel::Pml4 && i >= TableIndex::KERNEL_HALF_START {
                break;
            }
            let e = parent_table.get(i);
            if !e.is_present() {
                continue;
            }
            let va = prefix | i.address_bits(level);

            match level.next() {
                Some(next) => {
                    let table = self.alloc_table(alloc, next)?;
                    // Link before descending so a failure below still finds it.
                    child_table.set(i, PageTableEntry::table(table, true));
                    shared += self.fork_level(alloc, is_shared, e.frame(), table, next, va)?;
                }
                None => {
                    let leaf = if e.is_writable() && !is_shared(VirtualAddress::new(va)) {
                        let ro = e.with_writable(false);
                        parent_table.set(i, ro);
                        ro
                    } else {
                        e
                    };
                    alloc.share(leaf.frame());
                    child_table.set(i, leaf);
                    shared += 1;
                }
            }
        }
        Ok(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageFlags;
    use crate::testing::{TestAlloc, TestMmu, TestRam};
    use kernel_memory_addresses::VirtualPage;

    fn page(va: u64) -> VirtualPage {
        VirtualPage::containing(VirtualAddress::new(va))
    }

    fn bytes(ram: &TestRam, frame: PhysicalPage) -> &'static mut [u8; 4096] {
        unsafe { ram.frame_bytes(frame) }
    }

    #[test]
    fn fork_shares_leaves_read_only() {
        let ram = TestRam::with_frames(64);
        let mut alloc = TestAlloc::new(64);
        let mmu = TestMmu::new();
        let k = alloc.alloc_4k().unwrap();
        ram.zero_frame(k);

        let parent = AddressSpace::new_user(&ram, &mut alloc, k).unwrap();
        parent.activate(&mmu);
        let data = alloc.alloc_4k().unwrap();
        bytes(&ram, data)[0] = 0xAA;
        parent
            .map(&mut alloc, page(0x1000), data, PageFlags::USER_DATA)
            .unwrap();

        let child = parent.fork(&mut alloc, &mmu, |_| false).unwrap();

        assert_eq!(alloc.ref_count(data), 2);
        let pe = parent.entry(VirtualAddress::new(0x1000)).unwrap();
        let ce = child.entry(VirtualAddress::new(0x1000)).unwrap();
        assert!(!pe.is_writable() && !ce.is_writable());
        assert_eq!(pe.frame(), ce.frame());
        assert_eq!(mmu.flushes.get(), 1);

        // Intermediate tables are private to each side.
        assert_ne!(
            parent.walk(VirtualAddress::new(0x1000)),
            child.walk(VirtualAddress::new(0x1000))
        );

        child.destroy(&mut alloc);
        assert_eq!(alloc.ref_count(data), 1);
    }

    #[test]
    fn shared_mappings_stay_writable() {
        let ram = TestRam::with_frames(64);
        let mut alloc = TestAlloc::new(64);
        let mmu = TestMmu::new();
        let k = alloc.alloc_4k().unwrap();
        ram.zero_frame(k);

        let parent = AddressSpace::new_user(&ram, &mut alloc, k).unwrap();
        mmu.activate(k);
        let data = alloc.alloc_4k().unwrap();
        parent
            .map(&mut alloc, page(0x5000), data, PageFlags::USER_DATA)
            .unwrap();

        let child = parent
            .fork(&mut alloc, &mmu, |va| va.as_u64() == 0x5000)
            .unwrap();
        assert!(child.entry(VirtualAddress::new(0x5000)).unwrap().is_writable());
        assert!(parent.entry(VirtualAddress::new(0x5000)).unwrap().is_writable());
        assert_eq!(alloc.ref_count(data), 2);
        // The parent was not active, so no flush was needed.
        assert_eq!(mmu.flushes.get(), 0);
    }

    #[test]
    fn failed_fork_restores_reference_counts() {
        let ram = TestRam::with_frames(128);
        let mut alloc = TestAlloc::new(128);
        let mmu = TestMmu::new();
        let k = alloc.alloc_4k().unwrap();
        ram.zero_frame(k);
        mmu.activate(k);

        let parent = AddressSpace::new_user(&ram, &mut alloc, k).unwrap();
        // Two leaves under different PML4 slots so the walk fails midway.
        let low = alloc.alloc_4k().unwrap();
        let high = alloc.alloc_4k().unwrap();
        bytes(&ram, low)[7] = 0x11;
        parent
            .map(&mut alloc, page(0x1000), low, PageFlags::USER_DATA)
            .unwrap();
        parent
            .map(&mut alloc, page(0x7FFF_FFFF_E000), high, PageFlags::USER_DATA)
            .unwrap();
        let in_use = alloc.in_use();

        // Root + PDPT + PD + PT for the low leaf, then the high PDPT fails.
        alloc.cap_remaining(4);
        let err = parent.fork(&mut alloc, &mmu, |_| false).err();
        assert_eq!(err, Some(ForkError::OutOfMemory(TableLevel::Pdpt)));

        assert_eq!(alloc.in_use(), in_use);
        assert_eq!(alloc.ref_count(low), 1);
        assert_eq!(alloc.ref_count(high), 1);

        // The parent still maps both pages with unchanged contents.
        assert_eq!(
            parent.translate(VirtualAddress::new(0x1007)),
            Some(low.base() + 7)
        );
        assert_eq!(bytes(&ram, low)[7], 0x11);
        assert!(parent.entry(VirtualAddress::new(0x7FFF_FFFF_E000)).unwrap().is_writable());
        // The low leaf was visited before the failure and stays conservatively read-only.
        assert!(!parent.entry(VirtualAddress::new(0x1000)).unwrap().is_writable());
    }
}
