/*
 * Paging and Hardware Page-Table Manipulation
 *
 * This module manipulates x86-64 4-level page tables through the frame
 * allocator's physical window, so it works on any root regardless of which
 * table the CPU currently walks.
 *
 * ARCHITECTURE:
 * - x86_64 4-level paging: PML4 -> PDPT -> PD -> PT -> 4K page
 * - Each level is 512 entries (9 bits of the virtual address)
 * - Entry format: [physical address (12-51)] | [flags (0-11, 52-63)]
 *
 * The kernel half of every root (PML4 slots 256..512) is shared entry-wise
 * with the global kernel table. User-space manipulation never touches it:
 * clearing and freeing walk only the slots below KERNEL_PML4_SLOT.
 */

use crate::memory::layout::KERNEL_PML4_SLOT;
use crate::memory::phys::FrameAllocator;
use crate::memory::types::{PageTableFlags, PhysAddr, PhysFrame, VirtAddr};

/// Page table entry
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// Get physical address from entry
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & Self::ADDR_MASK)
    }

    /// Set physical address and flags
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        let addr_u64 = addr.as_u64();
        assert!(
            addr_u64 & 0xfff == 0,
            "page table entry address must be 4 KiB aligned, got {:#x}",
            addr_u64
        );
        self.0 = (addr_u64 & Self::ADDR_MASK) | flags.bits();
    }

    /// Check if entry is present
    pub fn is_present(&self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    /// Check if entry maps a 1 GiB / 2 MiB page instead of a table
    pub fn is_huge(&self) -> bool {
        self.0 & PageTableFlags::HUGE_PAGE.bits() != 0
    }

    /// Check if entry is all zeros
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Clear entry
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Get flags
    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Raw entry value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Page table (512 entries)
#[repr(align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Get entry at index
    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    /// Get mutable entry at index
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    /// Zero out all entries
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

/// Extract page table indices from virtual address
fn page_table_indices(virt: VirtAddr) -> (usize, usize, usize, usize) {
    let addr = virt.as_u64();
    let pml4_idx = ((addr >> 39) & 0x1ff) as usize;
    let pdpt_idx = ((addr >> 30) & 0x1ff) as usize;
    let pd_idx = ((addr >> 21) & 0x1ff) as usize;
    let pt_idx = ((addr >> 12) & 0x1ff) as usize;
    (pml4_idx, pdpt_idx, pd_idx, pt_idx)
}

/// Allocate and zero one page-table node.
fn alloc_table(falloc: &dyn FrameAllocator) -> Option<PhysAddr> {
    let frame = falloc.alloc_frame()?;
    unsafe {
        let table = &mut *(falloc.frame_ptr(frame) as *mut PageTable);
        table.zero();
    }
    Some(PhysAddr::new(frame.start_address()))
}

/// Allocate a new root table (PML4) for a user address space.
///
/// The user half (slots 0..256) starts empty; the kernel half is copied
/// entry-wise from `kernel_root`, so the kernel sub-tables are shared by
/// pointer with every address space.
pub fn new_user_root(falloc: &dyn FrameAllocator, kernel_root: PhysAddr) -> Option<PhysAddr> {
    let root = alloc_table(falloc)?;

    unsafe {
        let src = &*(falloc.phys_to_virt(kernel_root) as *const PageTable);
        let dst = &mut *(falloc.phys_to_virt(root) as *mut PageTable);
        for slot in KERNEL_PML4_SLOT..512 {
            *dst.entry_mut(slot) = src.entry(slot);
        }
    }

    log::debug!("new user root at {:#x}", root.as_u64());
    Some(root)
}

/// Walk the page tables to the PTE of `virt`.
///
/// With `create`, missing intermediate tables are allocated and wired up
/// with PRESENT | WRITABLE | USER_ACCESSIBLE (the leaf entry restricts the
/// effective permission). Without it, a missing level yields None.
///
/// The returned pointer stays valid until the owning table node is freed.
/// Returns None on allocation failure, a missing level (create = false),
/// or a huge-page entry in the way.
pub fn walk(
    falloc: &dyn FrameAllocator,
    root: PhysAddr,
    virt: VirtAddr,
    create: bool,
) -> Option<*mut PageTableEntry> {
    let (pml4_idx, pdpt_idx, pd_idx, pt_idx) = page_table_indices(virt);

    let table_flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    let mut table_phys = root;
    for idx in [pml4_idx, pdpt_idx, pd_idx] {
        let table = unsafe { &mut *(falloc.phys_to_virt(table_phys) as *mut PageTable) };
        let entry = table.entry(idx);

        table_phys = if entry.is_present() {
            if entry.is_huge() {
                return None;
            }
            entry.addr()
        } else {
            if !create {
                return None;
            }
            let new_table = alloc_table(falloc)?;
            table.entry_mut(idx).set(new_table, table_flags);
            new_table
        };
    }

    let pt = unsafe { &mut *(falloc.phys_to_virt(table_phys) as *mut PageTable) };
    Some(pt.entry_mut(pt_idx) as *mut PageTableEntry)
}

/// Map one 4 KiB page at `virt` to `frame`.
///
/// Allocates intermediate tables as needed. The PTE must not already be
/// present: the sync path always rebuilds onto a cleared user half, so a
/// present entry here is a kernel bug.
///
/// # Panics
/// Panics if `virt` already has a present mapping.
pub fn map_page(
    falloc: &dyn FrameAllocator,
    root: PhysAddr,
    virt: VirtAddr,
    frame: PhysFrame,
    flags: PageTableFlags,
) -> Result<(), &'static str> {
    let pte = walk(falloc, root, virt, true).ok_or("out of frames for page tables")?;

    unsafe {
        if (*pte).is_present() {
            panic!("remap of already-mapped page {:#x}", virt.as_u64());
        }
        (*pte).set(
            PhysAddr::new(frame.start_address()),
            flags | PageTableFlags::PRESENT,
        );
    }

    Ok(())
}

/// Walk the page tables and translate `virt` to its physical address and
/// leaf flags. Handles 1 GiB and 2 MiB entries in the kernel half; user
/// mappings are always 4 KiB.
pub fn translate(
    falloc: &dyn FrameAllocator,
    root: PhysAddr,
    virt: VirtAddr,
) -> Option<(PhysAddr, PageTableFlags)> {
    let (pml4_idx, pdpt_idx, pd_idx, pt_idx) = page_table_indices(virt);

    let pml4 = unsafe { &*(falloc.phys_to_virt(root) as *const PageTable) };
    let pml4e = pml4.entry(pml4_idx);
    if !pml4e.is_present() {
        return None;
    }

    let pdpt = unsafe { &*(falloc.phys_to_virt(pml4e.addr()) as *const PageTable) };
    let pdpte = pdpt.entry(pdpt_idx);
    if !pdpte.is_present() {
        return None;
    }
    if pdpte.is_huge() {
        let offset = virt.as_u64() & 0x3fff_ffff;
        return Some((PhysAddr::new(pdpte.addr().as_u64() + offset), pdpte.flags()));
    }

    let pd = unsafe { &*(falloc.phys_to_virt(pdpte.addr()) as *const PageTable) };
    let pde = pd.entry(pd_idx);
    if !pde.is_present() {
        return None;
    }
    if pde.is_huge() {
        let offset = virt.as_u64() & 0x1f_ffff;
        return Some((PhysAddr::new(pde.addr().as_u64() + offset), pde.flags()));
    }

    let pt = unsafe { &*(falloc.phys_to_virt(pde.addr()) as *const PageTable) };
    let pte = pt.entry(pt_idx);
    if !pte.is_present() {
        return None;
    }

    let offset = virt.as_u64() & 0xfff;
    Some((PhysAddr::new(pte.addr().as_u64() + offset), pte.flags()))
}

/// Recursively free the page-table nodes of a user subtree.
///
/// `level` is the level of `table` itself: 3 for a PDPT hanging off a PML4
/// slot. Only paging-structure nodes are freed; the leaf data frames are
/// owned by the address-space bookkeeping and released there.
pub fn free_user_subtree(falloc: &dyn FrameAllocator, table: PhysAddr, level: u8) {
    if level > 1 {
        let node = unsafe { &*(falloc.phys_to_virt(table) as *const PageTable) };
        for idx in 0..512 {
            let entry = node.entry(idx);
            if entry.is_present() && !entry.is_huge() {
                free_user_subtree(falloc, entry.addr(), level - 1);
            }
        }
    }

    falloc.free_frame(PhysFrame::containing_address(table.as_u64()));
}

/// Drop every user mapping of `root`: free the subtrees hanging off the
/// user PML4 slots and zero those slots. Kernel slots are untouched.
pub fn clear_user_mappings(falloc: &dyn FrameAllocator, root: PhysAddr) {
    let pml4 = unsafe { &mut *(falloc.phys_to_virt(root) as *mut PageTable) };

    for slot in 0..KERNEL_PML4_SLOT {
        let entry = pml4.entry(slot);
        if entry.is_present() {
            free_user_subtree(falloc, entry.addr(), 3);
            pml4.entry_mut(slot).clear();
        }
    }
}

/// Free a user root table: user subtrees first, then the root node itself.
/// The shared kernel sub-tables it points to are left alone.
pub fn free_table(falloc: &dyn FrameAllocator, root: PhysAddr) {
    clear_user_mappings(falloc, root);
    falloc.free_frame(PhysFrame::containing_address(root.as_u64()));
}

/// Point the MMU at `root`. The CR3 write also flushes the TLB.
#[cfg(target_arch = "x86_64")]
pub fn load_root(root: PhysAddr) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame as HwFrame;

    assert!(root.as_u64() & 0xfff == 0, "CR3 must be 4 KiB aligned");
    assert!(root.as_u64() != 0, "CR3 cannot be null");

    unsafe {
        Cr3::write(HwFrame::containing_address(root), Cr3Flags::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::TestFrames;

    const USER_FLAGS: PageTableFlags = PageTableFlags::USER_ACCESSIBLE
        .union(PageTableFlags::WRITABLE);

    #[test]
    fn indices_split_the_address() {
        let (i4, i3, i2, i1) = page_table_indices(VirtAddr::new(0x8000_0000 - 0x1000));
        // 0x7ffff000: pml4 0, pdpt 1, pd 511, pt 511
        assert_eq!((i4, i3, i2, i1), (0, 1, 511, 511));
    }

    #[test]
    fn map_then_translate() {
        let frames = TestFrames::new();
        let kroot = frames.make_kernel_root();
        let root = new_user_root(&frames, kroot).unwrap();

        let data = frames.alloc_frame().unwrap();
        map_page(&frames, root, VirtAddr::new(0x40_0000), data, USER_FLAGS).unwrap();

        let (phys, flags) = translate(&frames, root, VirtAddr::new(0x40_0123)).unwrap();
        assert_eq!(phys.as_u64(), data.start_address() + 0x123);
        assert!(flags.contains(PageTableFlags::PRESENT));
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(flags.contains(PageTableFlags::WRITABLE));

        assert!(translate(&frames, root, VirtAddr::new(0x41_0000)).is_none());
    }

    #[test]
    fn walk_without_create_does_not_allocate() {
        let frames = TestFrames::new();
        let kroot = frames.make_kernel_root();
        let root = new_user_root(&frames, kroot).unwrap();

        let before = frames.outstanding();
        assert!(walk(&frames, root, VirtAddr::new(0x40_0000), false).is_none());
        assert_eq!(frames.outstanding(), before);
    }

    #[test]
    fn walk_create_builds_three_levels() {
        let frames = TestFrames::new();
        let kroot = frames.make_kernel_root();
        let root = new_user_root(&frames, kroot).unwrap();

        let before = frames.outstanding();
        let pte = walk(&frames, root, VirtAddr::new(0x40_0000), true).unwrap();
        // PDPT + PD + PT
        assert_eq!(frames.outstanding(), before + 3);
        assert!(unsafe { (*pte).is_zero() });
    }

    #[test]
    #[should_panic(expected = "remap of already-mapped page")]
    fn remap_panics() {
        let frames = TestFrames::new();
        let kroot = frames.make_kernel_root();
        let root = new_user_root(&frames, kroot).unwrap();

        let a = frames.alloc_frame().unwrap();
        let b = frames.alloc_frame().unwrap();
        map_page(&frames, root, VirtAddr::new(0x40_0000), a, USER_FLAGS).unwrap();
        let _ = map_page(&frames, root, VirtAddr::new(0x40_0000), b, USER_FLAGS);
    }

    #[test]
    fn kernel_half_is_shared_and_survives_free() {
        let frames = TestFrames::new();
        let kroot = frames.make_kernel_root();
        let root = new_user_root(&frames, kroot).unwrap();

        // Same kernel entries, by value (= shared sub-tables by pointer).
        for slot in [KERNEL_PML4_SLOT, 300, 511] {
            assert_eq!(
                frames.root_entry(root, slot),
                frames.root_entry(kroot, slot)
            );
        }

        let data = frames.alloc_frame().unwrap();
        map_page(&frames, root, VirtAddr::new(0x40_0000), data, USER_FLAGS).unwrap();

        // Freeing the user root releases its own nodes (root + PDPT + PD +
        // PT) but neither the data frame nor anything the kernel root owns.
        let before = frames.outstanding();
        free_table(&frames, root);
        assert_eq!(frames.outstanding(), before - 4);

        // Kernel root still intact.
        assert_ne!(frames.root_entry(kroot, KERNEL_PML4_SLOT), 0);
    }

    #[test]
    fn clear_user_mappings_keeps_leaf_frames() {
        let frames = TestFrames::new();
        let kroot = frames.make_kernel_root();
        let root = new_user_root(&frames, kroot).unwrap();

        let data = frames.alloc_frame().unwrap();
        map_page(&frames, root, VirtAddr::new(0x40_0000), data, USER_FLAGS).unwrap();

        let before = frames.outstanding();
        clear_user_mappings(&frames, root);
        // PDPT + PD + PT gone, data frame still allocated.
        assert_eq!(frames.outstanding(), before - 3);
        assert!(translate(&frames, root, VirtAddr::new(0x40_0000)).is_none());

        // The data frame is still ours to free.
        frames.free_frame(data);
    }
}
