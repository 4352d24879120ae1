/*
 * Address Space Management
 *
 * This module implements per-process user address spaces. An address space
 * is two coupled representations:
 *
 * - the logical model: three directional regions (code, heap, stack), each
 *   owning a chain of page-sized descriptor nodes with one PageInfo per
 *   virtual page, and
 * - the hardware model: the 4-level page table whose root goes into CR3.
 *
 * The logical model is authoritative. update() rebuilds the hardware user
 * half from it wholesale, which tolerates any sequence of region mutations
 * between syncs and needs no incremental diffing.
 *
 * USER MEMORY LAYOUT:
 * ===================
 *
 * 0x00010000             Initial-process code (init_code only)
 * per-binary             Code region (ELF load anchors it)
 * code end + guard page  Heap region (grows up, starts empty)
 * 0x80000000             User stack top (stack grows down)
 *
 * Ownership: a region owns its descriptor nodes and, through them, the
 * backing frames; the address space owns its regions and the user half of
 * its root table. The kernel half of the root is shared by pointer with the
 * global kernel table and is never freed here. Fork duplicates frames;
 * nothing is shared between address spaces.
 */

use core::ptr;

use bitflags::bitflags;

use crate::fs::Inode;
use crate::memory::layout::{
    INIT_CODE_BASE, INIT_SCRATCH_PAGES, KERNEL_BASE, USER_SPACE_END, USER_STACK_TOP,
};
use crate::memory::paging;
use crate::memory::phys::FrameAllocator;
use crate::memory::types::{
    PAGE_SIZE, PageTableFlags, PhysAddr, PhysFrame, VirtAddr, is_page_aligned, page_round_up,
};

/// Errors of the mapping and user-copy paths.
///
/// Resource exhaustion and bad addresses are recoverable and reported here;
/// invariant violations by kernel callers (remapping a used slot, loading
/// into an unmapped page) are bugs and panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame allocator ran dry; all partial work was unwound.
    OutOfFrames,
    /// The requested range reaches into kernel territory.
    AddressTooHigh,
    /// A touched page is not mapped in any region.
    NotMapped,
    /// A touched page is mapped but not writable.
    NotWritable,
    /// The inode returned fewer bytes than requested.
    ShortRead,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MapError::OutOfFrames => write!(f, "out of physical frames"),
            MapError::AddressTooHigh => write!(f, "address range reaches kernel space"),
            MapError::NotMapped => write!(f, "page not mapped"),
            MapError::NotWritable => write!(f, "page not writable"),
            MapError::ShortRead => write!(f, "short read from inode"),
        }
    }
}

bitflags! {
    /// Per-page descriptor state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PageState: u8 {
        /// The slot corresponds to an allocated page; ppn is valid.
        const USED = 1 << 0;
        /// The MMU should see this page on the next sync.
        const PRESENT = 1 << 1;
        /// The MMU should allow writes.
        const WRITABLE = 1 << 2;
    }
}

/// Descriptor of one user virtual page.
///
/// The hardware encoding on sync is USER | (present ? P : 0) |
/// (writable ? W : 0); a used page with present cleared is known to the
/// kernel but hidden from the MMU.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    state: PageState,
    ppn: u64,
}

impl PageInfo {
    pub fn is_used(&self) -> bool {
        self.state.contains(PageState::USED)
    }

    pub fn is_present(&self) -> bool {
        self.state.contains(PageState::PRESENT)
    }

    pub fn is_writable(&self) -> bool {
        self.state.contains(PageState::WRITABLE)
    }

    /// Physical page number of the backing frame. Valid only when used.
    pub fn ppn(&self) -> u64 {
        self.ppn
    }

    /// Backing frame handle. Valid only when used.
    pub fn frame(&self) -> PhysFrame {
        PhysFrame::from_ppn(self.ppn)
    }

    /// Flip MMU visibility in the logical model. The hardware entry is not
    /// touched until mark_not_present or the next sync.
    pub fn set_present(&mut self, present: bool) {
        self.state.set(PageState::PRESENT, present);
    }

    fn assign(&mut self, present: bool, writable: bool, ppn: u64) {
        let mut state = PageState::USED;
        state.set(PageState::PRESENT, present);
        state.set(PageState::WRITABLE, writable);
        self.state = state;
        self.ppn = ppn;
    }

    fn clear(&mut self) {
        self.state = PageState::empty();
        self.ppn = 0;
    }
}

/// Descriptors per node: a node is exactly one page, a forward link plus
/// as many slots as fit in the remainder.
pub const SLOTS_PER_NODE: usize =
    (PAGE_SIZE as usize - core::mem::size_of::<usize>()) / core::mem::size_of::<PageInfo>();

/// A page-sized chunk of page descriptors, chained singly. Chains grow on
/// demand and are never shrunk or relocated during a region's lifetime, so
/// slot pointers stay stable until teardown.
#[repr(C)]
struct PageInfoNode {
    next: *mut PageInfoNode,
    slots: [PageInfo; SLOTS_PER_NODE],
}

const _: () = assert!(core::mem::size_of::<PageInfoNode>() <= PAGE_SIZE as usize);

/// Which way a region's pages are indexed from its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Range is [base, base + size); index 0 at base.
    Up,
    /// Range is [base - size, base); index 0 at the page below base.
    /// Lets the stack grow toward lower addresses with contiguous indices.
    Down,
}

/// Fixed region roles of a user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Code = 0,
    Heap = 1,
    Stack = 2,
}

pub const REGION_COUNT: usize = 3;

/// A contiguous, directional range of virtual pages with uniform
/// lifecycle, owning its descriptor chain.
#[derive(Debug)]
pub struct Region {
    base: VirtAddr,
    size: u64,
    dir: Direction,
    head: *mut PageInfoNode,
}

impl Region {
    const fn empty(dir: Direction) -> Self {
        Self {
            base: VirtAddr::zero(),
            size: 0,
            dir,
            head: ptr::null_mut(),
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    /// Move the anchor. Callers describe the intended range; mappings are
    /// added separately.
    pub fn set_base(&mut self, base: VirtAddr) {
        self.base = base;
    }

    /// Resize the described range. Does not map or unmap anything.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Inclusive lower bound of the range, regardless of direction.
    pub fn bottom(&self) -> VirtAddr {
        match self.dir {
            Direction::Up => self.base,
            Direction::Down => VirtAddr::new(self.base.as_u64() - self.size),
        }
    }

    /// Exclusive upper bound of the range, regardless of direction.
    pub fn top(&self) -> VirtAddr {
        match self.dir {
            Direction::Up => VirtAddr::new(self.base.as_u64() + self.size),
            Direction::Down => self.base,
        }
    }

    /// True iff `[va, va + size)` lies inside the region. A zero-size
    /// query exactly at the top is outside.
    pub fn contains(&self, va: VirtAddr, size: u64) -> bool {
        let v = va.as_u64();
        let (bottom, top) = (self.bottom().as_u64(), self.top().as_u64());
        match v.checked_add(size) {
            Some(end) => v >= bottom && v < top && end <= top,
            None => false,
        }
    }

    /// Linear descriptor index of the page containing `va`.
    fn index_of(&self, va: VirtAddr) -> u64 {
        let v = va.as_u64();
        let base = self.base.as_u64();
        match self.dir {
            Direction::Up => {
                debug_assert!(v >= base);
                (v - base) / PAGE_SIZE
            }
            Direction::Down => {
                debug_assert!(v < base);
                (base - 1 - v) / PAGE_SIZE
            }
        }
    }

    /// Virtual address of the first byte of the page with descriptor
    /// index `idx`.
    fn page_at(&self, idx: u64) -> VirtAddr {
        let base = self.base.as_u64();
        match self.dir {
            Direction::Up => VirtAddr::new(base + idx * PAGE_SIZE),
            Direction::Down => VirtAddr::new(base - (idx + 1) * PAGE_SIZE),
        }
    }

    fn alloc_node(falloc: &dyn FrameAllocator) -> Option<*mut PageInfoNode> {
        let frame = falloc.alloc_frame()?;
        let node = falloc.frame_ptr(frame) as *mut PageInfoNode;
        unsafe {
            ptr::write_bytes(node as *mut u8, 0, PAGE_SIZE as usize);
        }
        Some(node)
    }

    /// Descriptor slot for the page containing `va`, allocating nodes on
    /// demand. The returned reference stays valid until region teardown;
    /// nodes are never relocated. None only if the frame allocator cannot
    /// provide a node.
    pub fn lookup(&mut self, falloc: &dyn FrameAllocator, va: VirtAddr) -> Option<&mut PageInfo> {
        let idx = self.index_of(va) as usize;
        let mut chunk = idx / SLOTS_PER_NODE;
        let slot = idx % SLOTS_PER_NODE;

        if self.head.is_null() {
            self.head = Self::alloc_node(falloc)?;
        }

        let mut node = self.head;
        while chunk > 0 {
            let next = unsafe { (*node).next };
            node = if next.is_null() {
                let grown = Self::alloc_node(falloc)?;
                unsafe {
                    (*node).next = grown;
                }
                grown
            } else {
                next
            };
            chunk -= 1;
        }

        Some(unsafe { &mut (*node).slots[slot] })
    }

    /// Read-only descriptor walk: no nodes are allocated. None if the
    /// chain does not reach the page's index yet.
    pub fn find(&self, va: VirtAddr) -> Option<&PageInfo> {
        let idx = self.index_of(va) as usize;
        let mut chunk = idx / SLOTS_PER_NODE;

        let mut node = self.head;
        while !node.is_null() && chunk > 0 {
            node = unsafe { (*node).next };
            chunk -= 1;
        }

        if node.is_null() {
            None
        } else {
            Some(unsafe { &(*node).slots[idx % SLOTS_PER_NODE] })
        }
    }

    /// Mutable variant of find. Same non-allocating walk.
    pub fn find_mut(&mut self, va: VirtAddr) -> Option<&mut PageInfo> {
        let idx = self.index_of(va) as usize;
        let mut chunk = idx / SLOTS_PER_NODE;

        let mut node = self.head;
        while !node.is_null() && chunk > 0 {
            node = unsafe { (*node).next };
            chunk -= 1;
        }

        if node.is_null() {
            None
        } else {
            Some(unsafe { &mut (*node).slots[idx % SLOTS_PER_NODE] })
        }
    }

    /// Back every page of `[from, from + size)` with a fresh zeroed frame.
    ///
    /// Fails with AddressTooHigh before any side effect if the range
    /// reaches kernel territory; a zero size succeeds with zero effect.
    /// On allocation failure every page touched by this call is unwound
    /// (frame freed, slot cleared) before returning. The region's
    /// described size is not modified.
    ///
    /// Returns `size` on success.
    ///
    /// # Panics
    /// Panics if any page in the range is already used: remapping is a
    /// kernel bug. The check runs before any slot is mutated.
    pub fn add_mapping(
        &mut self,
        falloc: &dyn FrameAllocator,
        from: VirtAddr,
        size: u64,
        present: bool,
        writable: bool,
    ) -> Result<u64, MapError> {
        if size == 0 {
            return Ok(0);
        }

        let end = from
            .as_u64()
            .checked_add(size)
            .ok_or(MapError::AddressTooHigh)?;
        if end >= KERNEL_BASE || end > USER_SPACE_END {
            return Err(MapError::AddressTooHigh);
        }

        let start = page_round_up(from.as_u64());

        // Refuse remaps before mutating anything.
        let mut a = start;
        while a < end {
            let slot = self
                .lookup(falloc, VirtAddr::new(a))
                .ok_or(MapError::OutOfFrames)?;
            if slot.is_used() {
                panic!("mapping already present at {:#x}", a);
            }
            a += PAGE_SIZE;
        }

        let mut a = start;
        while a < end {
            let frame = match falloc.alloc_frame() {
                Some(frame) => frame,
                None => {
                    self.unwind(falloc, start, a);
                    return Err(MapError::OutOfFrames);
                }
            };

            unsafe {
                ptr::write_bytes(falloc.frame_ptr(frame), 0, PAGE_SIZE as usize);
            }

            let slot = self
                .find_mut(VirtAddr::new(a))
                .expect("descriptor chain lost a node");
            slot.assign(present, writable, frame.ppn());
            a += PAGE_SIZE;
        }

        Ok(size)
    }

    /// Walk `[start, upto)` backwards, releasing the frames this call
    /// assigned and clearing the slots.
    fn unwind(&mut self, falloc: &dyn FrameAllocator, start: u64, upto: u64) {
        let mut a = upto;
        while a > start {
            a -= PAGE_SIZE;
            if let Some(slot) = self.find_mut(VirtAddr::new(a)) {
                if slot.is_used() {
                    falloc.free_frame(slot.frame());
                    slot.clear();
                }
            }
        }
    }

    /// add_mapping, then copy `data` into the fresh frames through their
    /// kernel aliases. `va` must be page-aligned.
    pub fn add_data(
        &mut self,
        falloc: &dyn FrameAllocator,
        va: VirtAddr,
        data: &[u8],
        present: bool,
        writable: bool,
    ) -> Result<u64, MapError> {
        debug_assert!(is_page_aligned(va.as_u64()));

        self.add_mapping(falloc, va, data.len() as u64, present, writable)?;

        let mut copied = 0;
        while copied < data.len() {
            let cur = va.as_u64() + copied as u64;
            let offset = (cur % PAGE_SIZE) as usize;
            let chunk = core::cmp::min(PAGE_SIZE as usize - offset, data.len() - copied);

            let slot = self
                .find(VirtAddr::new(cur))
                .expect("page mapped a moment ago");
            unsafe {
                ptr::copy_nonoverlapping(
                    data.as_ptr().add(copied),
                    falloc.frame_ptr(slot.frame()).add(offset),
                    chunk,
                );
            }
            copied += chunk;
        }

        Ok(data.len() as u64)
    }

    /// Read `len` bytes at `offset` of `inode` straight into the backing
    /// frames of `[va, va + len)`. A short read fails the operation.
    ///
    /// # Panics
    /// `va` must be page-aligned and every touched page already used;
    /// anything else is a kernel bug.
    pub fn load_from_inode(
        &self,
        falloc: &dyn FrameAllocator,
        va: VirtAddr,
        inode: &dyn Inode,
        offset: u64,
        len: u64,
    ) -> Result<(), MapError> {
        assert!(
            is_page_aligned(va.as_u64()),
            "load_from_inode: unaligned target {:#x}",
            va.as_u64()
        );

        let mut done = 0;
        while done < len {
            let cur = va.as_u64() + done;
            let slot = match self.find(VirtAddr::new(cur)) {
                Some(slot) if slot.is_used() => slot,
                _ => panic!("load_from_inode: page {:#x} not mapped", cur),
            };

            let chunk = core::cmp::min(PAGE_SIZE, len - done);
            let dst = unsafe {
                core::slice::from_raw_parts_mut(falloc.frame_ptr(slot.frame()), chunk as usize)
            };
            if inode.read(dst, offset + done) != chunk as usize {
                return Err(MapError::ShortRead);
            }
            done += chunk;
        }

        Ok(())
    }

    /// Duplicate `src`'s descriptor chain into this (empty) region: same
    /// node shape, same states, every used slot backed by a fresh frame
    /// holding a copy of the source page.
    fn copy_pages_from(&mut self, falloc: &dyn FrameAllocator, src: &Region) -> Result<(), MapError> {
        debug_assert!(self.head.is_null());

        let mut src_node = src.head;
        let mut tail: *mut PageInfoNode = ptr::null_mut();

        while !src_node.is_null() {
            let node = Self::alloc_node(falloc).ok_or(MapError::OutOfFrames)?;
            if tail.is_null() {
                self.head = node;
            } else {
                unsafe {
                    (*tail).next = node;
                }
            }

            for i in 0..SLOTS_PER_NODE {
                let src_slot = unsafe { (*src_node).slots[i] };
                if !src_slot.is_used() {
                    continue;
                }

                let frame = falloc.alloc_frame().ok_or(MapError::OutOfFrames)?;
                unsafe {
                    ptr::copy_nonoverlapping(
                        falloc.frame_ptr(src_slot.frame()),
                        falloc.frame_ptr(frame),
                        PAGE_SIZE as usize,
                    );
                    let dst_slot = &mut (*node).slots[i];
                    *dst_slot = src_slot;
                    dst_slot.ppn = frame.ppn();
                }
            }

            tail = node;
            src_node = unsafe { (*src_node).next };
        }

        Ok(())
    }

    /// Release every backing frame and every descriptor node, and reset
    /// the descriptor to its zero state.
    fn free_pages(&mut self, falloc: &dyn FrameAllocator) {
        let mut node = self.head;
        while !node.is_null() {
            unsafe {
                for slot in &mut (*node).slots {
                    if slot.is_used() {
                        falloc.free_frame(slot.frame());
                        slot.clear();
                    }
                }
                let next = (*node).next;
                let phys = falloc.virt_to_phys(node as *const u8);
                falloc.free_frame(PhysFrame::containing_address(phys.as_u64()));
                node = next;
            }
        }

        self.head = ptr::null_mut();
        self.base = VirtAddr::zero();
        self.size = 0;
    }
}

/// Result of an address-range containment query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    /// The start address is in no region.
    Unmapped,
    /// The start address is in a region but the range leaks out of it.
    Partial,
    /// The whole range lies inside one region.
    Contained,
}

/// One process's user address space: three fixed-role regions plus the
/// hardware root table. All mutating operations assume the caller holds
/// the process lock; no locks are taken here.
pub struct AddressSpace {
    root: PhysAddr,
    regions: [Region; REGION_COUNT],
}

impl AddressSpace {
    /// Build a fresh address space: a new root table preloaded with the
    /// kernel half of `kernel_root`, and three empty regions with their
    /// fixed directions (code up, heap up, stack down).
    pub fn new(falloc: &dyn FrameAllocator, kernel_root: PhysAddr) -> Result<Self, MapError> {
        let root = paging::new_user_root(falloc, kernel_root).ok_or(MapError::OutOfFrames)?;
        Ok(Self {
            root,
            regions: [
                Region::empty(Direction::Up),
                Region::empty(Direction::Up),
                Region::empty(Direction::Down),
            ],
        })
    }

    /// Physical address of the root table (what goes into CR3).
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn region(&self, kind: RegionKind) -> &Region {
        &self.regions[kind as usize]
    }

    pub fn region_mut(&mut self, kind: RegionKind) -> &mut Region {
        &mut self.regions[kind as usize]
    }

    /// The region whose range contains `va`, if any.
    pub fn region_containing(&self, va: VirtAddr) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(va, 0))
    }

    /// Bootstrap the very first process from a raw code image.
    ///
    /// The code region sits at the fixed initial base, sized for the image
    /// plus the trailing scratch pages, everything present and writable.
    /// A one-page stack is placed below the canonical stack top, and the
    /// hardware table is synced.
    pub fn init_code(&mut self, falloc: &dyn FrameAllocator, image: &[u8]) -> Result<(), MapError> {
        let image_span = page_round_up(image.len() as u64);
        let base = VirtAddr::new(INIT_CODE_BASE);

        let code = self.region_mut(RegionKind::Code);
        code.set_base(base);
        code.set_size(image_span + INIT_SCRATCH_PAGES * PAGE_SIZE);
        code.add_data(falloc, base, image, true, true)?;
        code.add_mapping(
            falloc,
            VirtAddr::new(INIT_CODE_BASE + image_span),
            INIT_SCRATCH_PAGES * PAGE_SIZE,
            true,
            true,
        )?;

        self.init_stack(falloc, VirtAddr::new(USER_STACK_TOP))?;

        log::debug!(
            "init process: code [{:#x}, {:#x}), stack top {:#x}",
            INIT_CODE_BASE,
            INIT_CODE_BASE + image_span + INIT_SCRATCH_PAGES * PAGE_SIZE,
            USER_STACK_TOP
        );

        self.update(falloc)
    }

    /// Set up the user stack: anchor at `top`, one present+writable page
    /// below it. The stack region must not hold pages yet.
    pub fn init_stack(&mut self, falloc: &dyn FrameAllocator, top: VirtAddr) -> Result<(), MapError> {
        let stack = self.region_mut(RegionKind::Stack);
        debug_assert!(stack.head.is_null(), "stack region already populated");

        stack.set_base(top);
        stack.set_size(PAGE_SIZE);
        stack.add_mapping(
            falloc,
            VirtAddr::new(top.as_u64() - PAGE_SIZE),
            PAGE_SIZE,
            true,
            true,
        )?;
        Ok(())
    }

    /// Copy `data` into user memory at `va`, page by page, through the
    /// bookkeeping (not the hardware table).
    ///
    /// Every touched page is validated first: it must belong to a region,
    /// be used, and be writable in the logical model. On any failure
    /// nothing has been written.
    pub fn write_to(
        &self,
        falloc: &dyn FrameAllocator,
        va: VirtAddr,
        data: &[u8],
    ) -> Result<(), MapError> {
        let mut off = 0;
        while off < data.len() {
            let cur = va.as_u64() + off as u64;
            let slot = self
                .region_containing(VirtAddr::new(cur))
                .and_then(|r| r.find(VirtAddr::new(cur)))
                .ok_or(MapError::NotMapped)?;
            if !slot.is_used() {
                return Err(MapError::NotMapped);
            }
            if !slot.is_writable() {
                return Err(MapError::NotWritable);
            }
            off += PAGE_SIZE as usize - (cur % PAGE_SIZE) as usize;
        }

        let mut off = 0;
        while off < data.len() {
            let cur = va.as_u64() + off as u64;
            let offset = (cur % PAGE_SIZE) as usize;
            let chunk = core::cmp::min(PAGE_SIZE as usize - offset, data.len() - off);

            let slot = self
                .region_containing(VirtAddr::new(cur))
                .and_then(|r| r.find(VirtAddr::new(cur)))
                .expect("validated a moment ago");
            unsafe {
                ptr::copy_nonoverlapping(
                    data.as_ptr().add(off),
                    falloc.frame_ptr(slot.frame()).add(offset),
                    chunk,
                );
            }
            off += chunk;
        }

        Ok(())
    }

    /// Zero the hardware entry of a page whose descriptor is already
    /// hidden (used, not present), making it invisible to the MMU without
    /// waiting for a full sync.
    ///
    /// # Panics
    /// `va` must be page-aligned and its descriptor must exist, be used,
    /// and have present cleared beforehand.
    pub fn mark_not_present(&self, falloc: &dyn FrameAllocator, va: VirtAddr) {
        assert!(is_page_aligned(va.as_u64()));

        let slot = self
            .region_containing(va)
            .and_then(|r| r.find(va))
            .unwrap_or_else(|| panic!("mark_not_present: no descriptor for {:#x}", va.as_u64()));
        assert!(
            slot.is_used() && !slot.is_present(),
            "mark_not_present: descriptor for {:#x} must be used and hidden",
            va.as_u64()
        );

        if let Some(pte) = paging::walk(falloc, self.root, va, false) {
            unsafe {
                (*pte).clear();
            }
        }
    }

    /// Three-valued containment query for `[va, va + size)`.
    pub fn containment(&self, va: VirtAddr, size: u64) -> Containment {
        match self.region_containing(va) {
            None => Containment::Unmapped,
            Some(r) if r.contains(va, size) => Containment::Contained,
            Some(_) => Containment::Partial,
        }
    }

    /// Rebuild the hardware user half from the logical model.
    ///
    /// Drops every user subtree of the root, then re-emits one mapping per
    /// used+present descriptor with USER | (WRITABLE if writable). Used
    /// descriptors with present cleared get no entry; unused slots are
    /// skipped silently. Idempotent: a second sync changes nothing.
    pub fn update(&self, falloc: &dyn FrameAllocator) -> Result<(), MapError> {
        paging::clear_user_mappings(falloc, self.root);

        for region in &self.regions {
            let pages = page_round_up(region.size) / PAGE_SIZE;

            let mut node = region.head;
            let mut idx = 0;
            while !node.is_null() && idx < pages {
                let slots = unsafe { &(*node).slots };
                for slot in slots.iter() {
                    if idx >= pages {
                        break;
                    }
                    if slot.is_used() && slot.is_present() {
                        let mut flags = PageTableFlags::USER_ACCESSIBLE;
                        if slot.is_writable() {
                            flags |= PageTableFlags::WRITABLE;
                        }
                        paging::map_page(falloc, self.root, region.page_at(idx), slot.frame(), flags)
                            .map_err(|_| MapError::OutOfFrames)?;
                    }
                    idx += 1;
                }
                node = unsafe { (*node).next };
            }
        }

        Ok(())
    }

    /// Fork-style deep copy of `src` into this freshly created space:
    /// same region geometry, every used page backed by a new frame with
    /// identical contents, then a sync. On allocation failure the partial
    /// state is left for `free` to clean up.
    pub fn copy_from(&mut self, falloc: &dyn FrameAllocator, src: &AddressSpace) -> Result<(), MapError> {
        for kind in 0..REGION_COUNT {
            let src_region = &src.regions[kind];
            let dst_region = &mut self.regions[kind];

            dst_region.base = src_region.base;
            dst_region.size = src_region.size;
            dst_region.dir = src_region.dir;
            dst_region.copy_pages_from(falloc, src_region)?;
        }

        self.update(falloc)
    }

    /// Tear the address space down: every backing frame, every descriptor
    /// node, every user page-table subtree, and the root table itself.
    /// The kernel sub-tables the root shares stay untouched.
    pub fn free(&mut self, falloc: &dyn FrameAllocator) {
        for region in &mut self.regions {
            region.free_pages(falloc);
        }

        paging::free_table(falloc, self.root);
        self.root = PhysAddr::zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::KERNEL_PML4_SLOT;
    use crate::memory::testing::TestFrames;

    fn new_space(frames: &TestFrames) -> (AddressSpace, PhysAddr) {
        let kroot = frames.make_kernel_root();
        let space = AddressSpace::new(frames, kroot).unwrap();
        (space, kroot)
    }

    fn user_byte(frames: &TestFrames, space: &AddressSpace, va: u64) -> u8 {
        let slot = space
            .region_containing(VirtAddr::new(va))
            .and_then(|r| r.find(VirtAddr::new(va)))
            .expect("page not mapped");
        unsafe { *frames.frame_ptr(slot.frame()).add((va % PAGE_SIZE) as usize) }
    }

    /// Raw PTE of `va`, if the walk reaches one.
    fn pte_raw(frames: &TestFrames, space: &AddressSpace, va: u64) -> Option<u64> {
        paging::walk(frames, space.root(), VirtAddr::new(va), false)
            .map(|pte| unsafe { (*pte).raw() })
    }

    fn assert_present_writable(frames: &TestFrames, space: &AddressSpace, va: u64, writable: bool) {
        let raw = pte_raw(frames, space, va).expect("no PTE");
        let flags = PageTableFlags::from_bits_truncate(raw);
        assert!(flags.contains(PageTableFlags::PRESENT), "{:#x} not present", va);
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert_eq!(flags.contains(PageTableFlags::WRITABLE), writable, "{:#x}", va);
    }

    fn assert_absent(frames: &TestFrames, space: &AddressSpace, va: u64) {
        let present = pte_raw(frames, space, va)
            .map(|raw| raw & PageTableFlags::PRESENT.bits() != 0)
            .unwrap_or(false);
        assert!(!present, "{:#x} unexpectedly present", va);
    }

    #[test]
    fn descriptor_node_fits_one_page() {
        assert!(core::mem::size_of::<PageInfoNode>() <= PAGE_SIZE as usize);
        assert_eq!(SLOTS_PER_NODE, 255);
    }

    #[test]
    fn direction_symmetry() {
        let mut up = Region::empty(Direction::Up);
        up.set_base(VirtAddr::new(0x40_0000));
        for k in [0u64, 1, 7, 300] {
            assert_eq!(up.index_of(VirtAddr::new(0x40_0000 + k * PAGE_SIZE)), k);
            assert_eq!(up.page_at(k).as_u64(), 0x40_0000 + k * PAGE_SIZE);
        }

        let mut down = Region::empty(Direction::Down);
        down.set_base(VirtAddr::new(USER_STACK_TOP));
        for k in [0u64, 1, 7, 300] {
            let va = USER_STACK_TOP - PAGE_SIZE - k * PAGE_SIZE;
            assert_eq!(down.index_of(VirtAddr::new(va)), k);
            assert_eq!(down.page_at(k).as_u64(), va);
        }
    }

    #[test]
    fn region_bounds_and_containment() {
        let mut stack = Region::empty(Direction::Down);
        stack.set_base(VirtAddr::new(USER_STACK_TOP));
        stack.set_size(2 * PAGE_SIZE);

        assert_eq!(stack.bottom().as_u64(), USER_STACK_TOP - 2 * PAGE_SIZE);
        assert_eq!(stack.top().as_u64(), USER_STACK_TOP);

        assert!(stack.contains(VirtAddr::new(USER_STACK_TOP - 8), 8));
        assert!(!stack.contains(VirtAddr::new(USER_STACK_TOP - 8), 16));
        assert!(!stack.contains(VirtAddr::new(USER_STACK_TOP), 0));
        assert!(stack.contains(VirtAddr::new(USER_STACK_TOP - 1), 0));
    }

    #[test]
    fn lookup_grows_chain_and_pointers_are_stable() {
        let frames = TestFrames::new();
        let mut region = Region::empty(Direction::Up);
        region.set_base(VirtAddr::new(0x40_0000));

        let before = frames.outstanding();
        let far = 0x40_0000 + (SLOTS_PER_NODE as u64) * PAGE_SIZE;
        let first = region.lookup(&frames, VirtAddr::new(0x40_0000)).unwrap() as *mut PageInfo;
        assert_eq!(frames.outstanding(), before + 1);

        region.lookup(&frames, VirtAddr::new(far)).unwrap();
        assert_eq!(frames.outstanding(), before + 2);

        let again = region.lookup(&frames, VirtAddr::new(0x40_0000)).unwrap() as *mut PageInfo;
        assert_eq!(first, again);

        region.free_pages(&frames);
        assert_eq!(frames.outstanding(), before);
    }

    #[test]
    fn add_mapping_refuses_kernel_reach() {
        let frames = TestFrames::new();
        let mut region = Region::empty(Direction::Up);
        region.set_base(VirtAddr::new(USER_SPACE_END - 2 * PAGE_SIZE));

        let before = frames.outstanding();
        let result = region.add_mapping(
            &frames,
            VirtAddr::new(USER_SPACE_END - PAGE_SIZE),
            2 * PAGE_SIZE,
            true,
            true,
        );
        assert_eq!(result, Err(MapError::AddressTooHigh));
        assert_eq!(frames.outstanding(), before);
    }

    #[test]
    fn add_mapping_zero_size_is_a_noop() {
        let frames = TestFrames::new();
        let mut region = Region::empty(Direction::Up);
        region.set_base(VirtAddr::new(0x40_0000));

        assert_eq!(
            region.add_mapping(&frames, VirtAddr::new(0x40_0000), 0, true, true),
            Ok(0)
        );
        assert_eq!(frames.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "mapping already present")]
    fn remap_is_fatal() {
        let frames = TestFrames::new();
        let mut region = Region::empty(Direction::Up);
        region.set_base(VirtAddr::new(0x40_0000));

        region
            .add_mapping(&frames, VirtAddr::new(0x40_0000), PAGE_SIZE, true, true)
            .unwrap();
        let _ = region.add_mapping(&frames, VirtAddr::new(0x40_0000), 2 * PAGE_SIZE, true, true);
    }

    #[test]
    fn remap_check_runs_before_any_mutation() {
        let frames = TestFrames::new();
        let mut region = Region::empty(Direction::Up);
        region.set_base(VirtAddr::new(0x40_0000));

        // Occupy the *second* page of the range we will attempt.
        region
            .add_mapping(
                &frames,
                VirtAddr::new(0x40_0000 + PAGE_SIZE),
                PAGE_SIZE,
                true,
                true,
            )
            .unwrap();
        let before = frames.outstanding();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = region.add_mapping(&frames, VirtAddr::new(0x40_0000), 2 * PAGE_SIZE, true, true);
        }));
        assert!(outcome.is_err());

        // The first page of the attempted range was never touched and no
        // frame was allocated.
        assert_eq!(frames.outstanding(), before);
        assert!(!region.find(VirtAddr::new(0x40_0000)).unwrap().is_used());
    }

    #[test]
    fn oom_mid_mapping_unwinds_completely() {
        let frames = TestFrames::new();
        let mut region = Region::empty(Direction::Up);
        region.set_base(VirtAddr::new(0x40_0000));

        // One mapped page up front so the descriptor node already exists.
        region
            .add_mapping(&frames, VirtAddr::new(0x40_0000), PAGE_SIZE, true, true)
            .unwrap();

        let before = frames.outstanding();
        frames.fail_after(5);

        let from = VirtAddr::new(0x40_0000 + PAGE_SIZE);
        let result = region.add_mapping(&frames, from, 10 * PAGE_SIZE, true, true);
        assert_eq!(result, Err(MapError::OutOfFrames));
        frames.no_fail();

        // Net allocator change is zero and every attempted slot is clear.
        assert_eq!(frames.outstanding(), before);
        for k in 1..=10u64 {
            let slot = region.find(VirtAddr::new(0x40_0000 + k * PAGE_SIZE)).unwrap();
            assert!(!slot.is_used(), "slot {} left used", k);
        }
        // The page from before the failed call is untouched.
        assert!(region.find(VirtAddr::new(0x40_0000)).unwrap().is_used());
    }

    #[test]
    fn init_bootstrap_layout() {
        let frames = TestFrames::new();
        let (mut space, _) = new_space(&frames);

        let image = [0x5Au8; 200];
        space.init_code(&frames, &image).unwrap();

        let code = space.region(RegionKind::Code);
        assert_eq!(code.base().as_u64(), INIT_CODE_BASE);
        assert_eq!(code.size(), 6 * PAGE_SIZE);

        // All six code pages present and writable.
        for k in 0..6u64 {
            assert_present_writable(&frames, &space, INIT_CODE_BASE + k * PAGE_SIZE, true);
        }
        assert_absent(&frames, &space, INIT_CODE_BASE + 6 * PAGE_SIZE);

        // Image bytes landed; the rest of the first page is zero.
        assert_eq!(user_byte(&frames, &space, INIT_CODE_BASE), 0x5A);
        assert_eq!(user_byte(&frames, &space, INIT_CODE_BASE + 199), 0x5A);
        assert_eq!(user_byte(&frames, &space, INIT_CODE_BASE + 200), 0);

        // One stack page below the canonical top, reachable at top - 8.
        let stack = space.region(RegionKind::Stack);
        assert_eq!(stack.bottom().as_u64(), USER_STACK_TOP - PAGE_SIZE);
        assert_eq!(stack.top().as_u64(), USER_STACK_TOP);
        assert_present_writable(&frames, &space, USER_STACK_TOP - 8, true);
        assert_absent(&frames, &space, USER_STACK_TOP - 2 * PAGE_SIZE);
    }

    #[test]
    fn sync_skips_unused_and_hidden_pages() {
        let frames = TestFrames::new();
        let (mut space, _) = new_space(&frames);

        let code = space.region_mut(RegionKind::Code);
        code.set_base(VirtAddr::new(0x40_0000));
        code.set_size(3 * PAGE_SIZE);
        // Map pages 0 and 2, leave a hole at page 1.
        code.add_mapping(&frames, VirtAddr::new(0x40_0000), PAGE_SIZE, true, false)
            .unwrap();
        code.add_mapping(
            &frames,
            VirtAddr::new(0x40_0000 + 2 * PAGE_SIZE),
            PAGE_SIZE,
            true,
            true,
        )
        .unwrap();

        space.update(&frames).unwrap();

        assert_present_writable(&frames, &space, 0x40_0000, false);
        assert_absent(&frames, &space, 0x40_0000 + PAGE_SIZE);
        assert_present_writable(&frames, &space, 0x40_0000 + 2 * PAGE_SIZE, true);

        // Hide page 0 in the logical model; the next sync drops its PTE.
        space
            .region_mut(RegionKind::Code)
            .find_mut(VirtAddr::new(0x40_0000))
            .unwrap()
            .set_present(false);
        space.update(&frames).unwrap();
        assert_absent(&frames, &space, 0x40_0000);
    }

    #[test]
    fn sync_is_idempotent() {
        let frames = TestFrames::new();
        let (mut space, _) = new_space(&frames);
        space.init_code(&frames, &[1, 2, 3, 4]).unwrap();

        let probe: Vec<u64> = (0..6)
            .map(|k| INIT_CODE_BASE + k * PAGE_SIZE)
            .chain([USER_STACK_TOP - PAGE_SIZE])
            .collect();

        let first: Vec<Option<u64>> = probe.iter().map(|&va| pte_raw(&frames, &space, va)).collect();
        space.update(&frames).unwrap();
        let second: Vec<Option<u64>> = probe.iter().map(|&va| pte_raw(&frames, &space, va)).collect();

        assert_eq!(first, second);
    }

    #[test]
    fn fork_copies_frames_not_references() {
        let frames = TestFrames::new();
        let (mut parent, kroot) = new_space(&frames);
        parent.init_code(&frames, &[0u8; 64]).unwrap();

        let mark = INIT_CODE_BASE + 0x50;
        parent
            .write_to(&frames, VirtAddr::new(mark), &[0xAB])
            .unwrap();

        let mut child = AddressSpace::new(&frames, kroot).unwrap();
        child.copy_from(&frames, &parent).unwrap();

        // Same geometry, distinct frames, identical contents.
        for kind in [RegionKind::Code, RegionKind::Stack] {
            let (pr, cr) = (parent.region(kind), child.region(kind));
            assert_eq!(pr.base(), cr.base());
            assert_eq!(pr.size(), cr.size());

            let pages = page_round_up(pr.size()) / PAGE_SIZE;
            for k in 0..pages {
                let va = pr.page_at(k);
                let (ps, cs) = (pr.find(va).unwrap(), cr.find(va).unwrap());
                assert_eq!(ps.is_used(), cs.is_used());
                if ps.is_used() {
                    assert_ne!(ps.ppn(), cs.ppn(), "shared frame at {:#x}", va.as_u64());
                    let p = unsafe {
                        core::slice::from_raw_parts(frames.frame_ptr(ps.frame()), 4096)
                    };
                    let c = unsafe {
                        core::slice::from_raw_parts(frames.frame_ptr(cs.frame()), 4096)
                    };
                    assert_eq!(p, c);
                }
            }
        }

        // Mutating the child never affects the parent.
        child
            .write_to(&frames, VirtAddr::new(mark), &[0xCD])
            .unwrap();
        assert_eq!(user_byte(&frames, &parent, mark), 0xAB);
        assert_eq!(user_byte(&frames, &child, mark), 0xCD);
    }

    #[test]
    fn free_returns_every_frame_once() {
        let frames = TestFrames::new();
        let kroot = frames.make_kernel_root();
        let baseline = frames.outstanding();

        let mut space = AddressSpace::new(&frames, kroot).unwrap();
        space.init_code(&frames, &[7u8; 5000]).unwrap();

        let mut child = AddressSpace::new(&frames, kroot).unwrap();
        child.copy_from(&frames, &space).unwrap();

        child.free(&frames);
        space.free(&frames);

        assert_eq!(frames.outstanding(), baseline);
    }

    #[test]
    fn stack_write_across_page_boundary() {
        let frames = TestFrames::new();
        let (mut space, _) = new_space(&frames);
        space.init_code(&frames, &[0u8; 16]).unwrap();

        // One-page stack: a write starting below the stack bottom fails
        // without writing anything.
        let va = VirtAddr::new(USER_STACK_TOP - 0x1001);
        assert_eq!(
            space.write_to(&frames, va, &[1, 2, 3, 4]),
            Err(MapError::NotMapped)
        );
        assert_eq!(user_byte(&frames, &space, USER_STACK_TOP - 0x1000), 0);

        // Grow the stack one page down; the same write now spans both
        // pages cleanly.
        let stack = space.region_mut(RegionKind::Stack);
        stack.set_size(2 * PAGE_SIZE);
        stack
            .add_mapping(
                &frames,
                VirtAddr::new(USER_STACK_TOP - 2 * PAGE_SIZE),
                PAGE_SIZE,
                true,
                true,
            )
            .unwrap();
        space.update(&frames).unwrap();

        space.write_to(&frames, va, &[1, 2, 3, 4]).unwrap();
        assert_eq!(user_byte(&frames, &space, USER_STACK_TOP - 0x1001), 1);
        assert_eq!(user_byte(&frames, &space, USER_STACK_TOP - 0x1000), 2);
        assert_eq!(user_byte(&frames, &space, USER_STACK_TOP - 0xfff), 3);
        assert_eq!(user_byte(&frames, &space, USER_STACK_TOP - 0xffe), 4);
    }

    #[test]
    fn write_to_read_only_page_is_refused() {
        let frames = TestFrames::new();
        let (mut space, _) = new_space(&frames);

        let code = space.region_mut(RegionKind::Code);
        code.set_base(VirtAddr::new(0x40_0000));
        code.set_size(PAGE_SIZE);
        code.add_mapping(&frames, VirtAddr::new(0x40_0000), PAGE_SIZE, true, false)
            .unwrap();

        assert_eq!(
            space.write_to(&frames, VirtAddr::new(0x40_0010), &[1]),
            Err(MapError::NotWritable)
        );
    }

    #[test]
    fn mark_not_present_zeroes_the_entry_and_sync_keeps_it_hidden() {
        let frames = TestFrames::new();
        let (mut space, _) = new_space(&frames);
        space.init_code(&frames, &[0u8; 16]).unwrap();

        let page = VirtAddr::new(USER_STACK_TOP - PAGE_SIZE);
        assert!(pte_raw(&frames, &space, page.as_u64()).unwrap() != 0);

        space
            .region_mut(RegionKind::Stack)
            .find_mut(page)
            .unwrap()
            .set_present(false);
        space.mark_not_present(&frames, page);

        // The walk now sees a zero entry.
        assert_eq!(pte_raw(&frames, &space, page.as_u64()), Some(0));

        // A full sync keeps the page hidden.
        space.update(&frames).unwrap();
        assert_absent(&frames, &space, page.as_u64());
    }

    #[test]
    #[should_panic(expected = "must be used and hidden")]
    fn mark_not_present_requires_hidden_descriptor() {
        let frames = TestFrames::new();
        let (mut space, _) = new_space(&frames);
        space.init_code(&frames, &[0u8; 16]).unwrap();

        // Still present in the logical model: precondition violation.
        space.mark_not_present(&frames, VirtAddr::new(USER_STACK_TOP - PAGE_SIZE));
    }

    #[test]
    fn containment_is_three_valued() {
        let frames = TestFrames::new();
        let (mut space, _) = new_space(&frames);
        space.init_code(&frames, &[0u8; 16]).unwrap();

        assert_eq!(
            space.containment(VirtAddr::new(INIT_CODE_BASE), 16),
            Containment::Contained
        );
        assert_eq!(
            space.containment(VirtAddr::new(INIT_CODE_BASE + 5 * PAGE_SIZE), 2 * PAGE_SIZE),
            Containment::Partial
        );
        assert_eq!(
            space.containment(VirtAddr::new(0x7000_0000), 16),
            Containment::Unmapped
        );
    }

    #[test]
    fn heap_growth_maps_and_syncs() {
        let frames = TestFrames::new();
        let (mut space, _) = new_space(&frames);
        space.init_code(&frames, &[0u8; 16]).unwrap();

        // What the sbrk path does: anchor the heap, extend it, resync.
        let heap_base = 0x50_0000;
        let heap = space.region_mut(RegionKind::Heap);
        heap.set_base(VirtAddr::new(heap_base));
        heap.add_mapping(&frames, VirtAddr::new(heap_base), 2 * PAGE_SIZE, true, true)
            .unwrap();
        heap.set_size(2 * PAGE_SIZE);
        space.update(&frames).unwrap();

        assert_present_writable(&frames, &space, heap_base, true);
        assert_present_writable(&frames, &space, heap_base + PAGE_SIZE, true);
        assert_absent(&frames, &space, heap_base + 2 * PAGE_SIZE);

        space
            .write_to(&frames, VirtAddr::new(heap_base + 0x800), &[9, 9])
            .unwrap();
        assert_eq!(user_byte(&frames, &space, heap_base + 0x800), 9);
    }

    #[test]
    fn kernel_half_survives_space_lifecycle() {
        let frames = TestFrames::new();
        let kroot = frames.make_kernel_root();
        let expected = frames.root_entry(kroot, KERNEL_PML4_SLOT);

        let mut space = AddressSpace::new(&frames, kroot).unwrap();
        space.init_code(&frames, &[0u8; 16]).unwrap();
        assert_eq!(frames.root_entry(space.root(), KERNEL_PML4_SLOT), expected);

        space.update(&frames).unwrap();
        assert_eq!(frames.root_entry(space.root(), KERNEL_PML4_SLOT), expected);

        space.free(&frames);
        // The shared kernel PDPT is still reachable through the kernel root.
        assert_eq!(frames.root_entry(kroot, KERNEL_PML4_SLOT), expected);
    }
}
