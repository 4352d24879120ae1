/*
 * Test Frame Arena
 *
 * Host-side FrameAllocator used by unit tests: page-aligned heap frames
 * behind a fake physical window, with allocation accounting and failure
 * injection. Fresh frames are poisoned (non-zero) so code paths that
 * forget to zero a frame show up in assertions.
 */

use std::cell::RefCell;
use std::collections::HashMap;

use crate::memory::phys::FrameAllocator;
use crate::memory::types::{PAGE_SIZE, PhysAddr, PhysFrame};

/// Base of the fake physical window test frames live in.
pub(crate) const TEST_PHYS_BASE: u64 = 0x100_0000;

const POISON: u8 = 0xA5;

#[repr(C, align(4096))]
struct FramePage([u8; PAGE_SIZE as usize]);

struct Arena {
    /// Slot index == frame number within the fake window.
    frames: Vec<Option<Box<FramePage>>>,
    /// Page-aligned host pointer -> slot index.
    by_ptr: HashMap<usize, usize>,
    outstanding: usize,
    /// Remaining allocations that will still succeed, when set.
    fail_after: Option<usize>,
}

pub(crate) struct TestFrames {
    inner: RefCell<Arena>,
}

impl TestFrames {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Arena {
                frames: Vec::new(),
                by_ptr: HashMap::new(),
                outstanding: 0,
                fail_after: None,
            }),
        }
    }

    /// Frames currently allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.inner.borrow().outstanding
    }

    /// Let the next `n` allocations succeed, then fail until reset.
    pub fn fail_after(&self, n: usize) {
        self.inner.borrow_mut().fail_after = Some(n);
    }

    /// Remove any injected failure.
    pub fn no_fail(&self) {
        self.inner.borrow_mut().fail_after = None;
    }

    /// Build a fake kernel root table: a PML4 whose higher-half slots all
    /// point at one shared (empty) PDPT, the way the kernel root shares
    /// its kernel sub-tables with every address space.
    pub fn make_kernel_root(&self) -> PhysAddr {
        let root = self.alloc_frame().expect("arena root frame");
        let pdpt = self.alloc_frame().expect("arena kernel pdpt frame");

        unsafe {
            core::ptr::write_bytes(self.frame_ptr(root), 0, PAGE_SIZE as usize);
            core::ptr::write_bytes(self.frame_ptr(pdpt), 0, PAGE_SIZE as usize);

            let entries = self.frame_ptr(root) as *mut u64;
            for slot in crate::memory::layout::KERNEL_PML4_SLOT..512 {
                // PRESENT | WRITABLE, pointing at the shared PDPT.
                entries.add(slot).write(pdpt.start_address() | 0b11);
            }
        }

        PhysAddr::new(root.start_address())
    }

    /// Raw PML4 entry `slot` of the table at `root`.
    pub fn root_entry(&self, root: PhysAddr, slot: usize) -> u64 {
        unsafe { (self.phys_to_virt(root) as *const u64).add(slot).read() }
    }
}

impl FrameAllocator for TestFrames {
    fn alloc_frame(&self) -> Option<PhysFrame> {
        let mut arena = self.inner.borrow_mut();

        match arena.fail_after {
            Some(0) => return None,
            Some(ref mut n) => *n -= 1,
            None => {}
        }

        let slot = match arena.frames.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                arena.frames.push(None);
                arena.frames.len() - 1
            }
        };

        let page = Box::new(FramePage([POISON; PAGE_SIZE as usize]));
        let ptr = page.0.as_ptr() as usize;
        arena.frames[slot] = Some(page);
        arena.by_ptr.insert(ptr, slot);
        arena.outstanding += 1;

        Some(PhysFrame::containing_address(
            TEST_PHYS_BASE + (slot as u64) * PAGE_SIZE,
        ))
    }

    fn free_frame(&self, frame: PhysFrame) {
        let mut arena = self.inner.borrow_mut();
        let slot = ((frame.start_address() - TEST_PHYS_BASE) / PAGE_SIZE) as usize;

        let page = arena
            .frames
            .get_mut(slot)
            .and_then(Option::take)
            .unwrap_or_else(|| panic!("free of unallocated frame {:#x}", frame.start_address()));

        arena.by_ptr.remove(&(page.0.as_ptr() as usize));
        arena.outstanding -= 1;
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        let arena = self.inner.borrow();
        let off = phys.as_u64() - TEST_PHYS_BASE;
        let slot = (off / PAGE_SIZE) as usize;
        let page = arena.frames[slot]
            .as_ref()
            .unwrap_or_else(|| panic!("phys_to_virt of freed frame {:#x}", phys.as_u64()));
        unsafe { (page.0.as_ptr() as *mut u8).add((off % PAGE_SIZE) as usize) }
    }

    fn virt_to_phys(&self, ptr: *const u8) -> PhysAddr {
        let arena = self.inner.borrow();
        let base = (ptr as usize) & !(PAGE_SIZE as usize - 1);
        let slot = *arena
            .by_ptr
            .get(&base)
            .unwrap_or_else(|| panic!("virt_to_phys of non-arena pointer {:p}", ptr));
        let off = (ptr as usize - base) as u64;
        PhysAddr::new(TEST_PHYS_BASE + (slot as u64) * PAGE_SIZE + off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_round_trips_and_counts() {
        let frames = TestFrames::new();
        assert_eq!(frames.outstanding(), 0);

        let f = frames.alloc_frame().unwrap();
        assert_eq!(frames.outstanding(), 1);

        let ptr = frames.frame_ptr(f);
        assert_eq!(unsafe { *ptr }, POISON);
        assert_eq!(frames.virt_to_phys(ptr).as_u64(), f.start_address());

        frames.free_frame(f);
        assert_eq!(frames.outstanding(), 0);
    }

    #[test]
    fn fail_injection_counts_down() {
        let frames = TestFrames::new();
        frames.fail_after(2);
        assert!(frames.alloc_frame().is_some());
        assert!(frames.alloc_frame().is_some());
        assert!(frames.alloc_frame().is_none());
        frames.no_fail();
        assert!(frames.alloc_frame().is_some());
    }

    #[test]
    #[should_panic(expected = "free of unallocated frame")]
    fn double_free_panics() {
        let frames = TestFrames::new();
        let f = frames.alloc_frame().unwrap();
        frames.free_frame(f);
        frames.free_frame(f);
    }
}
