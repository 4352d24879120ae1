/*
 * x86-64 CPU Install
 *
 * Switching the CPU to a process's address space takes two coupled writes:
 * the TSS privilege-0 stack (where the CPU lands on a ring 3 -> ring 0
 * transition) and CR3. A context switch between the two would leave the
 * CPU on the wrong kernel stack, so both happen with interrupts disabled.
 */

pub mod gdt;

use x86_64::VirtAddr;
use x86_64::instructions::interrupts;

use crate::memory::AddressSpace;
use crate::memory::layout::KSTACK_SIZE;
use crate::memory::paging;
use crate::memory::types::PhysAddr;

/// Point the current CPU at `space`, using `kstack` (the bottom of the
/// process's kernel stack) for ring transitions.
///
/// # Panics
/// Panics on a null or misaligned kernel stack, or a null root table.
pub fn install(space: &AddressSpace, kstack: VirtAddr) {
    assert!(
        kstack.as_u64() != 0,
        "install: process has no kernel stack"
    );
    assert!(
        kstack.as_u64() % 16 == 0,
        "install: kernel stack {:#x} not 16-byte aligned",
        kstack.as_u64()
    );
    assert!(
        space.root().as_u64() != 0,
        "install: address space has no root table"
    );

    interrupts::without_interrupts(|| {
        gdt::set_kernel_stack(kstack + KSTACK_SIZE);
        paging::load_root(space.root());
    });
}

/// Point the current CPU at the kernel-only root table (no process is
/// current).
pub fn install_kernel(kernel_root: PhysAddr) {
    interrupts::without_interrupts(|| {
        paging::load_root(kernel_root);
    });
}
