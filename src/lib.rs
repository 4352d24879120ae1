/*
 * Sparrow Virtual Memory Subsystem
 *
 * This crate owns the per-process user address space of the Sparrow
 * teaching kernel on x86-64. It keeps two coupled representations
 * consistent:
 *
 * - a portable, region-based bookkeeping layer (code / heap / user stack
 *   regions with one descriptor per virtual page), and
 * - the 4-level hardware paging structure the MMU walks.
 *
 * The bookkeeping layer is authoritative. The hardware table is never read
 * for state; it is rebuilt wholesale from the logical model on request.
 *
 * Module map:
 * - memory::phys          physical frame allocator interface + bitmap impl
 * - memory::paging        4-level page-table manipulation
 * - memory::address_space regions, page descriptors, sync, fork, teardown
 * - loaders::elf          ELF64 loading into the code region
 * - fs                    inode interface + USTAR archive filesystem
 * - arch::x86_64          GDT/TSS and CPU install (CR3)
 *
 * The kernel binary provides the boot path, the logger sink and the panic
 * handler; unit tests build hosted against a test frame arena.
 */

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod fs;
pub mod loaders;
pub mod memory;
