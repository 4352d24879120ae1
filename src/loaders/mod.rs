/*
 * Binary Loaders
 *
 * Loaders populate a user address space from an on-disk image. Only ELF64
 * is supported.
 */

pub mod elf;
