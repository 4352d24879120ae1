/*
 * Global Descriptor Table (GDT) and Task State Segment (TSS)
 *
 * x86-64 uses a flat memory model, but the GDT is still required for:
 *
 * 1. Code/Data Segment Descriptors: kernel and user code/data segments
 * 2. Task State Segment: the privilege-0 stack the CPU loads on a
 *    ring 3 -> ring 0 transition, and the interrupt stack table
 * 3. Privilege Level Management: ring 0 (kernel) vs ring 3 (user)
 *
 * The TSS privilege-0 stack is rewritten on every process install, so the
 * TSS lives in a mutable static that only the install path (interrupts
 * disabled) touches.
 */

use lazy_static::lazy_static;
use x86_64::{
    VirtAddr,
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

static mut TSS: TaskStateSegment = TaskStateSegment::new();

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        unsafe {
            let tss = &mut *core::ptr::addr_of_mut!(TSS);
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
                const STACK_SIZE: usize = 4096;
                static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

                let stack_start = VirtAddr::from_ptr(&raw const STACK);
                stack_start + STACK_SIZE as u64
            };
        }

        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector =
            gdt.append(Descriptor::tss_segment(unsafe { &*core::ptr::addr_of!(TSS) }));
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
}

/// Load the GDT, reload every segment register and load the TSS.
/// Must run once per CPU before the first process install.
pub fn init() {
    use x86_64::instructions::{
        segmentation::{CS, DS, ES, FS, GS, SS, Segment},
        tables::load_tss,
    };

    log::info!("loading GDT");
    GDT.0.load();

    unsafe {
        CS::set_reg(GDT.1.code_selector);

        // All data segments must point into the new GDT before the TSS
        // load.
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        FS::set_reg(GDT.1.data_selector);
        GS::set_reg(GDT.1.data_selector);

        load_tss(GDT.1.tss_selector);
    }
}

/// Set the privilege-0 stack the CPU switches to on a ring 3 -> ring 0
/// transition. Caller must have interrupts disabled.
pub fn set_kernel_stack(top: VirtAddr) {
    unsafe {
        (*core::ptr::addr_of_mut!(TSS)).privilege_stack_table[0] = top;
    }
}

/// Get the user code segment selector (Ring 3)
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code_selector
}

/// Get the user data segment selector (Ring 3)
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data_selector
}
