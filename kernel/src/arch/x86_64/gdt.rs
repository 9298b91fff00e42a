//! Global Descriptor Table and Task State Segment.
//!
//! No user-mode segments: user/kernel address-space separation is a
//! non-goal for this kernel, so the GDT carries only the kernel code/data
//! selectors plus the TSS (needed for the double-fault IST stack).

use core::mem::size_of;

use crate::sync::LazyLock;

/// Size of the dedicated double-fault stack.
const DOUBLE_FAULT_STACK_SIZE: usize = 16 * 1024;

/// IST index (1-based) used for the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u8 = 1;

#[repr(align(16))]
struct AlignedStack([u8; DOUBLE_FAULT_STACK_SIZE]);

static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; DOUBLE_FAULT_STACK_SIZE]);

#[repr(C, packed)]
struct Tss {
    reserved0: u32,
    rsp: [u64; 3],
    reserved1: u64,
    ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            reserved0: 0,
            rsp: [0; 3],
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            iomap_base: size_of::<Tss>() as u16,
        }
    }
}

static TSS: LazyLock<Tss> = LazyLock::new(|| {
    let mut tss = Tss::new();
    // SAFETY: single boot-time initialization, before any interrupt enables.
    let stack_top = unsafe { core::ptr::addr_of!(DOUBLE_FAULT_STACK) as u64 + DOUBLE_FAULT_STACK_SIZE as u64 };
    tss.ist[(DOUBLE_FAULT_IST_INDEX - 1) as usize] = stack_top;
    tss
});

#[repr(C, packed)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_mid: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    const fn flat(access: u8, granularity: u8) -> Self {
        Self {
            limit_low: 0xFFFF,
            base_low: 0,
            base_mid: 0,
            access,
            granularity,
            base_high: 0,
        }
    }
}

const ACCESS_PRESENT: u8 = 1 << 7;
const ACCESS_CODE_DATA: u8 = 1 << 4;
const ACCESS_EXECUTABLE: u8 = 1 << 3;
const ACCESS_RW: u8 = 1 << 1;

const KERNEL_CODE_ACCESS: u8 = ACCESS_PRESENT | ACCESS_CODE_DATA | ACCESS_EXECUTABLE | ACCESS_RW;
const KERNEL_DATA_ACCESS: u8 = ACCESS_PRESENT | ACCESS_CODE_DATA | ACCESS_RW;
const GRAN_CODE64: u8 = 0b0010_0000;
const GRAN_DATA: u8 = 0b0000_0000;

/// Selectors for the segments installed into the GDT.
pub struct Selectors {
    pub kernel_code: u16,
    pub kernel_data: u16,
    pub tss: u16,
}

#[repr(C, packed)]
struct TssDescriptor {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
    base_upper: u32,
    reserved: u32,
}

#[repr(C)]
struct Gdt {
    null: GdtEntry,
    kernel_code: GdtEntry,
    kernel_data: GdtEntry,
    tss: TssDescriptor,
}

static GDT: LazyLock<(Gdt, Selectors)> = LazyLock::new(|| {
    let tss_addr = &*TSS as *const Tss as u64;
    let tss_size = (size_of::<Tss>() - 1) as u32;
    let tss_desc = TssDescriptor {
        limit_low: (tss_size & 0xFFFF) as u16,
        base_low: (tss_addr & 0xFFFF) as u16,
        base_mid: ((tss_addr >> 16) & 0xFF) as u8,
        access: ACCESS_PRESENT | 0b1001, // present, 64-bit TSS (available)
        granularity: ((tss_size >> 16) & 0xF) as u8,
        base_high: ((tss_addr >> 24) & 0xFF) as u8,
        base_upper: (tss_addr >> 32) as u32,
        reserved: 0,
    };
    let gdt = Gdt {
        null: GdtEntry::null(),
        kernel_code: GdtEntry::flat(KERNEL_CODE_ACCESS, GRAN_CODE64),
        kernel_data: GdtEntry::flat(KERNEL_DATA_ACCESS, GRAN_DATA),
        tss: tss_desc,
    };
    let selectors = Selectors {
        kernel_code: size_of::<GdtEntry>() as u16,     // index 1
        kernel_data: (size_of::<GdtEntry>() * 2) as u16, // index 2
        tss: (size_of::<GdtEntry>() * 3) as u16,         // index 3
    };
    (gdt, selectors)
});

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u64,
}

/// Loads the GDT, reloads segment registers, and loads the TSS.
///
/// # Safety
///
/// Must run once, early in boot, before the IDT is loaded (interrupt gates
/// reference the kernel code selector installed here).
pub unsafe fn init() {
    let (gdt, selectors) = &*GDT;
    let ptr = DescriptorTablePointer {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: gdt as *const Gdt as u64,
    };
    let code_sel = selectors.kernel_code;
    let data_sel = selectors.kernel_data;
    let tss_sel = selectors.tss;
    // SAFETY: `ptr` describes a valid, static GDT; the reload sequence
    // below is the standard long-mode `lgdt` + far-return + segment reload.
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            "push {code_sel}",
            "lea {tmp}, [55f + rip]",
            "push {tmp}",
            "retfq",
            "55:",
            "mov ds, {data_sel:x}",
            "mov es, {data_sel:x}",
            "mov fs, {data_sel:x}",
            "mov gs, {data_sel:x}",
            "mov ss, {data_sel:x}",
            "ltr {tss_sel:x}",
            ptr = in(reg) &ptr,
            code_sel = in(reg) u64::from(code_sel),
            data_sel = in(reg) data_sel,
            tss_sel = in(reg) tss_sel,
            tmp = lateout(reg) _,
        );
    }
    crate::kdebug!("gdt: initialized");
}
