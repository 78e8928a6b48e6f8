//! Address types shared by the memory map and the exit records.

use memory_addr::{def_usize_addr, def_usize_addr_formatter, AddrRange};

/// Size of the smallest guest page that can be mapped.
pub const GUEST_PAGE_SIZE: usize = 0x1000;

def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;

    /// Host virtual address of the memory backing a guest region.
    pub type HostVirtAddr;
}

def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
    HostVirtAddr = "HVA:{}";
}

/// A range of guest physical addresses.
pub type GuestPhysAddrRange = AddrRange<GuestPhysAddr>;
