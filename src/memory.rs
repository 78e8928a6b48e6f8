//! The guest-physical memory map of a machine.

use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use bitflags::bitflags;
use memory_addr::MemoryAddr;

use crate::addr::{GuestPhysAddr, GuestPhysAddrRange, HostVirtAddr};

bitflags! {
    /// Guest access permissions of a mapping, also used to describe the
    /// faulting access of a memory exit.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MappingFlags: usize {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// A guest physical range backed by host memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestMemoryRegion {
    pub gpa: GuestPhysAddrRange,
    /// Host address backing `gpa.start`.
    pub hva: HostVirtAddr,
    pub flags: MappingFlags,
}

impl GuestMemoryRegion {
    /// Describes `size` bytes at `gpa` backed by `hva`. Fails if the guest
    /// range wraps around the address space.
    pub fn new(
        gpa: GuestPhysAddr,
        size: usize,
        hva: HostVirtAddr,
        flags: MappingFlags,
    ) -> AxResult<Self> {
        let Some(range) = GuestPhysAddrRange::try_from_start_size(gpa, size) else {
            return ax_err!(InvalidInput, format!("region {:?}+{:#x} overflows", gpa, size));
        };
        Ok(Self {
            gpa: range,
            hva,
            flags,
        })
    }

    pub fn size(&self) -> usize {
        self.gpa.size()
    }

    /// Host address backing `gpa`, if the region covers it.
    pub fn translate(&self, gpa: GuestPhysAddr) -> Option<HostVirtAddr> {
        self.gpa
            .contains(gpa)
            .then(|| self.hva + (gpa.as_usize() - self.gpa.start.as_usize()))
    }

    fn check_shape(&self) -> AxResult {
        if self.gpa.is_empty() {
            return ax_err!(InvalidInput, "empty guest region");
        }
        if !self.gpa.start.is_aligned_4k() || !self.gpa.end.is_aligned_4k() {
            return ax_err!(
                InvalidInput,
                format!("guest region {:?} is not page aligned", self.gpa)
            );
        }
        if !self.hva.is_aligned_4k() || self.hva.as_usize().checked_add(self.size()).is_none() {
            return ax_err!(InvalidInput, format!("bad host backing {:?}", self.hva));
        }
        if self.flags.is_empty() {
            return ax_err!(InvalidInput, "guest region without access permissions");
        }
        Ok(())
    }
}

/// A change to a machine's memory map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryMapping {
    /// Installs a region, or replaces the region with exactly the same range.
    Map(GuestMemoryRegion),
    /// Removes the region with exactly this range.
    Unmap(GuestPhysAddrRange),
}

/// Ordered, non-overlapping guest regions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuestMemoryMap {
    regions: Vec<GuestMemoryRegion>,
    generation: u64,
}

impl Default for GuestMemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestMemoryMap {
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            generation: 1,
        }
    }

    /// Starts at 1 and grows by one with every change applied to the map.
    ///
    /// Backends that cache translations of the map compare it against the
    /// value they last saw to decide when to flush.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Regions sorted by guest address.
    pub fn regions(&self) -> &[GuestMemoryRegion] {
        &self.regions
    }

    /// Total bytes mapped.
    pub fn mapped_size(&self) -> u64 {
        self.regions.iter().map(|r| r.size() as u64).sum()
    }

    /// The region covering `gpa`.
    pub fn find(&self, gpa: GuestPhysAddr) -> Option<&GuestMemoryRegion> {
        let idx = self.regions.partition_point(|r| r.gpa.end <= gpa);
        self.regions.get(idx).filter(|r| r.gpa.contains(gpa))
    }

    pub fn translate(&self, gpa: GuestPhysAddr) -> Option<HostVirtAddr> {
        self.find(gpa).and_then(|r| r.translate(gpa))
    }

    /// Applies a mapping change, or leaves the map untouched on error.
    ///
    /// `limit` caps the total number of mapped bytes.
    pub(crate) fn apply(&mut self, mapping: &MemoryMapping, limit: u64) -> AxResult {
        self.change(mapping, limit)?;
        self.generation += 1;
        Ok(())
    }

    fn change(&mut self, mapping: &MemoryMapping, limit: u64) -> AxResult {
        match mapping {
            MemoryMapping::Map(region) => {
                region.check_shape()?;
                let same = self.regions.iter().position(|r| r.gpa == region.gpa);
                let replaced = same.map_or(0, |i| self.regions[i].size() as u64);
                if same.is_none() && self.regions.iter().any(|r| r.gpa.overlaps(region.gpa)) {
                    return ax_err!(
                        InvalidInput,
                        format!("guest region {:?} overlaps an existing mapping", region.gpa)
                    );
                }
                if self.mapped_size() - replaced + region.size() as u64 > limit {
                    return ax_err!(
                        NoMemory,
                        format!(
                            "mapping {:?} exceeds the guest memory limit {:#x}",
                            region.gpa, limit
                        )
                    );
                }
                match same {
                    Some(i) => self.regions[i] = *region,
                    None => {
                        let start = region.gpa.start;
                        let at = self.regions.partition_point(|r| r.gpa.start < start);
                        self.regions.insert(at, *region);
                    }
                }
                Ok(())
            }
            MemoryMapping::Unmap(range) => {
                match self.regions.iter().position(|r| r.gpa == *range) {
                    Some(i) => {
                        self.regions.remove(i);
                        Ok(())
                    }
                    None => ax_err!(InvalidInput, format!("{:?} is not a mapped region", range)),
                }
            }
        }
    }
}
