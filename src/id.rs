//! Generation-tagged identifiers and the arena that hands them out.
//!
//! Slot indices are dense and reused after a destroy, but every reuse bumps the
//! slot's generation, so an identifier held across a destroy/create cycle never
//! names the new object.

use alloc::vec::Vec;
use core::fmt;

/// Identifier of a machine.
///
/// Only meaningful to the [`AxVmm`](crate::AxVmm) instance that issued it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId {
    index: u32,
    generation: u32,
}

impl MachineId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The dense slot index of the machine.
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) const fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the identifier into a single word, e.g. for a request ABI.
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Rebuilds an identifier from [`MachineId::to_raw`]. A forged value is
    /// harmless: it simply fails lookup with `NotFound`.
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VM[{}.{}]", self.index, self.generation)
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifier of a vCPU, scoped to the machine that owns it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VcpuId {
    machine: MachineId,
    index: u32,
    generation: u32,
}

impl VcpuId {
    pub(crate) const fn new(machine: MachineId, index: u32, generation: u32) -> Self {
        Self {
            machine,
            index,
            generation,
        }
    }

    /// The machine this vCPU belongs to.
    pub const fn machine(&self) -> MachineId {
        self.machine
    }

    /// The dense, machine-scoped slot index of the vCPU.
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/VCpu[{}.{}]",
            self.machine, self.index, self.generation
        )
    }
}

impl fmt::Display for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A slot arena whose handles are `(index, generation)` pairs.
pub(crate) struct IdArena<T> {
    slots: Vec<Slot<T>>,
    live: usize,
}

impl<T> IdArena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Stores the value built by `f` in the lowest free slot and returns the
    /// slot's `(index, generation)`. `f` receives the same pair, so the value
    /// can embed its own identifier.
    pub fn insert_with<F>(&mut self, f: F) -> (u32, u32)
    where
        F: FnOnce(u32, u32) -> T,
    {
        self.live += 1;
        if let Some(index) = self.slots.iter().position(|slot| slot.value.is_none()) {
            let slot = &mut self.slots[index];
            let index = index as u32;
            slot.value = Some(f(index, slot.generation));
            (index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                value: Some(f(index, 0)),
            });
            (index, 0)
        }
    }

    pub fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Removes the entry and retires its generation.
    pub fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        Some(value)
    }

    /// Iterates over the live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }
}
