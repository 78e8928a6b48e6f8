//! Machines and the manager that owns them.

use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use spin::RwLock;

use crate::backend::AxVmmBackend;
use crate::caps::CapabilityRegistry;
use crate::id::{IdArena, MachineId, VcpuId};
use crate::memory::{GuestMemoryMap, GuestMemoryRegion, MemoryMapping};
use crate::vcpu::{VCpu, VCpuState};

/// Options for creating a machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MachineConfig {
    /// Architecture capabilities the machine needs from its backend.
    pub arch_caps: u64,
}

struct VCpuTable {
    vcpus: IdArena<Arc<VCpu>>,
    /// Set once the machine is destroyed, so a racing `create_vcpu` cannot
    /// add a vcpu to it.
    destroyed: bool,
}

/// One virtual machine: its backend, its memory map and its vcpus.
pub(crate) struct Machine {
    id: MachineId,
    backend: Arc<dyn AxVmmBackend>,
    /// Read by every running vcpu for the duration of its entry.
    pub(crate) memory: RwLock<GuestMemoryMap>,
    vcpus: RwLock<VCpuTable>,
}

impl Machine {
    fn new(id: MachineId, backend: Arc<dyn AxVmmBackend>) -> Self {
        Self {
            id,
            backend,
            memory: RwLock::new(GuestMemoryMap::new()),
            vcpus: RwLock::new(VCpuTable {
                vcpus: IdArena::new(),
                destroyed: false,
            }),
        }
    }

    pub fn backend(&self) -> &dyn AxVmmBackend {
        &*self.backend
    }

    pub fn vcpu(&self, id: VcpuId) -> AxResult<Arc<VCpu>> {
        if id.machine() != self.id {
            return ax_err!(NotFound, format!("{:?} does not belong to {:?}", id, self.id));
        }
        match self.vcpus.read().vcpus.get(id.index() as u32, id.generation()) {
            Some(vcpu) => Ok(vcpu.clone()),
            None => ax_err!(NotFound, format!("no such vcpu {:?}", id)),
        }
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.read().vcpus.len()
    }

    pub fn create_vcpu(&self, limit: usize) -> AxResult<VcpuId> {
        let mut table = self.vcpus.write();
        if table.destroyed {
            return ax_err!(NotFound, format!("{:?} is destroyed", self.id));
        }
        if table.vcpus.len() >= limit {
            return ax_err!(
                NoMemory,
                format!("{:?} already has the maximum of {} vcpus", self.id, limit)
            );
        }
        let (index, generation) = table.vcpus.insert_with(|index, generation| {
            Arc::new(VCpu::new(VcpuId::new(self.id, index, generation)))
        });
        let id = VcpuId::new(self.id, index, generation);
        debug!("{:?} created", id);
        Ok(id)
    }

    pub fn destroy_vcpu(&self, id: VcpuId) -> AxResult {
        let mut table = self.vcpus.write();
        let Some(vcpu) = table.vcpus.get(id.index() as u32, id.generation()) else {
            return ax_err!(NotFound, format!("no such vcpu {:?}", id));
        };
        vcpu.retire()?;
        table.vcpus.remove(id.index() as u32, id.generation());
        debug!("{:?} destroyed", id);
        Ok(())
    }

    /// Raises the stop request of every vcpu.
    pub fn request_exit_all(&self) {
        for vcpu in self.vcpus.read().vcpus.iter() {
            vcpu.request_exit();
        }
    }

    /// Hands configuration operation `op` to the backend after checking its
    /// payload size. `limit` caps the payload size.
    pub fn configure(&self, op: u64, data: &[u8], limit: usize) -> AxResult {
        let Some(size) = self.backend.machine_config_size(op) else {
            return ax_err!(
                InvalidInput,
                format!("unknown machine configuration {:#x}", op)
            );
        };
        if size > limit || data.len() != size {
            return ax_err!(
                InvalidInput,
                format!(
                    "configuration {:#x} takes {} bytes, got {} (limit {})",
                    op,
                    size,
                    data.len(),
                    limit
                )
            );
        }
        self.backend.configure_machine(self.id, op, data)?;
        debug!("{:?} configured: op {:#x}, {} bytes", self.id, op, size);
        Ok(())
    }

    pub fn set_memory_mapping(&self, mapping: &MemoryMapping, limit: u64) -> AxResult {
        // A running vcpu holds the read side for its whole entry.
        let Some(mut memory) = self.memory.try_write() else {
            return ax_err!(ResourceBusy, format!("{:?} has running vcpus", self.id));
        };
        // A vcpu may have claimed `Running` without reaching the map yet. It
        // will wait for this guard, but the mutation must still be refused.
        if let Some(vcpu) = self
            .vcpus
            .read()
            .vcpus
            .iter()
            .find(|vcpu| vcpu.state() != VCpuState::Stopped)
        {
            return ax_err!(
                ResourceBusy,
                format!("{:?} is {:?}, not stopped", vcpu.id(), vcpu.state())
            );
        }
        memory.apply(mapping, limit)?;
        debug!("{:?} memory map updated: {:?}", self.id, mapping);
        Ok(())
    }

    pub fn memory_map(&self) -> Vec<GuestMemoryRegion> {
        self.memory.read().regions().to_vec()
    }

    /// Marks the machine destroyed if it has no vcpus left.
    fn retire(&self) -> AxResult {
        let mut table = self.vcpus.write();
        if !table.vcpus.is_empty() {
            return ax_err!(
                ResourceBusy,
                format!("{:?} still has {} vcpus", self.id, table.vcpus.len())
            );
        }
        table.destroyed = true;
        Ok(())
    }
}

/// Owns every machine of one [`AxVmm`](crate::AxVmm) instance.
pub(crate) struct MachineManager<'a> {
    caps: &'a CapabilityRegistry,
    backends: Vec<Arc<dyn AxVmmBackend>>,
    machines: RwLock<IdArena<Arc<Machine>>>,
}

impl<'a> MachineManager<'a> {
    pub fn new(caps: &'a CapabilityRegistry) -> Self {
        Self {
            caps,
            backends: Vec::new(),
            machines: RwLock::new(IdArena::new()),
        }
    }

    pub fn register_backend(&mut self, backend: Arc<dyn AxVmmBackend>) {
        debug!("backend registered: arch caps {:#x}", backend.arch_caps());
        self.backends.push(backend);
    }

    fn select_backend(&self, requested: u64) -> AxResult<Arc<dyn AxVmmBackend>> {
        let supported = self.caps.query_capability().arch_caps;
        if requested & !supported != 0 {
            return ax_err!(
                Unsupported,
                format!("arch caps {:#x} not offered (have {:#x})", requested, supported)
            );
        }
        match self
            .backends
            .iter()
            .find(|backend| backend.arch_caps() & requested == requested)
        {
            Some(backend) => Ok(backend.clone()),
            None => ax_err!(
                Unsupported,
                format!("no backend provides arch caps {:#x}", requested)
            ),
        }
    }

    pub fn create_machine(&self, config: &MachineConfig) -> AxResult<MachineId> {
        let backend = self.select_backend(config.arch_caps)?;
        let limit = self.caps.query_capability().max_machines;
        let mut machines = self.machines.write();
        if machines.len() >= limit {
            return ax_err!(
                NoMemory,
                format!("already at the maximum of {} machines", limit)
            );
        }
        let (index, generation) = machines.insert_with(|index, generation| {
            Arc::new(Machine::new(MachineId::new(index, generation), backend))
        });
        let id = MachineId::new(index, generation);
        debug!("{:?} created", id);
        Ok(id)
    }

    pub fn machine(&self, id: MachineId) -> AxResult<Arc<Machine>> {
        match self.machines.read().get(id.index() as u32, id.generation()) {
            Some(machine) => Ok(machine.clone()),
            None => ax_err!(NotFound, format!("no such machine {:?}", id)),
        }
    }

    pub fn machine_count(&self) -> usize {
        self.machines.read().len()
    }

    pub fn destroy_machine(&self, id: MachineId) -> AxResult {
        let mut machines = self.machines.write();
        let Some(machine) = machines.get(id.index() as u32, id.generation()) else {
            return ax_err!(NotFound, format!("no such machine {:?}", id));
        };
        machine.retire()?;
        machines.remove(id.index() as u32, id.generation());
        debug!("{:?} destroyed", id);
        Ok(())
    }
}
