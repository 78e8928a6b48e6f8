use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::AxResult;

use crate::backend::AxVmmBackend;
use crate::caps::{CapabilityDescriptor, CapabilityRegistry};
use crate::comm::CommPage;
use crate::event::{Event, InjectOutcome};
use crate::exit::ExitRecord;
use crate::id::{MachineId, VcpuId};
use crate::machine::{Machine, MachineConfig, MachineManager};
use crate::memory::{GuestMemoryRegion, MemoryMapping};
use crate::vcpu::{VCpu, VCpuState};

/// The controller-facing surface of the hypervisor core.
///
/// Every request is keyed by an opaque [`MachineId`] or [`VcpuId`] and checked
/// against the [`CapabilityRegistry`] the instance was built with. All methods
/// take `&self` and may be called from any thread; [`AxVmm::run`] blocks the
/// calling thread for the duration of one guest entry.
pub struct AxVmm<'a> {
    caps: &'a CapabilityRegistry,
    machines: MachineManager<'a>,
}

impl<'a> AxVmm<'a> {
    /// Creates an instance with no backend registered.
    pub fn new(caps: &'a CapabilityRegistry) -> Self {
        Self {
            caps,
            machines: MachineManager::new(caps),
        }
    }

    /// Builder form of [`AxVmm::register_backend`].
    pub fn with_backend(mut self, backend: Arc<dyn AxVmmBackend>) -> Self {
        self.register_backend(backend);
        self
    }

    /// Adds a backend. Machines pick the first registered backend that
    /// provides the architecture capabilities they ask for.
    pub fn register_backend(&mut self, backend: Arc<dyn AxVmmBackend>) {
        self.machines.register_backend(backend);
    }

    pub fn query_capability(&self) -> &CapabilityDescriptor {
        self.caps.query_capability()
    }

    fn vcpu(&self, id: VcpuId) -> AxResult<(Arc<Machine>, Arc<VCpu>)> {
        let machine = self.machines.machine(id.machine())?;
        let vcpu = machine.vcpu(id)?;
        Ok((machine, vcpu))
    }

    /// Creates a machine with the default [`MachineConfig`].
    pub fn create_machine(&self) -> AxResult<MachineId> {
        self.create_machine_with(MachineConfig::default())
    }

    pub fn create_machine_with(&self, config: MachineConfig) -> AxResult<MachineId> {
        self.machines.create_machine(&config)
    }

    /// Destroys a machine. Fails with `ResourceBusy` while it still has vCPUs.
    pub fn destroy_machine(&self, id: MachineId) -> AxResult {
        self.machines.destroy_machine(id)
    }

    pub fn machine_count(&self) -> usize {
        self.machines.machine_count()
    }

    /// Passes a backend-defined configuration operation to the machine's
    /// backend.
    ///
    /// Fails with `InvalidInput` if the backend does not know `op` or if
    /// `data` does not have the size the backend expects for it.
    pub fn configure_machine(&self, id: MachineId, op: u64, data: &[u8]) -> AxResult {
        let limit = self.caps.query_capability().max_machine_config_size;
        self.machines.machine(id)?.configure(op, data, limit)
    }

    /// Applies one change to the memory map of a stopped machine.
    ///
    /// The change is all-or-nothing. It fails with `ResourceBusy` if any vCPU
    /// of the machine is not [`VCpuState::Stopped`]; use
    /// [`AxVmm::request_machine_exit`] to bring running vCPUs out first.
    pub fn set_memory_mapping(&self, id: MachineId, mapping: MemoryMapping) -> AxResult {
        let limit = self.caps.query_capability().max_guest_memory;
        self.machines.machine(id)?.set_memory_mapping(&mapping, limit)
    }

    /// The current regions of the machine, sorted by guest address.
    pub fn memory_map(&self, id: MachineId) -> AxResult<Vec<GuestMemoryRegion>> {
        Ok(self.machines.machine(id)?.memory_map())
    }

    pub fn vcpu_count(&self, id: MachineId) -> AxResult<usize> {
        Ok(self.machines.machine(id)?.vcpu_count())
    }

    /// Raises the stop request of every vCPU of the machine.
    pub fn request_machine_exit(&self, id: MachineId) -> AxResult {
        self.machines.machine(id)?.request_exit_all();
        Ok(())
    }

    pub fn create_vcpu(&self, machine: MachineId) -> AxResult<VcpuId> {
        let limit = self.caps.query_capability().max_vcpus_per_machine;
        self.machines.machine(machine)?.create_vcpu(limit)
    }

    /// Destroys a vCPU that is stopped or faulted.
    pub fn destroy_vcpu(&self, id: VcpuId) -> AxResult {
        self.machines.machine(id.machine())?.destroy_vcpu(id)
    }

    pub fn vcpu_state(&self, id: VcpuId) -> AxResult<VCpuState> {
        Ok(self.vcpu(id)?.1.state())
    }

    /// Attaches a comm page to a vCPU. The page must carry the protocol
    /// version of this instance.
    pub fn bind_comm_page(&self, id: VcpuId, page: Box<CommPage>) -> AxResult {
        self.vcpu(id)?
            .1
            .bind_comm_page(page, self.caps.query_capability())
    }

    /// Detaches and returns the comm page of a vCPU that is not running.
    pub fn unbind_comm_page(&self, id: VcpuId) -> AxResult<Box<CommPage>> {
        self.vcpu(id)?.1.unbind_comm_page()
    }

    /// Runs `f` on the comm page of a vCPU that is not running.
    pub fn with_comm_page<F, T>(&self, id: VcpuId, f: F) -> AxResult<T>
    where
        F: FnOnce(&mut CommPage) -> T,
    {
        self.vcpu(id)?.1.with_comm_page(f)
    }

    /// Enters the guest once and returns the exit record.
    ///
    /// Blocks until the backend returns. On success the vCPU is left
    /// [`VCpuState::Exited`] (or [`VCpuState::Faulted`] if the backend broke
    /// the protocol) and must be acknowledged with [`AxVmm::stop_after_exit`]
    /// before the next run.
    ///
    /// Errors:
    /// - `ResourceBusy`: another thread is running the vCPU. Retry later.
    /// - `BadState`: the vCPU has an unacknowledged exit, is faulted, or has
    ///   no comm page bound. Retrying does not help until the controller
    ///   acts.
    /// - `NotFound`: the vCPU or its machine does not exist.
    pub fn run(&self, id: VcpuId) -> AxResult<ExitRecord> {
        let (machine, vcpu) = self.vcpu(id)?;
        vcpu.run(&machine, self.caps.state_layout())
    }

    /// Acknowledges the last exit, making the vCPU runnable again.
    pub fn stop_after_exit(&self, id: VcpuId) -> AxResult {
        self.vcpu(id)?.1.stop_after_exit()
    }

    /// Asks a vCPU to leave guest execution with a stopped exit. If it is not
    /// running, its next entry exits immediately.
    pub fn request_exit(&self, id: VcpuId) -> AxResult {
        self.vcpu(id)?.1.request_exit();
        Ok(())
    }

    /// Whether a stop request is raised and not yet answered by a stopped exit.
    pub fn stop_requested(&self, id: VcpuId) -> AxResult<bool> {
        Ok(self.vcpu(id)?.1.stop_requested())
    }

    /// Queues an event for the next entry, replacing any undelivered one.
    pub fn set_pending_event(&self, id: VcpuId, event: Event) -> AxResult<InjectOutcome> {
        Ok(self.vcpu(id)?.1.set_pending_event(event))
    }

    /// Withdraws the queued event, if any.
    pub fn cancel_pending_event(&self, id: VcpuId) -> AxResult<Option<Event>> {
        Ok(self.vcpu(id)?.1.cancel_pending_event())
    }

    pub fn pending_event(&self, id: VcpuId) -> AxResult<Option<Event>> {
        Ok(self.vcpu(id)?.1.pending_event())
    }
}
