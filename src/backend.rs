use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{ax_err, AxResult};

use crate::caps::StateLayout;
use crate::comm::CommPage;
use crate::exit::{RawExit, EXIT_STATE_WORDS};
use crate::id::{MachineId, VcpuId};
use crate::memory::GuestMemoryMap;

/// Architecture-specific executor of guest code.
///
/// A backend is chosen for a machine when the machine is created, from the
/// architecture capabilities the controller requests, and is never switched
/// afterwards. The register file of each vCPU is owned by the backend and keyed
/// by [`VcpuId`]; this crate only moves the comm page and the pending event
/// across the boundary.
pub trait AxVmmBackend: Send + Sync {
    /// Architecture capabilities this backend provides.
    fn arch_caps(&self) -> u64;

    /// Runs the vCPU until an exit needs the controller.
    ///
    /// Must not return before a genuine exit condition, an observed stop
    /// request (report [`EXIT_STOPPED`](crate::EXIT_STOPPED)), or an
    /// unrecoverable fault (report [`EXIT_INVALID`](crate::EXIT_INVALID)).
    ///
    /// Before returning, the backend must have:
    /// - applied every group in [`CommPage::commit_mask`],
    /// - consumed the posted event with [`CommPage::take_event`] if it was
    ///   delivered, leaving it posted otherwise,
    /// - populated and [marked cached](CommPage::mark_cached) at least the
    ///   groups in [`CommPage::wanted`].
    fn enter(&self, vcpu: VcpuId, ctx: &mut EntryContext<'_>) -> RawExit;

    /// Payload size of machine configuration operation `op`, or `None` if the
    /// backend does not implement it.
    fn machine_config_size(&self, op: u64) -> Option<usize> {
        let _ = op;
        None
    }

    /// Applies a machine configuration operation. `data` has exactly the size
    /// reported by [`AxVmmBackend::machine_config_size`].
    fn configure_machine(&self, machine: MachineId, op: u64, data: &[u8]) -> AxResult {
        let _ = (machine, data);
        ax_err!(Unsupported, format!("machine configuration {:#x}", op))
    }
}

/// Everything a backend may touch during one entry.
pub struct EntryContext<'a> {
    /// The vCPU's comm page, owned by the backend until `enter` returns.
    pub comm: &'a mut CommPage,
    /// Group boundaries of the comm page payload.
    pub layout: &'a StateLayout,
    /// The machine's memory map. Stable for the whole entry.
    pub memory: &'a GuestMemoryMap,
    /// Whether the memory map changed since this vCPU's previous entry. Always
    /// set on the first entry.
    pub memory_changed: bool,
    /// Scratch state the backend returned on the previous exit.
    pub exit_state: &'a [u64; EXIT_STATE_WORDS],
    /// Raised when the controller wants the vCPU out.
    pub stop: StopToken<'a>,
}

/// Read side of a vCPU's stop request.
#[derive(Clone, Copy)]
pub struct StopToken<'a> {
    flag: &'a AtomicBool,
}

impl<'a> StopToken<'a> {
    pub(crate) fn new(flag: &'a AtomicBool) -> Self {
        Self { flag }
    }

    /// Whether the backend should leave guest execution and report a stopped exit.
    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
