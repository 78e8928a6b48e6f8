use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::backend::{EntryContext, StopToken};
use crate::caps::{CapabilityDescriptor, StateLayout};
use crate::comm::CommPage;
use crate::event::{Event, InjectOutcome, PendingEvent};
use crate::exit::{ExitRecord, VCpuExitReason, EXIT_STATE_WORDS};
use crate::id::VcpuId;
use crate::machine::Machine;

/// The run-state of a virtual CPU.
///
/// ```text
/// Stopped --run--> Running --backend returns--> Exited --stop_after_exit--> Stopped
///                     \
///                      +--backend defect--> Faulted
/// ```
///
/// There is no edge from `Running` back to `Stopped`: every exit is reviewed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VCpuState {
    /// The vcpu has been destroyed.
    Invalid = 0,
    /// The vcpu is idle. The controller owns its comm page.
    Stopped = 1,
    /// A thread is inside `run`. The backend owns the comm page.
    Running = 2,
    /// The backend returned and the exit record awaits review.
    Exited = 3,
    /// The backend misbehaved. The vcpu can only be destroyed.
    Faulted = 4,
}

impl VCpuState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Stopped,
            2 => Self::Running,
            3 => Self::Exited,
            4 => Self::Faulted,
            _ => Self::Invalid,
        }
    }
}

/// Who holds the comm page right now.
enum CommSlot {
    Unbound,
    Bound(Box<CommPage>),
    /// Handed to the backend for the current entry.
    Lent,
}

/// A virtual CPU: run-state machine, comm page binding and pending event.
///
/// All methods take `&self`. The run-state is the synchronisation point: it is
/// only changed by compare-and-swap, so racing `run`, `destroy` and memory map
/// changes from different threads resolve to exactly one winner. No lock is
/// held while the backend executes guest code.
pub(crate) struct VCpu {
    id: VcpuId,
    state: AtomicU8,
    comm: Mutex<CommSlot>,
    pending: PendingEvent,
    stop: AtomicBool,
    /// Backend scratch carried from the last exit into the next entry.
    exit_state: Mutex<[u64; EXIT_STATE_WORDS]>,
    exit_seq: AtomicU64,
    /// Memory map generation seen by the previous entry, 0 before the first.
    memory_generation: AtomicU64,
}

impl VCpu {
    pub fn new(id: VcpuId) -> Self {
        Self {
            id,
            state: AtomicU8::new(VCpuState::Stopped as u8),
            comm: Mutex::new(CommSlot::Unbound),
            pending: PendingEvent::new(),
            stop: AtomicBool::new(false),
            exit_state: Mutex::new([0; EXIT_STATE_WORDS]),
            exit_seq: AtomicU64::new(0),
            memory_generation: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn state(&self) -> VCpuState {
        VCpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transitions the state from `from` to `to`, or returns the actual state.
    fn transition_state(&self, from: VCpuState, to: VCpuState) -> Result<(), VCpuState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(VCpuState::from_u8)
    }

    fn set_state(&self, state: VCpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Rejects controller access to the comm page while the backend owns it.
    fn check_controller_access(&self, slot: &CommSlot) -> AxResult {
        match self.state() {
            VCpuState::Invalid => ax_err!(NotFound, format!("{:?} is destroyed", self.id)),
            VCpuState::Running => ax_err!(ResourceBusy, format!("{:?} is running", self.id)),
            _ if matches!(slot, CommSlot::Lent) => {
                ax_err!(ResourceBusy, format!("{:?} is running", self.id))
            }
            _ => Ok(()),
        }
    }

    pub fn bind_comm_page(&self, page: Box<CommPage>, caps: &CapabilityDescriptor) -> AxResult {
        let mut slot = self.comm.lock();
        self.check_controller_access(&slot)?;
        if matches!(*slot, CommSlot::Bound(_)) {
            return ax_err!(AlreadyExists, format!("{:?} already has a comm page", self.id));
        }
        if page.version() != caps.version {
            return ax_err!(
                InvalidData,
                format!(
                    "comm page version {} does not match protocol version {}",
                    page.version(),
                    caps.version
                )
            );
        }
        *slot = CommSlot::Bound(page);
        debug!("{:?} comm page bound", self.id);
        Ok(())
    }

    pub fn unbind_comm_page(&self) -> AxResult<Box<CommPage>> {
        let mut slot = self.comm.lock();
        self.check_controller_access(&slot)?;
        match core::mem::replace(&mut *slot, CommSlot::Unbound) {
            CommSlot::Bound(page) => {
                debug!("{:?} comm page unbound", self.id);
                Ok(page)
            }
            other => {
                *slot = other;
                ax_err!(BadState, format!("{:?} has no comm page", self.id))
            }
        }
    }

    /// Gives the controller the comm page while the vcpu is not running.
    pub fn with_comm_page<F, T>(&self, f: F) -> AxResult<T>
    where
        F: FnOnce(&mut CommPage) -> T,
    {
        let mut slot = self.comm.lock();
        self.check_controller_access(&slot)?;
        match &mut *slot {
            CommSlot::Bound(page) => Ok(f(&mut **page)),
            _ => ax_err!(BadState, format!("{:?} has no comm page", self.id)),
        }
    }

    pub fn set_pending_event(&self, event: Event) -> InjectOutcome {
        let outcome = self.pending.set(event);
        if let InjectOutcome::Overwritten(previous) = outcome {
            warn!(
                "{:?} pending event {:?} overwritten by {:?}",
                self.id, previous, event
            );
        }
        outcome
    }

    pub fn cancel_pending_event(&self) -> Option<Event> {
        self.pending.take()
    }

    pub fn pending_event(&self) -> Option<Event> {
        self.pending.peek()
    }

    /// Raises the stop request. A running backend exits with a stopped exit; a
    /// vcpu that is not running observes the request on its next entry.
    pub fn request_exit(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Runs the vcpu once, blocking until the backend returns.
    pub fn run(&self, machine: &Machine, layout: &StateLayout) -> AxResult<ExitRecord> {
        if let Err(actual) = self.transition_state(VCpuState::Stopped, VCpuState::Running) {
            return match actual {
                VCpuState::Running => {
                    ax_err!(ResourceBusy, format!("{:?} is already running", self.id))
                }
                VCpuState::Exited => ax_err!(
                    BadState,
                    format!("{:?} has an exit pending review", self.id)
                ),
                VCpuState::Faulted => ax_err!(BadState, format!("{:?} is faulted", self.id)),
                _ => ax_err!(NotFound, format!("{:?} is destroyed", self.id)),
            };
        }

        let taken = {
            let mut slot = self.comm.lock();
            match core::mem::replace(&mut *slot, CommSlot::Lent) {
                CommSlot::Bound(page) => Some(page),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        let Some(mut page) = taken else {
            self.set_state(VCpuState::Stopped);
            return ax_err!(BadState, format!("{:?} has no comm page", self.id));
        };

        // Waits only for an in-flight memory map change, which is bounded.
        let memory = machine.memory.read();

        let event = self.pending.take();
        if let Some(event) = event {
            page.post_event(event.to_raw());
        }
        page.begin_entry();
        let scratch = *self.exit_state.lock();
        let generation = memory.generation();
        let memory_changed = self.memory_generation.load(Ordering::Acquire) != generation;

        trace!(
            "{:?} enter: commit {:?} wanted {:?} event {:?}",
            self.id,
            page.commit_mask(),
            page.wanted(),
            event
        );
        let raw = machine.backend().enter(
            self.id,
            &mut EntryContext {
                comm: &mut *page,
                layout,
                memory: &memory,
                memory_changed,
                exit_state: &scratch,
                stop: StopToken::new(&self.stop),
            },
        );
        self.memory_generation.store(generation, Ordering::Release);
        drop(memory);

        page.finish_exit();
        // Whatever the backend left in the slot, the queued event is the one
        // that was not delivered.
        let undelivered = page.withdraw_event().and(event);
        let dropped = undelivered.and_then(|event| self.pending.requeue(event).err());
        if let Some(event) = dropped {
            warn!(
                "{:?} undelivered event {:?} superseded during the run",
                self.id, event
            );
        }

        let seq = self.exit_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let mut record = ExitRecord::dispatch(self.id, seq, &raw);
        record.dropped_event = dropped;

        let missing = page.wanted().difference(page.cached());
        if !missing.is_empty() && !record.reason.is_fatal() {
            error!(
                "{:?} backend left wanted groups {:?} uncached on {:?}",
                self.id, missing, record.reason
            );
            record.reason = VCpuExitReason::Invalid { raw: raw.code };
        }
        if record.reason == VCpuExitReason::Stopped {
            self.stop.store(false, Ordering::Release);
        }
        *self.exit_state.lock() = raw.exit_state;
        *self.comm.lock() = CommSlot::Bound(page);

        if record.reason.is_fatal() {
            error!("{:?} faulted: {:?}", self.id, record.reason);
            self.set_state(VCpuState::Faulted);
        } else {
            trace!("{:?} exit #{}: {:?}", self.id, seq, record.reason);
            self.set_state(VCpuState::Exited);
        }
        Ok(record)
    }

    /// Marks the last exit as reviewed.
    pub fn stop_after_exit(&self) -> AxResult {
        match self.transition_state(VCpuState::Exited, VCpuState::Stopped) {
            Ok(()) => Ok(()),
            Err(VCpuState::Invalid) => ax_err!(NotFound, format!("{:?} is destroyed", self.id)),
            Err(actual) => ax_err!(
                BadState,
                format!("{:?} has no exit to review, it is {:?}", self.id, actual)
            ),
        }
    }

    /// Moves a stopped or faulted vcpu to the destroyed tombstone.
    pub fn retire(&self) -> AxResult {
        let retired = self
            .transition_state(VCpuState::Stopped, VCpuState::Invalid)
            .or_else(|_| self.transition_state(VCpuState::Faulted, VCpuState::Invalid));
        match retired {
            Ok(()) => Ok(()),
            Err(VCpuState::Invalid) => ax_err!(NotFound, format!("{:?} is destroyed", self.id)),
            Err(actual) => ax_err!(
                ResourceBusy,
                format!("{:?} cannot be destroyed while {:?}", self.id, actual)
            ),
        }
    }
}
