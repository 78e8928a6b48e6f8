use axerrno::{ax_err, AxResult};

use crate::addr::GuestPhysAddr;
use crate::event::Event;
use crate::id::VcpuId;
use crate::memory::MappingFlags;

#[allow(unused_imports)] // used in doc
use crate::AxVmmBackend;

/// Number of backend scratch words carried from one exit into the next entry.
pub const EXIT_STATE_WORDS: usize = 8;

/// Number of reason-specific payload words in a [`RawExit`].
pub const EXIT_PAYLOAD_WORDS: usize = 4;

// Raw exit codes. Existing values are part of the protocol and must never be
// renumbered; new reasons go in the architecture-extended range.
pub const EXIT_NONE: u64 = 0x0;
pub const EXIT_MEMORY: u64 = 0x1;
pub const EXIT_IO: u64 = 0x2;
pub const EXIT_REGISTER_ACCESS: u64 = 0x1001;
pub const EXIT_HALTED: u64 = 0x2000;
pub const EXIT_SHUTDOWN: u64 = 0x2001;
pub const EXIT_STOPPED: u64 = 0x2002;
pub const EXIT_INT_READY: u64 = 0x2003;
pub const EXIT_NMI_READY: u64 = 0x2004;
/// First code of the architecture-extended range.
pub const EXIT_ARCH_BASE: u64 = 0x1_0000_0000;
pub const EXIT_INVALID: u64 = u64::MAX;

const IO_DIRECTION_IN: u64 = 1;
const IO_WIDTH_SHIFT: u64 = 8;
const IO_WIDTH_MASK: u64 = 0xff << IO_WIDTH_SHIFT;

/// What [`AxVmmBackend::enter`] hands back when control returns.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawExit {
    /// One of the `EXIT_*` codes.
    pub code: u64,
    /// Reason-specific payload.
    pub payload: [u64; EXIT_PAYLOAD_WORDS],
    /// Backend scratch state, handed back on the next entry.
    pub exit_state: [u64; EXIT_STATE_WORDS],
}

impl RawExit {
    pub const fn new(code: u64) -> Self {
        Self {
            code,
            payload: [0; EXIT_PAYLOAD_WORDS],
            exit_state: [0; EXIT_STATE_WORDS],
        }
    }

    pub const fn with_payload(mut self, payload: [u64; EXIT_PAYLOAD_WORDS]) -> Self {
        self.payload = payload;
        self
    }

    pub const fn with_exit_state(mut self, exit_state: [u64; EXIT_STATE_WORDS]) -> Self {
        self.exit_state = exit_state;
        self
    }

    /// A guest memory access that needs the controller.
    pub fn memory(gpa: GuestPhysAddr, access: MappingFlags) -> Self {
        let payload = [gpa.as_usize() as u64, access.bits() as u64, 0, 0];
        Self::new(EXIT_MEMORY).with_payload(payload)
    }

    /// A port I/O access. Port I/O is at most four bytes wide, so a
    /// [`AccessWidth::Qword`] access is rejected.
    pub fn io(
        port: u16,
        direction: IoDirection,
        width: AccessWidth,
        data: u64,
    ) -> AxResult<Self> {
        if width == AccessWidth::Qword {
            return ax_err!(InvalidInput, "port I/O cannot be 8 bytes wide");
        }
        let mut flags = (width.size() as u64) << IO_WIDTH_SHIFT;
        if direction == IoDirection::In {
            flags |= IO_DIRECTION_IN;
        }
        Ok(Self::new(EXIT_IO).with_payload([port as u64, flags, data, 0]))
    }

    /// An access to a register owned by the other side (MSR, CSR, system register).
    pub fn register_access(index: u64, op: RegisterOp) -> Self {
        let (kind, value) = match op {
            RegisterOp::Read => (0, 0),
            RegisterOp::Write { value } => (1, value),
        };
        Self::new(EXIT_REGISTER_ACCESS).with_payload([kind, index, value, 0])
    }
}

/// Width of an I/O access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
    Qword,
}

impl AccessWidth {
    /// Size of the access in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }

    pub const fn from_size(size: usize) -> Option<Self> {
        match size {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            8 => Some(Self::Qword),
            _ => None,
        }
    }
}

/// Direction of a port I/O access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoDirection {
    /// The guest reads from the port.
    In,
    /// The guest writes to the port.
    Out,
}

/// A register access trapped to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterOp {
    Read,
    Write { value: u64 },
}

/// Why control returned from the backend.
///
/// The set is closed. Architectures extend it only through
/// [`VCpuExitReason::ArchExtended`] codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuExitReason {
    /// The guest accessed unmapped or protected guest physical memory.
    Memory {
        gpa: GuestPhysAddr,
        access: MappingFlags,
    },
    /// The guest performed port I/O.
    ///
    /// For [`IoDirection::Out`], `data` holds the value written.
    Io {
        port: u16,
        direction: IoDirection,
        width: AccessWidth,
        data: u64,
    },
    /// The guest accessed a register whose handling crosses the domain boundary.
    RegisterAccess { index: u64, op: RegisterOp },
    /// The guest can now accept an external interrupt.
    InterruptWindowReady,
    /// The guest can now accept an NMI.
    NmiWindowReady,
    /// The vCPU halted.
    Halted,
    /// The guest requested or triggered a shutdown.
    Shutdown,
    /// A stop request forced the exit.
    Stopped,
    /// An architecture-specific reason.
    ArchExtended {
        code: u64,
        payload: [u64; EXIT_PAYLOAD_WORDS],
    },
    /// The backend returned something outside the protocol.
    ///
    /// Never produced by a correct backend. The vCPU is faulted when it is
    /// observed.
    Invalid { raw: u64 },
}

impl VCpuExitReason {
    /// Whether the reason signals a backend defect.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }

    /// Decodes a raw exit. Unknown codes and malformed payloads decode to
    /// [`VCpuExitReason::Invalid`].
    pub fn decode(raw: &RawExit) -> Self {
        let invalid = Self::Invalid { raw: raw.code };
        let p = &raw.payload;
        match raw.code {
            EXIT_MEMORY => match MappingFlags::from_bits(p[1] as usize) {
                Some(access) if !access.is_empty() => Self::Memory {
                    gpa: GuestPhysAddr::from_usize(p[0] as usize),
                    access,
                },
                _ => invalid,
            },
            EXIT_IO => {
                let Ok(port) = u16::try_from(p[0]) else {
                    return invalid;
                };
                if p[1] & !(IO_DIRECTION_IN | IO_WIDTH_MASK) != 0 {
                    return invalid;
                }
                let size = ((p[1] & IO_WIDTH_MASK) >> IO_WIDTH_SHIFT) as usize;
                let width = match AccessWidth::from_size(size) {
                    Some(width) if width != AccessWidth::Qword => width,
                    _ => return invalid,
                };
                let direction = if p[1] & IO_DIRECTION_IN != 0 {
                    IoDirection::In
                } else {
                    IoDirection::Out
                };
                Self::Io {
                    port,
                    direction,
                    width,
                    data: p[2],
                }
            }
            EXIT_REGISTER_ACCESS => match p[0] {
                0 => Self::RegisterAccess {
                    index: p[1],
                    op: RegisterOp::Read,
                },
                1 => Self::RegisterAccess {
                    index: p[1],
                    op: RegisterOp::Write { value: p[2] },
                },
                _ => invalid,
            },
            EXIT_HALTED => Self::Halted,
            EXIT_SHUTDOWN => Self::Shutdown,
            EXIT_STOPPED => Self::Stopped,
            EXIT_INT_READY => Self::InterruptWindowReady,
            EXIT_NMI_READY => Self::NmiWindowReady,
            code if (EXIT_ARCH_BASE..EXIT_INVALID).contains(&code) => Self::ArchExtended {
                code,
                payload: raw.payload,
            },
            _ => invalid,
        }
    }
}

/// The self-describing record produced by every run that returns.
///
/// Owned by the controller until the next run of the same vCPU, which
/// produces a record with a larger `seq`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    /// The vCPU that exited.
    pub vcpu: VcpuId,
    /// Per-vCPU sequence number, starting at 1.
    pub seq: u64,
    pub reason: VCpuExitReason,
    /// Backend scratch state. Fed back to the backend on the next entry.
    pub exit_state: [u64; EXIT_STATE_WORDS],
    /// An event the backend did not deliver and that could not be requeued
    /// because a newer event was queued during the run.
    pub dropped_event: Option<Event>,
}

impl ExitRecord {
    /// Builds the one record for a returned run.
    pub(crate) fn dispatch(vcpu: VcpuId, seq: u64, raw: &RawExit) -> Self {
        Self {
            vcpu,
            seq,
            reason: VCpuExitReason::decode(raw),
            exit_state: raw.exit_state,
            dropped_event: None,
        }
    }
}
