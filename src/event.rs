//! Events queued for injection on the next vCPU entry.
//!
//! Each vCPU has a single pending slot. Queueing over an unconsumed event
//! replaces it and hands the replaced event back to the caller; same-type events
//! are never coalesced.

use spin::Mutex;

/// Wire value of [`EventKind::HardwareInterrupt`].
pub const EVENT_KIND_HW_INTERRUPT: u32 = 0;
/// Wire value of [`EventKind::SoftwareInterrupt`].
pub const EVENT_KIND_SW_INTERRUPT: u32 = 1;
/// Wire value of [`EventKind::Exception`].
pub const EVENT_KIND_EXCEPTION: u32 = 2;

const ERROR_CODE_VALID: u64 = 1 << 63;

/// What kind of event to inject, with its type-dependent payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// An external (hardware) interrupt.
    HardwareInterrupt {
        /// Delivery priority, interpreted by the backend's interrupt model.
        priority: u8,
    },
    /// A software interrupt.
    SoftwareInterrupt,
    /// An exception, optionally carrying an error code.
    Exception {
        /// Error code pushed by the exception, for vectors that define one.
        error_code: Option<u32>,
    },
}

/// A pending interrupt or exception for a vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub vector: u8,
    pub kind: EventKind,
}

impl Event {
    /// A hardware interrupt on `vector`.
    pub const fn interrupt(vector: u8, priority: u8) -> Self {
        Self {
            vector,
            kind: EventKind::HardwareInterrupt { priority },
        }
    }

    /// A software interrupt on `vector`.
    pub const fn software_interrupt(vector: u8) -> Self {
        Self {
            vector,
            kind: EventKind::SoftwareInterrupt,
        }
    }

    /// An exception on `vector`.
    pub const fn exception(vector: u8, error_code: Option<u32>) -> Self {
        Self {
            vector,
            kind: EventKind::Exception { error_code },
        }
    }

    /// Encodes the event into its comm page representation.
    pub fn to_raw(&self) -> RawEvent {
        let (kind, payload) = match self.kind {
            EventKind::HardwareInterrupt { priority } => (EVENT_KIND_HW_INTERRUPT, priority as u64),
            EventKind::SoftwareInterrupt => (EVENT_KIND_SW_INTERRUPT, 0),
            EventKind::Exception { error_code } => (
                EVENT_KIND_EXCEPTION,
                error_code.map_or(0, |code| ERROR_CODE_VALID | code as u64),
            ),
        };
        RawEvent {
            kind,
            vector: self.vector as u32,
            payload,
        }
    }

    /// Decodes a comm page event. Returns `None` for an unknown kind or a
    /// vector that does not fit in a byte.
    pub fn from_raw(raw: &RawEvent) -> Option<Self> {
        let vector = u8::try_from(raw.vector).ok()?;
        let kind = match raw.kind {
            EVENT_KIND_HW_INTERRUPT => EventKind::HardwareInterrupt {
                priority: raw.payload as u8,
            },
            EVENT_KIND_SW_INTERRUPT => EventKind::SoftwareInterrupt,
            EVENT_KIND_EXCEPTION => EventKind::Exception {
                error_code: (raw.payload & ERROR_CODE_VALID != 0).then_some(raw.payload as u32),
            },
            _ => return None,
        };
        Some(Self { vector, kind })
    }
}

/// The event slot of the comm page.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: u32,
    pub vector: u32,
    pub payload: u64,
}

/// Result of queueing an event.
#[must_use = "an overwritten event is dropped unless the caller handles it"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectOutcome {
    /// The slot was empty.
    Queued,
    /// The slot held an unconsumed event, which has been discarded.
    Overwritten(Event),
}

/// Single-slot hand-off between the controller and the thread inside `run`.
pub(crate) struct PendingEvent {
    slot: Mutex<Option<Event>>,
}

impl PendingEvent {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn set(&self, event: Event) -> InjectOutcome {
        match self.slot.lock().replace(event) {
            Some(previous) => InjectOutcome::Overwritten(previous),
            None => InjectOutcome::Queued,
        }
    }

    pub fn take(&self) -> Option<Event> {
        self.slot.lock().take()
    }

    pub fn peek(&self) -> Option<Event> {
        *self.slot.lock()
    }

    /// Puts an undelivered event back. Fails, returning the event, when a newer
    /// one was queued in the meantime.
    pub fn requeue(&self, event: Event) -> Result<(), Event> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(event);
        }
        *slot = Some(event);
        Ok(())
    }
}
