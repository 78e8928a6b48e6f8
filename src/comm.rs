//! The comm page: vCPU state and the pending event shared between the
//! controller and the backend.
//!
//! The page is a wire format. Its layout is fixed by [`PROTOCOL_VERSION`]:
//!
//! | Offset | Size | Field          |
//! |--------|------|----------------|
//! | 0      | 4    | version        |
//! | 8      | 8    | `state_wanted` |
//! | 16     | 8    | `state_cached` |
//! | 24     | 8    | `state_commit` |
//! | 32     | 4    | `event_commit` |
//! | 40     | 16   | `event`        |
//! | 64     | 4032 | state payload  |
//!
//! Only one side touches the page at a time. The controller owns it while the
//! vCPU is not running, the backend owns it for the duration of one entry, and
//! the vCPU run-state enforces the hand-over. The page
//! therefore carries no lock of its own.
//!
//! [`PROTOCOL_VERSION`]: crate::PROTOCOL_VERSION

use alloc::boxed::Box;
use core::fmt;
use core::mem::{offset_of, size_of};
use core::ops::{BitAnd, BitOr, BitOrAssign};

use axerrno::{ax_err, AxResult};
use static_assertions::const_assert_eq;

use crate::caps::{CapabilityDescriptor, StateLayout};
use crate::event::RawEvent;

/// Size of a comm page in bytes.
pub const COMM_PAGE_SIZE: usize = 0x1000;

const COMM_HEADER_SIZE: usize = 64;

/// Size of the state payload area of a comm page.
pub const COMM_STATE_SIZE: usize = COMM_PAGE_SIZE - COMM_HEADER_SIZE;

/// A set of state groups, one bit per group of the [`StateLayout`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StateMask(u64);

impl StateMask {
    /// No group.
    pub const EMPTY: Self = Self(0);
    /// Every possible group.
    pub const ALL: Self = Self(u64::MAX);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// The mask holding only group `index`, or the empty mask if `index` is
    /// beyond the mask width.
    pub const fn bit(index: usize) -> Self {
        if index < u64::BITS as usize {
            Self(1 << index)
        } else {
            Self::EMPTY
        }
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every group of `other` is also in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Groups of `self` that are not in `other`.
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Iterates over the group indices in the mask, lowest first.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..u64::BITS as usize).filter(move |&i| self.0 & (1 << i) != 0)
    }
}

impl BitOr for StateMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StateMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for StateMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for StateMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateMask({:#b})", self.0)
    }
}

/// The shared state page of one vCPU.
#[repr(C, align(4096))]
pub struct CommPage {
    version: u32,
    _reserved0: u32,
    state_wanted: u64,
    state_cached: u64,
    state_commit: u64,
    event_commit: u32,
    _reserved1: u32,
    event: RawEvent,
    _reserved2: u64,
    state: [u8; COMM_STATE_SIZE],
}

const_assert_eq!(size_of::<CommPage>(), COMM_PAGE_SIZE);
const_assert_eq!(offset_of!(CommPage, state_wanted), 8);
const_assert_eq!(offset_of!(CommPage, state_cached), 16);
const_assert_eq!(offset_of!(CommPage, state_commit), 24);
const_assert_eq!(offset_of!(CommPage, event_commit), 32);
const_assert_eq!(offset_of!(CommPage, event), 40);
const_assert_eq!(offset_of!(CommPage, state), COMM_HEADER_SIZE);

impl CommPage {
    /// Allocates a zeroed page stamped with the descriptor's protocol version.
    pub fn new(caps: &CapabilityDescriptor) -> Box<Self> {
        Self::with_version(caps.version)
    }

    /// Allocates a zeroed page stamped with an explicit protocol version.
    pub fn with_version(version: u32) -> Box<Self> {
        Box::new(Self {
            version,
            _reserved0: 0,
            state_wanted: 0,
            state_cached: 0,
            state_commit: 0,
            event_commit: 0,
            _reserved1: 0,
            event: RawEvent::default(),
            _reserved2: 0,
            state: [0; COMM_STATE_SIZE],
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Groups the controller wants cached when the next run returns.
    pub fn wanted(&self) -> StateMask {
        StateMask(self.state_wanted)
    }

    pub fn set_wanted(&mut self, mask: StateMask) {
        self.state_wanted = mask.0;
    }

    /// Groups whose payload is currently valid.
    pub fn cached(&self) -> StateMask {
        StateMask(self.state_cached)
    }

    /// Groups written by the controller and not yet applied by the backend.
    pub fn commit_mask(&self) -> StateMask {
        StateMask(self.state_commit)
    }

    /// Whether an event is posted and not yet consumed by the backend.
    pub fn event_posted(&self) -> bool {
        self.event_commit != 0
    }

    /// Reads a cached group. Returns `None` when the group is not cached: its
    /// payload bytes are stale and must be fetched explicitly.
    pub fn read_state(&self, layout: &StateLayout, group: usize) -> Option<&[u8]> {
        let bytes = self.payload(layout, group)?;
        self.cached().contains(StateMask::bit(group)).then_some(bytes)
    }

    /// Writes the whole group and marks it for commit on the next entry.
    ///
    /// The written bytes are the most recent copy of the group, so the group
    /// is also marked cached.
    pub fn write_state(&mut self, layout: &StateLayout, group: usize, data: &[u8]) -> AxResult {
        let Some(dst) = self.payload_mut(layout, group) else {
            return ax_err!(InvalidInput, format!("no state group {}", group));
        };
        if dst.len() != data.len() {
            return ax_err!(
                InvalidInput,
                format!(
                    "state group {} is {} bytes, got {}",
                    group,
                    dst.len(),
                    data.len()
                )
            );
        }
        dst.copy_from_slice(data);
        self.state_commit |= StateMask::bit(group).0;
        self.state_cached |= StateMask::bit(group).0;
        Ok(())
    }

    /// Raw payload bytes of a group, regardless of the cached mask.
    ///
    /// Intended for backends, which own the page during an entry.
    pub fn payload(&self, layout: &StateLayout, group: usize) -> Option<&[u8]> {
        let g = layout.group(group)?;
        self.state.get(g.offset..g.offset + g.size)
    }

    /// Mutable raw payload bytes of a group. Intended for backends.
    pub fn payload_mut(&mut self, layout: &StateLayout, group: usize) -> Option<&mut [u8]> {
        let g = layout.group(group)?;
        self.state.get_mut(g.offset..g.offset + g.size)
    }

    /// Adds groups to the cached mask. Used by backends after populating them.
    pub fn mark_cached(&mut self, mask: StateMask) {
        self.state_cached |= mask.0;
    }

    /// Consumes the posted event, if any. Used by backends on injection.
    pub fn take_event(&mut self) -> Option<RawEvent> {
        if self.event_commit == 0 {
            return None;
        }
        self.event_commit = 0;
        Some(self.event)
    }

    pub(crate) fn post_event(&mut self, event: RawEvent) {
        self.event = event;
        self.event_commit = 1;
    }

    /// Withdraws an event the backend left unconsumed.
    pub(crate) fn withdraw_event(&mut self) -> Option<RawEvent> {
        self.take_event()
    }

    /// Entry step: previously cached payload goes stale once the guest runs.
    pub(crate) fn begin_entry(&mut self) {
        self.state_cached = 0;
    }

    /// Exit step: commits are applied by the time the backend returns.
    pub(crate) fn finish_exit(&mut self) {
        self.state_commit = 0;
    }
}

impl fmt::Debug for CommPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommPage")
            .field("version", &self.version)
            .field("wanted", &self.wanted())
            .field("cached", &self.cached())
            .field("commit", &self.commit_mask())
            .field("event_posted", &self.event_posted())
            .finish_non_exhaustive()
    }
}
