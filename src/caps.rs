use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};

use crate::comm::{StateMask, COMM_STATE_SIZE};

/// Version of the comm page and exit record protocol.
///
/// Any change to the [`CommPage`](crate::CommPage) layout or to the raw exit
/// codes must bump this value.
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of state groups a mask can describe.
pub const MAX_STATE_GROUPS: usize = u64::BITS as usize;

/// One register/state group inside the comm page payload area.
///
/// Group `i` of a [`StateLayout`] is bit `i` of every comm page mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateGroup {
    /// Byte offset of the group inside the payload area.
    pub offset: usize,
    /// Size of the group in bytes.
    pub size: usize,
}

/// Where each state group lives in the comm page payload.
///
/// The layout is owned by the backend architecture and only transported by
/// this crate; nothing here assumes a particular register file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateLayout {
    groups: Vec<StateGroup>,
}

impl StateLayout {
    /// Creates a layout from explicit group boundaries. Checked when the
    /// owning [`CapabilityRegistry`] is built.
    pub fn new(groups: Vec<StateGroup>) -> Self {
        Self { groups }
    }

    /// Lays out groups of the given sizes back to back, each 8-byte aligned.
    pub fn packed(sizes: &[usize]) -> Self {
        let mut offset = 0;
        let groups = sizes
            .iter()
            .map(|&size| {
                let group = StateGroup { offset, size };
                offset = (offset + size + 7) & !7;
                group
            })
            .collect();
        Self { groups }
    }

    /// All groups, in bit order.
    pub fn groups(&self) -> &[StateGroup] {
        &self.groups
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether the layout has no groups at all.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The group described by bit `index`.
    pub fn group(&self, index: usize) -> Option<StateGroup> {
        self.groups.get(index).copied()
    }

    /// The mask covering every group of this layout.
    pub fn all(&self) -> StateMask {
        match 1u64.checked_shl(self.groups.len() as u32) {
            Some(bit) if self.groups.len() < MAX_STATE_GROUPS => StateMask::from_bits(bit - 1),
            _ => StateMask::ALL,
        }
    }

    fn validate(&self) -> AxResult {
        if self.groups.len() > MAX_STATE_GROUPS {
            return ax_err!(
                InvalidInput,
                format!("{} state groups exceed the mask width", self.groups.len())
            );
        }
        for (index, group) in self.groups.iter().enumerate() {
            let end = group.offset.checked_add(group.size);
            if group.size == 0 || end.map_or(true, |end| end > COMM_STATE_SIZE) {
                return ax_err!(
                    InvalidInput,
                    format!("state group {} does not fit the comm page: {:?}", index, group)
                );
            }
        }
        let mut sorted: Vec<_> = self.groups.clone();
        sorted.sort_by_key(|group| group.offset);
        for pair in sorted.windows(2) {
            if pair[0].offset + pair[0].size > pair[1].offset {
                return ax_err!(
                    InvalidInput,
                    format!("state groups overlap: {:?} and {:?}", pair[0], pair[1])
                );
            }
        }
        Ok(())
    }
}

/// Limits and layout requested when building a [`CapabilityRegistry`].
#[derive(Clone, Debug)]
pub struct CapabilityConfig {
    /// Maximum number of live machines.
    pub max_machines: usize,
    /// Maximum number of live vCPUs in one machine.
    pub max_vcpus_per_machine: usize,
    /// Maximum number of guest bytes mapped into one machine.
    pub max_guest_memory: u64,
    /// Largest payload accepted by a machine configuration operation.
    pub max_machine_config_size: usize,
    /// Architecture capability mask, opaque to this crate.
    pub arch_caps: u64,
    /// Comm page state groups.
    pub state_layout: StateLayout,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            max_machines: 128,
            max_vcpus_per_machine: 256,
            max_guest_memory: 128 << 30,
            max_machine_config_size: 4096,
            arch_caps: 0,
            state_layout: StateLayout::default(),
        }
    }
}

/// The immutable description of what this instance supports.
#[derive(Clone, Debug)]
pub struct CapabilityDescriptor {
    /// See [`PROTOCOL_VERSION`].
    pub version: u32,
    pub max_machines: usize,
    pub max_vcpus_per_machine: usize,
    pub max_guest_memory: u64,
    pub max_machine_config_size: usize,
    pub arch_caps: u64,
    pub state_layout: StateLayout,
}

/// The single source of truth for the limits the other components enforce.
///
/// Built once and handed out by reference; several independent registries
/// may coexist (one per [`AxVmm`](crate::AxVmm)).
pub struct CapabilityRegistry {
    descriptor: CapabilityDescriptor,
}

impl CapabilityRegistry {
    /// Validates `config` and freezes it into a descriptor.
    pub fn new(config: CapabilityConfig) -> AxResult<Self> {
        if config.max_machines == 0 || config.max_machines > u32::MAX as usize {
            return ax_err!(InvalidInput, "max_machines out of range");
        }
        if config.max_vcpus_per_machine == 0 || config.max_vcpus_per_machine > u32::MAX as usize
        {
            return ax_err!(InvalidInput, "max_vcpus_per_machine out of range");
        }
        if config.max_guest_memory == 0 {
            return ax_err!(InvalidInput, "max_guest_memory must not be zero");
        }
        if config.max_machine_config_size == 0 {
            return ax_err!(InvalidInput, "max_machine_config_size must not be zero");
        }
        config.state_layout.validate()?;

        debug!(
            "capability registry: v{}, {} machines, {} vcpus/machine, {:#x} bytes, {} state groups",
            PROTOCOL_VERSION,
            config.max_machines,
            config.max_vcpus_per_machine,
            config.max_guest_memory,
            config.state_layout.len()
        );
        Ok(Self {
            descriptor: CapabilityDescriptor {
                version: PROTOCOL_VERSION,
                max_machines: config.max_machines,
                max_vcpus_per_machine: config.max_vcpus_per_machine,
                max_guest_memory: config.max_guest_memory,
                max_machine_config_size: config.max_machine_config_size,
                arch_caps: config.arch_caps,
                state_layout: config.state_layout,
            },
        })
    }

    /// Returns the descriptor. Never fails and has no side effects.
    pub fn query_capability(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Shorthand for the comm page state layout.
    pub fn state_layout(&self) -> &StateLayout {
        &self.descriptor.state_layout
    }
}
