// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVmm - the control plane of an ArceOS hypervisor.
//!
//! This crate owns machines, their guest memory maps and their virtual CPUs,
//! and moves vCPU state between the controller and an architecture backend
//! through a versioned, page-sized comm page. Guest code itself is executed by
//! implementations of the [`AxVmmBackend`] trait.
//!
//! # Features
//!
//! - Capability registry that every creation request is checked against
//! - Generation-tagged machine and vCPU identifiers
//! - Lock-free vCPU run-state machine (Stopped → Running → Exited → Stopped)
//! - Comm page protocol with wanted/cached/commit state masks
//! - Single-slot event injection with overwrite reporting
//! - Closed, versioned exit reason set decoded into per-vCPU exit records
//!
//! # Errors
//!
//! Every fallible operation returns [`AxResult`](axerrno::AxResult):
//!
//! | Condition                             | `AxError`       |
//! |---------------------------------------|-----------------|
//! | a capability limit would be exceeded  | `NoMemory`      |
//! | unknown or stale identifier           | `NotFound`      |
//! | object in use, vCPU already running   | `ResourceBusy`  |
//! | exit not yet acknowledged, or faulted | `BadState`      |
//! | comm page already bound               | `AlreadyExists` |
//! | malformed region or config payload    | `InvalidInput`  |
//! | comm page of another protocol version | `InvalidData`   |
//! | no backend for the requested arch     | `Unsupported`   |

#![no_std]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

#[cfg(test)]
extern crate std;

// Core modules
mod addr; // Guest and host address types
mod backend; // Architecture backend trait and entry context
mod caps; // Capability registry and comm page state layout
mod comm; // Comm page wire format
mod event; // Event encoding and the pending slot
mod exit; // Exit codes, reason decoding and exit records
mod id; // Generation-tagged identifiers
mod machine; // Machines and the machine manager
mod memory; // Guest memory map
mod vcpu; // VCpu run-state machine and entry sequence
mod vmm; // Controller-facing surface

// Public API exports
pub use addr::{GuestPhysAddr, GuestPhysAddrRange, HostVirtAddr, GUEST_PAGE_SIZE};
pub use backend::{AxVmmBackend, EntryContext, StopToken};
pub use caps::{
    CapabilityConfig, CapabilityDescriptor, CapabilityRegistry, StateGroup, StateLayout,
    MAX_STATE_GROUPS, PROTOCOL_VERSION,
};
pub use comm::{CommPage, StateMask, COMM_PAGE_SIZE, COMM_STATE_SIZE};
pub use event::{
    Event, EventKind, InjectOutcome, RawEvent, EVENT_KIND_EXCEPTION, EVENT_KIND_HW_INTERRUPT,
    EVENT_KIND_SW_INTERRUPT,
};
pub use exit::*; // Exit codes, raw exits and decoded reasons
pub use id::{MachineId, VcpuId};
pub use machine::MachineConfig;
pub use memory::{GuestMemoryMap, GuestMemoryRegion, MappingFlags, MemoryMapping};
pub use vcpu::VCpuState;
pub use vmm::AxVmm;
