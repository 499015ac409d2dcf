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

//! AxVCpu run loop - the per-physical-CPU execution core of an ArceOS hypervisor.
//!
//! This crate provides the two entry procedures a physical CPU ever runs once it is
//! brought up: the vCPU dispatch loop, which repeatedly enters the guest and resolves
//! each VM exit, and the idle loop, which runs when the CPU owns no guest work.
//! Scheduling policy, the hardware vm-entry primitive and the exit handlers themselves
//! are delegated to the `AxSchedHal`, `AxRunLoopHal` and `AxArchVCpu` traits.
//!
//! # Features
//!
//! - Generic schedulable unit (`ThreadObject`) shared by vCPU and idle threads
//! - VM-exit dispatch loop with fatal (Zombie) and recoverable (#GP) error paths
//! - Cooperative idle loop with offline and VM-shutdown handling
//! - Single-waiter block/wake event primitive (`SchedEvent`)
//! - Per-CPU and per-VM exit-latency histograms with bounded text reports

#![no_std]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(test)]
extern crate std;

// Core modules
mod arch_vcpu; // Architecture-specific vm-entry/exit primitives
mod event; // Single-waiter scheduling event
mod exit; // Exit reason decoding and the dispatch table
mod hal; // Scheduler and platform contracts
mod idle; // Idle loop
mod runloop; // VM-exit dispatch loop
mod stats; // Exit-latency histograms and reports
mod thread; // Schedulable unit
mod vcpu; // VCpu state management
mod vm; // Guest VM bookkeeping

// Public API exports
pub use arch_vcpu::{AxArchVCpu, GuestVirtAddr};
pub use event::{SchedEvent, SchedEventKind};
pub use exit::{basic_exit_reason, VmExitHandler, VmExitTable, NR_VMX_EXIT_REASONS};
pub use hal::{AxRunLoopHal, AxSchedHal};
pub use runloop::RunLoop;
pub use stats::*;
pub use thread::{run_thread, SwitchHook, ThreadObject};
pub use vcpu::*;
pub use vm::GuestVm;
