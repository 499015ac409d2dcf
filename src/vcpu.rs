use alloc::sync::Arc;
use core::cell::UnsafeCell;

use axerrno::{ax_err, AxResult};
use spin::{Mutex, Once};

use super::{AxArchVCpu, GuestVm, SchedEvent, SchedEventKind, ThreadObject};

/// Index of the events every vcpu owns, see [`AxVCpu::event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuEvent {
    /// An I/O request handed to the device model has completed.
    Ioreq = 0,
    /// A virtual interrupt has been delivered.
    VirtualInterrupt = 1,
    /// A WBINVD emulation round has finished.
    SyncWbinvd = 2,
    /// A split-lock emulation round has finished.
    SplitLock = 3,
}

/// Number of events owned by a vcpu.
pub const VCPU_EVENT_NUM: usize = 4;

impl VCpuEvent {
    const fn kind(self) -> SchedEventKind {
        match self {
            VCpuEvent::Ioreq => SchedEventKind::Ioreq,
            VCpuEvent::VirtualInterrupt => SchedEventKind::VirtualInterrupt,
            VCpuEvent::SyncWbinvd => SchedEventKind::SyncWbinvd,
            VCpuEvent::SplitLock => SchedEventKind::SplitLock,
        }
    }
}

/// The constant part of `AxVCpu`.
struct AxVCpuInnerConst {
    /// The id of the vcpu.
    id: usize,
    /// The id of the physical CPU running this vcpu.
    pcpu_id: usize,
}

/// The run state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// The vcpu can be handed to vm-entry.
    Runnable = 0,
    /// An unrecoverable error happened. The vcpu never enters the guest again.
    Zombie = 1,
}

/// The mutable part of [`AxVCpu`].
struct AxVCpuInnerMut {
    /// The state of the vcpu.
    state: VCpuState,
    /// Raw exit reason of the last VM exit.
    exit_reason: u32,
    /// Number of VM exits since the vcpu was created.
    nr_exits: u64,
}

/// A virtual CPU with architecture-independent interface.
///
/// The architecture-specific operations are delegated to a struct implementing
/// [`AxArchVCpu`].
///
/// Note that:
/// - Only the dispatch loop running on the physical CPU owning the vcpu touches the
///   architecture-specific state, see [`AxVCpu::get_arch_vcpu`].
/// - The run state and counters may be read from any physical CPU.
pub struct AxVCpu<A: AxArchVCpu> {
    /// The constant part of the vcpu.
    inner_const: AxVCpuInnerConst,
    /// The mutable part of the vcpu.
    inner_mut: Mutex<AxVCpuInnerMut>,
    /// The VM this vcpu belongs to.
    vm: Arc<GuestVm>,
    /// The thread running the dispatch loop of this vcpu.
    thread: Once<Arc<ThreadObject>>,
    events: [SchedEvent; VCPU_EVENT_NUM],
    /// The architecture-specific state of the vcpu.
    ///
    /// `UnsafeCell` is used to allow interior mutability. Note that `RefCell` or `Mutex` is not suitable here
    /// because it's not possible to drop the guard when launching a vcpu.
    arch_vcpu: UnsafeCell<A>,
}

// SAFETY: `arch_vcpu` is only reachable through the unsafe `get_arch_vcpu`, whose callers
// guarantee they run in the dispatch loop of the vcpu. Everything else is synchronized.
unsafe impl<A: AxArchVCpu> Sync for AxVCpu<A> {}

impl<A: AxArchVCpu> AxVCpu<A> {
    /// Create a new [`AxVCpu`] of `vm`, run by `pcpu_id`.
    pub fn new(
        vm: Arc<GuestVm>,
        id: usize,
        pcpu_id: usize,
        arch_config: A::CreateConfig,
    ) -> AxResult<Self> {
        let (Ok(vm_id), Ok(vcpu_id)) = (u16::try_from(vm.id()), u16::try_from(id)) else {
            return ax_err!(
                InvalidInput,
                format!("VCpu[{}] of VM[{}] does not fit in an event tag", id, vm.id())
            );
        };
        let arch_vcpu = A::new(vm.id(), id, arch_config)?;
        let event = |kind: VCpuEvent| SchedEvent::new(kind.kind(), vm_id, vcpu_id);
        Ok(Self {
            inner_const: AxVCpuInnerConst { id, pcpu_id },
            inner_mut: Mutex::new(AxVCpuInnerMut {
                state: VCpuState::Runnable,
                exit_reason: 0,
                nr_exits: 0,
            }),
            events: [
                event(VCpuEvent::Ioreq),
                event(VCpuEvent::VirtualInterrupt),
                event(VCpuEvent::SyncWbinvd),
                event(VCpuEvent::SplitLock),
            ],
            vm,
            thread: Once::new(),
            arch_vcpu: UnsafeCell::new(arch_vcpu),
        })
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> usize {
        self.inner_const.id
    }

    /// Get the id of the physical CPU running this vcpu.
    pub const fn pcpu_id(&self) -> usize {
        self.inner_const.pcpu_id
    }

    /// Get the VM this vcpu belongs to.
    pub fn vm(&self) -> &Arc<GuestVm> {
        &self.vm
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.inner_mut.lock().state
    }

    /// Whether the vcpu has become a zombie.
    pub fn is_zombie(&self) -> bool {
        self.state() == VCpuState::Zombie
    }

    /// Raw exit reason of the last VM exit.
    pub fn exit_reason(&self) -> u32 {
        self.inner_mut.lock().exit_reason
    }

    /// Number of VM exits since the vcpu was created.
    pub fn nr_exits(&self) -> u64 {
        self.inner_mut.lock().nr_exits
    }

    /// Get one of the events owned by the vcpu.
    pub fn event(&self, event: VCpuEvent) -> &SchedEvent {
        &self.events[event as usize]
    }

    /// Get the thread running this vcpu, if it has been created.
    pub fn thread(&self) -> Option<&Arc<ThreadObject>> {
        self.thread.get()
    }

    /// Attach the thread running this vcpu. A vcpu has exactly one thread.
    pub fn set_thread(&self, thread: Arc<ThreadObject>) -> AxResult {
        let mut attached = false;
        self.thread.call_once(|| {
            attached = true;
            thread
        });
        if attached {
            Ok(())
        } else {
            ax_err!(BadState, format!("VCpu[{}] already has a thread", self.id()))
        }
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to `to`. If the current state is not `from`, return an error.
    ///
    /// The state is left unchanged if an error occurs (including the case that the current state is not `from`).
    ///
    /// The state will be set to `to` if the block is executed successfully.
    pub fn with_state_transition<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut inner_mut = self.inner_mut.lock();
        if from == VCpuState::Zombie && to != VCpuState::Zombie {
            ax_err!(BadState, "a zombie VCpu cannot be revived")
        } else if inner_mut.state != from {
            ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, inner_mut.state)
            )
        } else {
            let result = f()?;
            inner_mut.state = to;
            Ok(result)
        }
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// Turn the vcpu into a zombie, permanently excluding it from vm-entry.
    ///
    /// Fails if the vcpu is already a zombie, so the transition happens at most once.
    pub fn zombie(&self) -> AxResult {
        self.transition_state(VCpuState::Runnable, VCpuState::Zombie)
    }

    /// Get the architecture-specific vcpu.
    ///
    /// # Safety
    ///
    /// Must only be called from the dispatch loop of this vcpu, including the exit
    /// handlers it invokes. A reference obtained this way must not be used across a
    /// call that may obtain another one.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_arch_vcpu(&self) -> &mut A {
        unsafe { &mut *self.arch_vcpu.get() }
    }

    /// Record a VM exit with the given raw reason.
    pub(crate) fn record_exit(&self, exit_reason: u32) {
        let mut inner_mut = self.inner_mut.lock();
        inner_mut.exit_reason = exit_reason;
        inner_mut.nr_exits += 1;
    }
}
