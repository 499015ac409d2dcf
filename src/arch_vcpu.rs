use axerrno::AxResult;
use memory_addr::{def_usize_addr, def_usize_addr_formatter};

def_usize_addr! {
    /// Guest virtual address.
    pub type GuestVirtAddr;
}

def_usize_addr_formatter! {
    GuestVirtAddr = "GVA:{}";
}

/// Architecture-specific virtual CPU trait definition.
///
/// This trait isolates the hardware side of a vm-entry/vm-exit cycle from the dispatch
/// loop: the loop decides *when* to enter the guest, the implementor decides *how*.
///
/// All methods are called on the physical CPU that currently owns the vCPU.
pub trait AxArchVCpu: Sized + Send {
    /// Architecture-specific configuration for vCPU creation.
    type CreateConfig;

    /// Creates a new architecture-specific vCPU instance.
    fn new(vm_id: usize, vcpu_id: usize, config: Self::CreateConfig) -> AxResult<Self>;

    /// Process pending requests (queued virtual interrupts and exceptions, TLB flushes,
    /// ...) right before vm-entry.
    ///
    /// An error here is fatal for the vCPU (e.g. a triple fault).
    fn handle_pending_request(&mut self) -> AxResult;

    /// Enter the guest and run until a VM exit occurs.
    ///
    /// On success the exit reason register is populated, see [`AxArchVCpu::exit_reason`].
    /// An error means the vm-entry itself failed and is fatal for the vCPU.
    fn run(&mut self) -> AxResult;

    /// The raw exit reason of the last VM exit.
    fn exit_reason(&self) -> u32;

    /// The guest instruction pointer.
    fn rip(&self) -> GuestVirtAddr;

    /// Inject a general-protection fault into the guest.
    fn inject_gp(&mut self, err_code: u32) -> AxResult;

    /// Whether the local APIC is passed through to the guest.
    ///
    /// With pass-through enabled, external interrupts belong to the guest and the loop
    /// never masks them.
    fn is_lapic_pt_enabled(&self) -> bool {
        false
    }

    /// Profiling hook, called right before vm-entry.
    fn profiling_vmenter(&mut self) {}

    /// Profiling hook, called right after a VM exit with the raw exit reason available.
    fn profiling_pre_vmexit(&mut self) {}

    /// Profiling hook, called after the exit handler completed successfully.
    fn profiling_post_vmexit(&mut self) {}
}
