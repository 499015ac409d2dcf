//! VM exit statistics.
//!
//! Every vcpu thread counts its VM exits and measures how long the hypervisor took to
//! handle each of them (from the VM exit to the next vm-entry). The results are kept
//! per physical CPU and per VM, and rendered into fixed-width text tables on request.

mod histogram;
mod report;

pub use histogram::{
    latency_level, ExitHistogram, PerCpuExitStats, MAX_VMEXIT_LEVEL, TOTAL_ARRAY_LEVEL,
    TOTAL_LEVEL,
};
pub use report::{
    clear_vmexit_info, vmexit_details_per_pcpu, vmexit_details_per_vm, vmexit_profile_per_pcpu,
    vmexit_profile_per_vm, ReportSource,
};
