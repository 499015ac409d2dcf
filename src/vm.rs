use core::sync::atomic::{AtomicBool, Ordering};

use crate::stats::ExitHistogram;

/// The part of a guest VM the run loop cares about.
///
/// Guest memory and device models live elsewhere; vcpus keep an `Arc` to their VM to
/// account their exits per VM.
pub struct GuestVm {
    id: usize,
    poweroff: AtomicBool,
    /// Shared by all vcpus of the VM, possibly running on different physical CPUs.
    exit_stats: ExitHistogram,
}

impl GuestVm {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            poweroff: AtomicBool::new(false),
            exit_stats: ExitHistogram::new(),
        }
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    pub fn is_poweroff(&self) -> bool {
        self.poweroff.load(Ordering::Acquire)
    }

    /// Mark the VM as powered off. Its statistics are no longer reported or cleared.
    pub fn set_poweroff(&self) {
        self.poweroff.store(true, Ordering::Release);
    }

    pub fn exit_stats(&self) -> &ExitHistogram {
        &self.exit_stats
    }
}
