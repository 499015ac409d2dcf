use alloc::sync::Arc;

use crate::thread::ThreadObject;

/// The scheduler contract the run loop relies on.
///
/// The scheduling policy itself (pick-next, priorities, load balancing) lives behind
/// this trait; the run loop only asks whether to yield and yields.
pub trait AxSchedHal: Send + Sync {
    /// Whether a reschedule has been requested on the given physical CPU.
    fn need_reschedule(&self, pcpu_id: usize) -> bool;

    /// Yield the calling thread to the scheduler.
    ///
    /// The scheduler may switch the calling thread out and another one in. Returns once
    /// the calling thread is resumed. A thread marked by [`AxSchedHal::sleep_thread`] is
    /// not resumed before it is woken by [`AxSchedHal::wake_thread`].
    fn schedule(&self);

    /// Number of reschedules the scheduler has performed on the given physical CPU.
    fn resched_times(&self, pcpu_id: usize) -> u64;

    /// Get the thread currently running on the calling physical CPU.
    fn current_thread(&self) -> Arc<ThreadObject>;

    /// Install `obj` as the thread currently running on the calling physical CPU.
    fn set_current_thread(&self, obj: &Arc<ThreadObject>);

    /// Mark `obj` as blocked. It stays runnable until the next [`AxSchedHal::schedule`].
    fn sleep_thread(&self, obj: &Arc<ThreadObject>);

    /// Make a blocked `obj` runnable again. May be called from any physical CPU.
    fn wake_thread(&self, obj: &Arc<ThreadObject>);
}

/// The platform primitives the run loop and the idle loop rely on.
pub trait AxRunLoopHal: AxSchedHal {
    /// Unmask external interrupts on the current physical CPU.
    fn irq_enable(&self);

    /// Mask external interrupts on the current physical CPU.
    fn irq_disable(&self);

    /// Enter a low-power state until the next interrupt arrives.
    fn cpu_do_idle(&self);

    /// Whether the given physical CPU has been requested to go offline.
    fn need_offline(&self, pcpu_id: usize) -> bool;

    /// Power down the given physical CPU.
    ///
    /// Real implementations never return. The idle loop does not resume after calling it
    /// either way.
    fn cpu_dead(&self, pcpu_id: usize);

    /// Whether a VM shutdown has been assigned to the idle thread of the given CPU.
    fn need_shutdown_vm(&self, pcpu_id: usize) -> bool;

    /// Perform the VM shutdown assigned to the given CPU.
    fn shutdown_vm_from_idle(&self, pcpu_id: usize);

    /// Read the current value of the time stamp counter.
    fn current_ticks(&self) -> u64;

    /// Convert a tick count to microseconds.
    fn ticks_to_us(&self, ticks: u64) -> u64;
}
