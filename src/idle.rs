use alloc::sync::Arc;

use axerrno::AxResult;

use crate::{
    hal::AxRunLoopHal,
    runloop::RunLoop,
    thread::{run_thread, ThreadObject},
    AxArchVCpu,
};

impl<H, A> RunLoop<H, A>
where
    H: AxRunLoopHal + 'static,
    A: AxArchVCpu + 'static,
{
    /// The entry procedure of the idle thread of `pcpu_id`.
    ///
    /// Each round does exactly one thing, in this order of priority: yield to the
    /// scheduler, power the CPU down, shut down a VM on behalf of another CPU, or wait
    /// for an interrupt. Returns only after the CPU has been powered down.
    pub fn default_idle(&self, pcpu_id: usize) {
        let hal = &*self.hal;
        loop {
            if hal.need_reschedule(pcpu_id) {
                hal.schedule();
            } else if hal.need_offline(pcpu_id) {
                info!("CPU {} going offline", pcpu_id);
                self.cpu_stats.release(pcpu_id);
                hal.cpu_dead(pcpu_id);
                return;
            } else if hal.need_shutdown_vm(pcpu_id) {
                hal.shutdown_vm_from_idle(pcpu_id);
            } else {
                hal.irq_enable();
                hal.cpu_do_idle();
                hal.irq_disable();
            }
        }
    }

    /// Create the idle thread of `pcpu_id`, named `idle<N>`, without switch hooks.
    pub fn create_idle_thread(self: &Arc<Self>, pcpu_id: usize) -> Arc<ThreadObject> {
        let run_loop = Arc::downgrade(self);
        Arc::new(ThreadObject::new(
            format!("idle{}", pcpu_id),
            pcpu_id,
            move |obj| {
                if let Some(run_loop) = run_loop.upgrade() {
                    run_loop.default_idle(obj.pcpu_id());
                }
            },
        ))
    }

    /// Bring up `pcpu_id` and turn the calling context into its idle thread.
    ///
    /// Returns once the CPU has gone offline.
    pub fn run_idle_thread(self: &Arc<Self>, pcpu_id: usize) -> AxResult {
        self.bring_up_cpu(pcpu_id)?;
        let idle = self.create_idle_thread(pcpu_id);
        info!("CPU {} running {}", pcpu_id, idle.name());
        run_thread(&*self.hal, &idle);
        Ok(())
    }
}
