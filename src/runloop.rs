use alloc::{sync::Arc, vec::Vec};

use axerrno::{AxError, AxResult};

use crate::{
    exit::{basic_exit_reason, VmExitTable},
    hal::AxRunLoopHal,
    stats::{self, ExitHistogram, PerCpuExitStats},
    thread::ThreadObject,
    vcpu::{AxVCpu, VCpuEvent},
    AxArchVCpu, GuestVm,
};

/// The execution core shared by all physical CPUs.
///
/// Holds the platform/scheduler contract, the exit dispatch table and the per-CPU exit
/// statistics, and provides the entry procedures of vcpu threads and idle threads.
pub struct RunLoop<H: AxRunLoopHal, A: AxArchVCpu> {
    pub(crate) hal: Arc<H>,
    exit_table: VmExitTable<A>,
    pub(crate) cpu_stats: PerCpuExitStats,
}

impl<H, A> RunLoop<H, A>
where
    H: AxRunLoopHal + 'static,
    A: AxArchVCpu + 'static,
{
    /// Create the run loop of a system with up to `max_cpus` physical CPUs.
    pub fn new(hal: Arc<H>, exit_table: VmExitTable<A>, max_cpus: usize) -> Self {
        Self {
            hal,
            exit_table,
            cpu_stats: PerCpuExitStats::new(max_cpus),
        }
    }

    pub fn hal(&self) -> &Arc<H> {
        &self.hal
    }

    /// Exit statistics of every physical CPU.
    pub fn cpu_stats(&self) -> &PerCpuExitStats {
        &self.cpu_stats
    }

    /// Create the thread running the dispatch loop of `vcpu` and attach it to the vcpu.
    ///
    /// The thread is named `vcpu<N>` and owned by the physical CPU of the vcpu. It only
    /// keeps a weak reference to the vcpu, the VM owns it.
    pub fn create_vcpu_thread(
        self: &Arc<Self>,
        vcpu: &Arc<AxVCpu<A>>,
    ) -> AxResult<Arc<ThreadObject>> {
        let run_loop = Arc::downgrade(self);
        let weak_vcpu = Arc::downgrade(vcpu);
        let thread = Arc::new(ThreadObject::new(
            format!("vcpu{}", vcpu.id()),
            vcpu.pcpu_id(),
            move |_| {
                if let (Some(run_loop), Some(vcpu)) = (run_loop.upgrade(), weak_vcpu.upgrade()) {
                    run_loop.vcpu_thread(&vcpu);
                }
            },
        ));
        vcpu.set_thread(thread.clone())?;
        Ok(thread)
    }

    /// The entry procedure of a vcpu thread: enter the guest, handle the VM exit, repeat.
    ///
    /// Returns only once the vcpu has become a zombie and the scheduler resumed its
    /// thread anyway.
    pub fn vcpu_thread(&self, vcpu: &AxVCpu<A>) {
        let hal = &*self.hal;
        let pcpu_id = vcpu.pcpu_id();
        let mut basic_reason: u16 = 0;
        let mut vmexit_begin: Option<u64> = None;

        loop {
            // SAFETY: this is the dispatch loop of `vcpu`.
            let lapic_pt = unsafe { vcpu.get_arch_vcpu() }.is_lapic_pt_enabled();
            if !lapic_pt {
                hal.irq_disable();
            }

            // Interrupts stay masked from here up to vm-entry.
            if hal.need_reschedule(pcpu_id) {
                hal.schedule();
            }

            if vcpu.is_zombie() {
                debug!("VCpu[{}] is a zombie, leaving the dispatch loop", vcpu.id());
                if !lapic_pt {
                    hal.irq_enable();
                }
                return;
            }

            // SAFETY: this is the dispatch loop of `vcpu`, and `arch_vcpu` is not used once
            // the exit handler runs.
            let arch_vcpu = unsafe { vcpu.get_arch_vcpu() };
            if let Err(err) = arch_vcpu.handle_pending_request() {
                // Fatal error happened (e.g. triple fault). Stop the vcpu running.
                self.zombie_vcpu(vcpu, "handling pending request", err);
                continue;
            }

            vcpu.event(VCpuEvent::VirtualInterrupt).reset();
            arch_vcpu.profiling_vmenter();

            if let Some(begin) = vmexit_begin {
                let delta = hal.current_ticks().saturating_sub(begin);
                let us = hal.ticks_to_us(delta);
                let cpu_stats = self.cpu_stats.get(pcpu_id);
                record_latency(cpu_stats.as_deref(), vcpu.vm(), basic_reason, delta, us);
            }

            trace!("VCpu[{}] vm-entry at {:?}", vcpu.id(), arch_vcpu.rip());
            if let Err(err) = arch_vcpu.run() {
                self.zombie_vcpu(vcpu, "resume", err);
                continue;
            }

            let raw_reason = arch_vcpu.exit_reason();
            basic_reason = basic_exit_reason(raw_reason);
            trace!(
                "VCpu[{}] vm-exit {:#x} at {:?}",
                vcpu.id(),
                basic_reason,
                arch_vcpu.rip()
            );

            vmexit_begin = Some(hal.current_ticks());
            // Looked up on every exit, the CPU may be brought up after the thread started.
            if let Some(stats) = self.cpu_stats.get(pcpu_id) {
                stats.record_exit(basic_reason);
            }
            vcpu.vm().exit_stats().record_exit(basic_reason);
            vcpu.record_exit(raw_reason);

            arch_vcpu.profiling_pre_vmexit();

            if !lapic_pt {
                hal.irq_enable();
            }

            if let Err(err) = self.exit_table.dispatch(vcpu, basic_reason) {
                error!(
                    "VCpu[{}] dispatch VM exit handler failed for reason {:#x}: {:?}",
                    vcpu.id(),
                    basic_reason,
                    err
                );
                // SAFETY: the exit handler has returned.
                if let Err(err) = unsafe { vcpu.get_arch_vcpu() }.inject_gp(0) {
                    self.zombie_vcpu(vcpu, "#GP injection", err);
                }
                continue;
            }

            // SAFETY: the exit handler has returned.
            unsafe { vcpu.get_arch_vcpu() }.profiling_post_vmexit();
        }
    }

    /// Turn `vcpu` into a zombie and make sure the scheduler never resumes its thread.
    fn zombie_vcpu(&self, vcpu: &AxVCpu<A>, stage: &str, err: AxError) {
        if vcpu.zombie().is_ok() {
            error!(
                "VCpu[{}] of VM[{}] {} failed: {:?}, vcpu is now a zombie",
                vcpu.id(),
                vcpu.vm().id(),
                stage,
                err
            );
            if let Some(thread) = vcpu.thread() {
                self.hal.sleep_thread(thread);
            }
        }
    }

    /// Render the per-CPU exit profile, see [`stats::vmexit_profile_per_pcpu`].
    pub fn vmexit_profile_per_pcpu(&self, buf: &mut [u8]) -> AxResult<usize> {
        stats::vmexit_profile_per_pcpu(&self.cpu_stats, &*self.hal, buf)
    }

    /// Render the per-CPU latency details, see [`stats::vmexit_details_per_pcpu`].
    pub fn vmexit_details_per_pcpu(&self, buf: &mut [u8]) -> AxResult<usize> {
        stats::vmexit_details_per_pcpu(&self.cpu_stats, &*self.hal, buf)
    }

    /// Render the per-VM exit profile, see [`stats::vmexit_profile_per_vm`].
    pub fn vmexit_profile_per_vm(&self, vms: &[Arc<GuestVm>], buf: &mut [u8]) -> AxResult<usize> {
        stats::vmexit_profile_per_vm(vms, &*self.hal, buf)
    }

    /// Render the per-VM latency details, see [`stats::vmexit_details_per_vm`].
    pub fn vmexit_details_per_vm(&self, vms: &[Arc<GuestVm>], buf: &mut [u8]) -> AxResult<usize> {
        stats::vmexit_details_per_vm(vms, &*self.hal, buf)
    }

    /// Reset the exit statistics of every online CPU and every powered-on VM.
    pub fn clear_vmexit_info(&self, vms: &[Arc<GuestVm>]) {
        stats::clear_vmexit_info(&self.cpu_stats, vms);
    }

    /// Ids of the physical CPUs whose exit statistics are live.
    pub fn online_cpus(&self) -> Vec<usize> {
        self.cpu_stats.online().into_iter().map(|(cpu, _)| cpu).collect()
    }

    /// Bring up the exit statistics of `pcpu_id`.
    pub(crate) fn bring_up_cpu(&self, pcpu_id: usize) -> AxResult {
        match self.cpu_stats.bring_up(pcpu_id) {
            Ok(_) | Err(AxError::AlreadyExists) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn record_latency(
    cpu_stats: Option<&ExitHistogram>,
    vm: &GuestVm,
    reason: u16,
    ticks: u64,
    us: u64,
) {
    if let Some(stats) = cpu_stats {
        stats.record_latency(reason, ticks, us);
    }
    vm.exit_stats().record_latency(reason, ticks, us);
}
