use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use axerrno::{ax_err, AxResult};
use spin::RwLock;

use crate::exit::NR_VMX_EXIT_REASONS;

/// Number of latency buckets per exit reason.
pub const MAX_VMEXIT_LEVEL: usize = 14;
/// Latency buckets plus the lifetime total slot.
pub const TOTAL_ARRAY_LEVEL: usize = MAX_VMEXIT_LEVEL + 1;
/// Index of the lifetime total slot.
pub const TOTAL_LEVEL: usize = TOTAL_ARRAY_LEVEL - 1;

/// Select the latency bucket for a VM exit handled in `us` microseconds.
///
/// Bucket 0 holds sub-microsecond latencies, bucket `n` holds `[2^(n-1), 2^n)` us, the
/// last bucket holds everything above.
pub const fn latency_level(us: u64) -> usize {
    if us == 0 {
        return 0;
    }
    let level = (u64::BITS - us.leading_zeros()) as usize;
    if level >= MAX_VMEXIT_LEVEL {
        MAX_VMEXIT_LEVEL - 1
    } else {
        level
    }
}

/// Exit counters and latency histogram, indexed by basic exit reason.
///
/// Every cell is atomic: the per-VM instance is updated concurrently by vcpus of the
/// same VM running on different physical CPUs.
pub struct ExitHistogram {
    count: [[AtomicU64; TOTAL_ARRAY_LEVEL]; NR_VMX_EXIT_REASONS],
    /// Accumulated handling time in ticks.
    time: [AtomicU64; NR_VMX_EXIT_REASONS],
    /// Max observed handling latency in microseconds.
    max_us: [AtomicU64; NR_VMX_EXIT_REASONS],
}

impl ExitHistogram {
    pub const fn new() -> Self {
        Self {
            count: [const { [const { AtomicU64::new(0) }; TOTAL_ARRAY_LEVEL] };
                NR_VMX_EXIT_REASONS],
            time: [const { AtomicU64::new(0) }; NR_VMX_EXIT_REASONS],
            max_us: [const { AtomicU64::new(0) }; NR_VMX_EXIT_REASONS],
        }
    }

    /// Count a VM exit with the given reason in the lifetime total.
    pub fn record_exit(&self, reason: u16) {
        if let Some(count) = self.count.get(usize::from(reason)) {
            count[TOTAL_LEVEL].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the handling latency of a VM exit with the given reason.
    pub fn record_latency(&self, reason: u16, ticks: u64, us: u64) {
        let reason = usize::from(reason);
        if reason >= NR_VMX_EXIT_REASONS {
            return;
        }
        self.count[reason][latency_level(us)].fetch_add(1, Ordering::Relaxed);
        self.time[reason].fetch_add(ticks, Ordering::Relaxed);
        self.max_us[reason].fetch_max(us, Ordering::Relaxed);
    }

    /// Number of exits with the given reason in the given level.
    ///
    /// `TOTAL_LEVEL` returns the lifetime total.
    pub fn count(&self, reason: u16, level: usize) -> u64 {
        self.count
            .get(usize::from(reason))
            .and_then(|levels| levels.get(level))
            .map_or(0, |cnt| cnt.load(Ordering::Relaxed))
    }

    /// Lifetime number of exits with the given reason.
    pub fn total(&self, reason: u16) -> u64 {
        self.count(reason, TOTAL_LEVEL)
    }

    /// Accumulated handling time of exits with the given reason, in ticks.
    pub fn time_ticks(&self, reason: u16) -> u64 {
        self.time
            .get(usize::from(reason))
            .map_or(0, |t| t.load(Ordering::Relaxed))
    }

    /// Max handling latency of exits with the given reason, in microseconds.
    pub fn max_latency_us(&self, reason: u16) -> u64 {
        self.max_us
            .get(usize::from(reason))
            .map_or(0, |t| t.load(Ordering::Relaxed))
    }

    /// Reset every counter to zero.
    pub fn clear(&self) {
        for levels in self.count.iter() {
            for cnt in levels.iter() {
                cnt.store(0, Ordering::Relaxed);
            }
        }
        for t in self.time.iter().chain(self.max_us.iter()) {
            t.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ExitHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-CPU exit histograms.
///
/// A slot is populated when its physical CPU is brought up and released when the CPU
/// goes offline. Only the owning CPU records into its histogram.
pub struct PerCpuExitStats {
    cpus: Vec<RwLock<Option<Arc<ExitHistogram>>>>,
}

impl PerCpuExitStats {
    /// Create a registry for up to `max_cpus` physical CPUs, all offline.
    pub fn new(max_cpus: usize) -> Self {
        Self {
            cpus: (0..max_cpus).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Number of physical CPUs the registry can hold.
    pub fn max_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Allocate the histogram of `pcpu_id`.
    pub fn bring_up(&self, pcpu_id: usize) -> AxResult<Arc<ExitHistogram>> {
        let Some(slot) = self.cpus.get(pcpu_id) else {
            return ax_err!(InvalidInput, format!("pcpu {} is out of range", pcpu_id));
        };
        let mut slot = slot.write();
        if slot.is_some() {
            return ax_err!(
                AlreadyExists,
                format!("exit stats of pcpu {} are already initialized", pcpu_id)
            );
        }
        let hist = Arc::new(ExitHistogram::new());
        *slot = Some(hist.clone());
        Ok(hist)
    }

    /// Release the histogram of `pcpu_id`. Does nothing if it is not allocated.
    pub fn release(&self, pcpu_id: usize) {
        if let Some(slot) = self.cpus.get(pcpu_id) {
            slot.write().take();
        }
    }

    /// Get the histogram of `pcpu_id`, if the CPU is online.
    pub fn get(&self, pcpu_id: usize) -> Option<Arc<ExitHistogram>> {
        self.cpus.get(pcpu_id).and_then(|slot| slot.read().clone())
    }

    /// Snapshot of the online CPUs and their histograms, in CPU order.
    pub fn online(&self) -> Vec<(usize, Arc<ExitHistogram>)> {
        self.cpus
            .iter()
            .enumerate()
            .filter_map(|(cpu, slot)| slot.read().clone().map(|hist| (cpu, hist)))
            .collect()
    }

    /// Reset the histogram of every online CPU.
    pub fn clear(&self) {
        for (_, hist) in self.online() {
            hist.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_level() {
        assert_eq!(latency_level(0), 0);
        assert_eq!(latency_level(1), 1);
        assert_eq!(latency_level(2), 2);
        assert_eq!(latency_level(3), 2);
        assert_eq!(latency_level(4), 3);
        assert_eq!(latency_level(1023), 10);
        assert_eq!(latency_level(1024), 11);
        assert_eq!(latency_level(4095), 12);
        assert_eq!(latency_level(4096), MAX_VMEXIT_LEVEL - 1);
        assert_eq!(latency_level(u64::MAX), MAX_VMEXIT_LEVEL - 1);
    }

    #[test]
    fn test_latency_level_matches_log2() {
        for us in 1..20_000u64 {
            let expected = (us.ilog2() as usize + 1).min(MAX_VMEXIT_LEVEL - 1);
            assert_eq!(latency_level(us), expected, "us = {}", us);
        }
    }

    #[test]
    fn test_record_and_clear() {
        let hist = ExitHistogram::new();
        hist.record_exit(7);
        hist.record_exit(7);
        hist.record_latency(7, 300, 3);
        hist.record_latency(7, 5000, 50);

        assert_eq!(hist.total(7), 2);
        assert_eq!(hist.count(7, 2), 1);
        assert_eq!(hist.count(7, 6), 1);
        assert_eq!(hist.time_ticks(7), 5300);
        assert_eq!(hist.max_latency_us(7), 50);
        assert_eq!(hist.total(2), 0);

        hist.clear();
        assert_eq!(hist.total(7), 0);
        assert_eq!(hist.count(7, 2), 0);
        assert_eq!(hist.time_ticks(7), 0);
        assert_eq!(hist.max_latency_us(7), 0);
    }

    #[test]
    fn test_out_of_range_reason_is_ignored() {
        let hist = ExitHistogram::new();
        let reason = NR_VMX_EXIT_REASONS as u16;
        hist.record_exit(reason);
        hist.record_latency(reason, 10, 10);
        assert_eq!(hist.total(reason), 0);
        assert_eq!(hist.max_latency_us(reason), 0);
    }

    #[test]
    fn test_per_cpu_lifecycle() {
        let stats = PerCpuExitStats::new(4);
        assert!(stats.get(1).is_none());

        let hist = stats.bring_up(1).unwrap();
        hist.record_exit(10);
        assert_eq!(stats.get(1).unwrap().total(10), 1);
        assert!(stats.bring_up(1).is_err());
        assert!(stats.bring_up(4).is_err());

        stats.bring_up(3).unwrap();
        let online: Vec<usize> = stats.online().iter().map(|(cpu, _)| *cpu).collect();
        assert_eq!(online, [1, 3]);

        stats.clear();
        assert_eq!(stats.get(1).unwrap().total(10), 0);

        stats.release(1);
        assert!(stats.get(1).is_none());
        assert!(stats.bring_up(1).is_ok());
    }
}
