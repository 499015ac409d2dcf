use alloc::{sync::Arc, vec::Vec};
use core::fmt::{self, Write};

use axerrno::{ax_err, AxResult};

use super::histogram::{ExitHistogram, PerCpuExitStats, MAX_VMEXIT_LEVEL};
use crate::{
    exit::NR_VMX_EXIT_REASONS,
    hal::{AxRunLoopHal, AxSchedHal},
    vm::GuestVm,
};

/// Platform data the reports read besides the histograms.
pub trait ReportSource {
    /// Current time in microseconds.
    fn now_us(&self) -> u64;
    /// Convert a tick count to microseconds.
    fn ticks_to_us(&self, ticks: u64) -> u64;
    /// Number of reschedules performed on `pcpu_id`.
    fn resched_times(&self, pcpu_id: usize) -> u64;
}

impl<H: AxRunLoopHal + ?Sized> ReportSource for H {
    fn now_us(&self) -> u64 {
        AxRunLoopHal::ticks_to_us(self, self.current_ticks())
    }

    fn ticks_to_us(&self, ticks: u64) -> u64 {
        AxRunLoopHal::ticks_to_us(self, ticks)
    }

    fn resched_times(&self, pcpu_id: usize) -> u64 {
        AxSchedHal::resched_times(self, pcpu_id)
    }
}

const LEVEL_INFO: [&str; MAX_VMEXIT_LEVEL] = [
    "   0us -   1us",
    "   1us -   2us",
    "   2us -   4us",
    "   4us -   8us",
    "   8us -  16us",
    "  16us -  32us",
    "  32us -  64us",
    "  64us - 128us",
    " 128us - 256us",
    " 256us - 512us",
    " 512us -1024us",
    "1024us -2048us",
    "2048us -4096us",
    "4096us -  more",
];

/// Counts the bytes a field would take.
struct FieldLen(usize);

impl Write for FieldLen {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

/// Writes into a byte slice, failing once it is full.
struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.pos + s.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.pos..end].copy_from_slice(s.as_bytes());
        self.pos = end;
        Ok(())
    }
}

/// A report being rendered into a caller-supplied buffer.
///
/// Fields are written whole or not at all.
struct ReportWriter<'a> {
    out: SliceWriter<'a>,
}

impl<'a> ReportWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self {
            out: SliceWriter { buf, pos: 0 },
        }
    }

    fn field(&mut self, args: fmt::Arguments<'_>) -> AxResult {
        let mut len = FieldLen(0);
        // Counting never fails.
        let _ = len.write_fmt(args);
        if len.0 > self.out.buf.len() - self.out.pos {
            return ax_err!(
                StorageFull,
                format!(
                    "vmexit report needs more than {} bytes, output stopped at {}",
                    self.out.buf.len(),
                    self.out.pos
                )
            );
        }
        self.out.write_fmt(args).or_else(|_| ax_err!(StorageFull))
    }

    fn written(&self) -> usize {
        self.out.pos
    }
}

macro_rules! field {
    ($w:expr, $($arg:tt)*) => {
        $w.field(format_args!($($arg)*))?
    };
}

#[derive(Clone, Copy)]
enum ColumnKind {
    Cpu,
    Vm,
}

impl ColumnKind {
    const fn name(self) -> &'static str {
        match self {
            ColumnKind::Cpu => "CPU",
            ColumnKind::Vm => "VM",
        }
    }

    /// Header of a column in the details tables, right-aligned to the 12-wide cells.
    const fn details_prefix(self) -> &'static str {
        match self {
            ColumnKind::Cpu => "        CPU",
            ColumnKind::Vm => "         VM",
        }
    }

    const fn scope(self) -> &'static str {
        match self {
            ColumnKind::Cpu => "cpu",
            ColumnKind::Vm => "VM",
        }
    }
}

struct Column<'a> {
    id: usize,
    hist: &'a ExitHistogram,
}

fn pcpu_columns(online: &[(usize, Arc<ExitHistogram>)]) -> Vec<Column<'_>> {
    online
        .iter()
        .map(|(cpu, hist)| Column { id: *cpu, hist })
        .collect()
}

fn vm_columns(vms: &[Arc<GuestVm>]) -> Vec<Column<'_>> {
    vms.iter()
        .filter(|vm| !vm.is_poweroff())
        .map(|vm| Column {
            id: vm.id(),
            hist: vm.exit_stats(),
        })
        .collect()
}

fn exit_reasons() -> impl Iterator<Item = u16> {
    0..NR_VMX_EXIT_REASONS as u16
}

fn render_profile(
    w: &mut ReportWriter<'_>,
    source: &dyn ReportSource,
    kind: ColumnKind,
    columns: &[Column<'_>],
) -> AxResult {
    match kind {
        ColumnKind::Cpu => field!(w, "\r\nNow(us) = {:16}\r\n", source.now_us()),
        ColumnKind::Vm => field!(
            w,
            "\r\nNow(us) = {:16}; total vmexit per vm (count & time):\r\n",
            source.now_us()
        ),
    }
    field!(w, "\r\nREASON");
    for col in columns {
        field!(w, "\t      {}{}\t        US", kind.name(), col.id);
    }

    for reason in exit_reasons() {
        if columns.iter().all(|col| col.hist.total(reason) == 0) {
            continue;
        }
        field!(w, "\r\n0x{:02x}", reason);
        for col in columns {
            field!(
                w,
                "\t{:10}\t{:10}",
                col.hist.total(reason),
                source.ticks_to_us(col.hist.time_ticks(reason))
            );
        }
    }

    if let ColumnKind::Cpu = kind {
        for col in columns {
            field!(
                w,
                "\r\ncpu{} thread resched: {}",
                col.id,
                source.resched_times(col.id)
            );
        }
    }

    field!(w, "\r\n");
    Ok(())
}

fn render_details(
    w: &mut ReportWriter<'_>,
    source: &dyn ReportSource,
    kind: ColumnKind,
    columns: &[Column<'_>],
) -> AxResult {
    field!(
        w,
        "\r\nNow={}us, for detailed latency of each vmexit on each {}:",
        source.now_us(),
        kind.scope()
    );

    for reason in exit_reasons() {
        if columns.iter().all(|col| col.hist.total(reason) == 0) {
            continue;
        }
        field!(w, "\r\n\r\n   VMEXIT/0x{:02x}", reason);
        for col in columns {
            field!(w, "{}{}", kind.details_prefix(), col.id);
        }

        for (level, info) in LEVEL_INFO.iter().enumerate() {
            if columns.iter().all(|col| col.hist.count(reason, level) == 0) {
                continue;
            }
            field!(w, "\r\n{}", info);
            for col in columns {
                field!(w, "{:12}", col.hist.count(reason, level));
            }
        }

        field!(w, "\r\n  Max Lat(us):");
        for col in columns {
            field!(w, "{:12}", col.hist.max_latency_us(reason));
        }
    }

    field!(w, "\r\n");
    Ok(())
}

fn finish(w: ReportWriter<'_>, result: AxResult) -> AxResult<usize> {
    match result {
        Ok(()) => Ok(w.written()),
        Err(err) => {
            warn!("buffer size could not be enough! please check!");
            Err(err)
        }
    }
}

/// Render the exit count and accumulated handling time of every exit reason on every
/// online physical CPU into `buf`.
///
/// Returns the number of bytes written. Fails with `StorageFull` if `buf` is too
/// small; fields that fit before the overflow are left in `buf`, none is cut.
pub fn vmexit_profile_per_pcpu(
    stats: &PerCpuExitStats,
    source: &dyn ReportSource,
    buf: &mut [u8],
) -> AxResult<usize> {
    let online = stats.online();
    let columns = pcpu_columns(&online);
    let mut w = ReportWriter::new(buf);
    let result = render_profile(&mut w, source, ColumnKind::Cpu, &columns);
    finish(w, result)
}

/// Per-VM counterpart of [`vmexit_profile_per_pcpu`]. Powered-off VMs are skipped.
pub fn vmexit_profile_per_vm(
    vms: &[Arc<GuestVm>],
    source: &dyn ReportSource,
    buf: &mut [u8],
) -> AxResult<usize> {
    let columns = vm_columns(vms);
    let mut w = ReportWriter::new(buf);
    let result = render_profile(&mut w, source, ColumnKind::Vm, &columns);
    finish(w, result)
}

/// Render the latency histogram and the max latency of every exit reason on every
/// online physical CPU into `buf`.
///
/// Same buffer contract as [`vmexit_profile_per_pcpu`].
pub fn vmexit_details_per_pcpu(
    stats: &PerCpuExitStats,
    source: &dyn ReportSource,
    buf: &mut [u8],
) -> AxResult<usize> {
    let online = stats.online();
    let columns = pcpu_columns(&online);
    let mut w = ReportWriter::new(buf);
    let result = render_details(&mut w, source, ColumnKind::Cpu, &columns);
    finish(w, result)
}

/// Per-VM counterpart of [`vmexit_details_per_pcpu`]. Powered-off VMs are skipped.
pub fn vmexit_details_per_vm(
    vms: &[Arc<GuestVm>],
    source: &dyn ReportSource,
    buf: &mut [u8],
) -> AxResult<usize> {
    let columns = vm_columns(vms);
    let mut w = ReportWriter::new(buf);
    let result = render_details(&mut w, source, ColumnKind::Vm, &columns);
    finish(w, result)
}

/// Reset the histograms of every online physical CPU and every powered-on VM.
pub fn clear_vmexit_info(stats: &PerCpuExitStats, vms: &[Arc<GuestVm>]) {
    stats.clear();
    for vm in vms.iter().filter(|vm| !vm.is_poweroff()) {
        vm.exit_stats().clear();
    }
}
