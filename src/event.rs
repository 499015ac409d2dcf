use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::{hal::AxSchedHal, thread::ThreadObject};

/// What a [`SchedEvent`] is used for. Only used for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedEventKind {
    /// Completion of an I/O request emulated outside the hypervisor.
    Ioreq,
    /// A virtual interrupt has been delivered to the vcpu.
    VirtualInterrupt,
    /// A WBINVD emulation round has finished on all vcpus.
    SyncWbinvd,
    /// Split-lock emulation has finished on all vcpus.
    SplitLock,
    /// An event not owned by a vcpu.
    Generic,
}

struct SchedEventInner {
    set: bool,
    waiting_thread: Option<Arc<ThreadObject>>,
}

/// A single-waiter block/wake primitive.
///
/// At most one thread may wait on an event at a time. A signal delivered while nobody
/// waits is latched and consumed by the next [`SchedEvent::wait`]. A signal delivered
/// to a waiting thread is handed over directly: the waiter is woken and the event stays
/// unset.
pub struct SchedEvent {
    inner: Mutex<SchedEventInner>,
    kind: SchedEventKind,
    vm_id: u16,
    vcpu_id: u16,
}

impl SchedEvent {
    /// Create an unset event without waiter.
    pub const fn new(kind: SchedEventKind, vm_id: u16, vcpu_id: u16) -> Self {
        Self {
            inner: Mutex::new(SchedEventInner {
                set: false,
                waiting_thread: None,
            }),
            kind,
            vm_id,
            vcpu_id,
        }
    }

    pub const fn kind(&self) -> SchedEventKind {
        self.kind
    }

    pub const fn vm_id(&self) -> u16 {
        self.vm_id
    }

    pub const fn vcpu_id(&self) -> u16 {
        self.vcpu_id
    }

    /// Whether a signal is latched.
    pub fn is_set(&self) -> bool {
        self.inner.lock().set
    }

    /// Whether a thread is currently blocked on this event.
    pub fn has_waiter(&self) -> bool {
        self.inner.lock().waiting_thread.is_some()
    }

    /// Drop a latched signal. Never blocks and never wakes the waiter.
    pub fn reset(&self) {
        self.inner.lock().set = false;
    }

    /// Signal the event, waking the waiter if there is one.
    ///
    /// Safe to call from a physical CPU other than the waiter's.
    pub fn signal<S: AxSchedHal + ?Sized>(&self, sched: &S) {
        let mut inner = self.inner.lock();
        inner.set = true;
        if let Some(waiter) = inner.waiting_thread.take() {
            // The signal is consumed by the waiter.
            inner.set = false;
            sched.wake_thread(&waiter);
        }
    }

    /// Wait for the event on behalf of the current thread.
    ///
    /// Returns immediately, consuming the signal, if the event is already set.
    /// Otherwise the current thread is blocked until [`SchedEvent::signal`] is called.
    ///
    /// Fails with `ResourceBusy` if another thread is already waiting on this event.
    pub fn wait<S: AxSchedHal + ?Sized>(&self, sched: &S) -> AxResult {
        let mut inner = self.inner.lock();
        if inner.set {
            inner.set = false;
            return Ok(());
        }
        if let Some(waiter) = inner.waiting_thread.as_ref() {
            return ax_err!(
                ResourceBusy,
                format!(
                    "{:?} event of vm {} vcpu {} is already waited by {}",
                    self.kind,
                    self.vm_id,
                    self.vcpu_id,
                    waiter.name()
                )
            );
        }

        let current = sched.current_thread();
        inner.waiting_thread = Some(current.clone());
        // The signaler clears `waiting_thread` before waking us, anything else is a
        // spurious resumption.
        while inner
            .waiting_thread
            .as_ref()
            .is_some_and(|waiter| Arc::ptr_eq(waiter, &current))
        {
            sched.sleep_thread(&current);
            drop(inner);
            sched.schedule();
            inner = self.inner.lock();
        }
        Ok(())
    }
}
