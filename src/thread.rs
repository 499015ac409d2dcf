use alloc::{boxed::Box, string::String, sync::Arc};
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::hal::AxSchedHal;

static THREAD_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

fn next_thread_id() -> usize {
    THREAD_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Hook invoked by the scheduler when a thread is switched in or out.
pub type SwitchHook = fn(&ThreadObject);

type ThreadEntry = Box<dyn Fn(&Arc<ThreadObject>) + Send + Sync>;

/// A generic schedulable unit.
///
/// Both the vCPU threads and the per-CPU idle threads are thread objects; they differ
/// only in their entry procedure. Exactly one thread object is current on a physical
/// CPU at any instant, which one is decided by the scheduler behind [`AxSchedHal`].
pub struct ThreadObject {
    /// Unique id of the thread, never reused.
    id: usize,
    name: String,
    /// The physical CPU owning this thread.
    pcpu_id: usize,
    entry: ThreadEntry,
    switch_in: Option<SwitchHook>,
    switch_out: Option<SwitchHook>,
}

impl ThreadObject {
    /// Create a new thread object owned by `pcpu_id`, without switch hooks.
    pub fn new<F>(name: impl Into<String>, pcpu_id: usize, entry: F) -> Self
    where
        F: Fn(&Arc<ThreadObject>) + Send + Sync + 'static,
    {
        Self {
            id: next_thread_id(),
            name: name.into(),
            pcpu_id,
            entry: Box::new(entry),
            switch_in: None,
            switch_out: None,
        }
    }

    /// Set the hooks the scheduler invokes around context switches.
    pub fn with_switch_hooks(
        mut self,
        switch_in: Option<SwitchHook>,
        switch_out: Option<SwitchHook>,
    ) -> Self {
        self.switch_in = switch_in;
        self.switch_out = switch_out;
        self
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn pcpu_id(&self) -> usize {
        self.pcpu_id
    }

    /// Called by the scheduler right before this thread starts executing on its CPU.
    pub fn switch_in(&self) {
        if let Some(hook) = self.switch_in {
            hook(self);
        }
    }

    /// Called by the scheduler right after this thread stopped executing on its CPU.
    pub fn switch_out(&self) {
        if let Some(hook) = self.switch_out {
            hook(self);
        }
    }
}

impl fmt::Debug for ThreadObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pcpu_id", &self.pcpu_id)
            .finish()
    }
}

/// Install `obj` as the running thread of the calling CPU and invoke its entry procedure.
///
/// The entry procedures provided by this crate only return on a terminal path (the
/// vCPU became a zombie, or the CPU was powered down).
pub fn run_thread<S: AxSchedHal + ?Sized>(sched: &S, obj: &Arc<ThreadObject>) {
    sched.set_current_thread(obj);
    obj.switch_in();
    (obj.entry)(obj);
}
