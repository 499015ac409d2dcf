use axerrno::{ax_err, AxResult};

use crate::{arch_vcpu::AxArchVCpu, vcpu::AxVCpu};

/// Number of basic exit reasons the dispatch table and the statistics can hold.
pub const NR_VMX_EXIT_REASONS: usize = 80;

/// Extract the basic exit reason (bits 15:0) from a raw exit reason.
pub const fn basic_exit_reason(raw: u32) -> u16 {
    (raw & 0xffff) as u16
}

/// Handler of a specific basic exit reason.
///
/// Returning an error is an abnormal but recoverable condition: the run loop injects a
/// general-protection fault into the guest. Handlers run inside the dispatch loop of the
/// vcpu, so they may use [`AxVCpu::get_arch_vcpu`].
pub type VmExitHandler<A> = fn(&AxVCpu<A>) -> AxResult;

/// Dispatch table of VM exit handlers, indexed by basic exit reason.
pub struct VmExitTable<A: AxArchVCpu> {
    handlers: [Option<VmExitHandler<A>>; NR_VMX_EXIT_REASONS],
}

impl<A: AxArchVCpu> VmExitTable<A> {
    /// Create a table with no handler registered.
    pub const fn new() -> Self {
        Self {
            handlers: [None; NR_VMX_EXIT_REASONS],
        }
    }

    /// Register the handler of `reason`, replacing the previous one.
    pub fn register(&mut self, reason: u16, handler: VmExitHandler<A>) -> AxResult {
        match self.handlers.get_mut(usize::from(reason)) {
            Some(slot) => {
                *slot = Some(handler);
                Ok(())
            }
            None => ax_err!(
                InvalidInput,
                format!("exit reason {:#x} is out of the dispatch table", reason)
            ),
        }
    }

    /// Builder-style [`VmExitTable::register`].
    pub fn with_handler(mut self, reason: u16, handler: VmExitHandler<A>) -> AxResult<Self> {
        self.register(reason, handler)?;
        Ok(self)
    }

    /// Invoke the handler of `reason` on `vcpu`.
    ///
    /// Exits without a registered handler are logged and ignored.
    pub(crate) fn dispatch(&self, vcpu: &AxVCpu<A>, reason: u16) -> AxResult {
        match self.handlers.get(usize::from(reason)) {
            Some(Some(handler)) => handler(vcpu),
            Some(None) => {
                // SAFETY: dispatch is only invoked from the dispatch loop of `vcpu`.
                let rip = unsafe { vcpu.get_arch_vcpu() }.rip();
                warn!(
                    "VCpu[{}] unhandled VM exit {:#x} at {:?}",
                    vcpu.id(),
                    reason,
                    rip
                );
                Ok(())
            }
            None => ax_err!(InvalidInput, format!("invalid exit reason {:#x}", reason)),
        }
    }
}

impl<A: AxArchVCpu> Default for VmExitTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_exit_reason() {
        assert_eq!(basic_exit_reason(0x0000_0007), 7);
        assert_eq!(basic_exit_reason(0x8000_0021), 0x21);
        assert_eq!(basic_exit_reason(0x1234_ffff), 0xffff);
    }
}
