//! Run small test payloads in a KVM virtual machine and collect the verdicts
//! they report.
//!
//! The guest starts at the x86 reset vector, reports verdicts through a
//! result page right below 4 GiB and halts after each one.

use std::sync::Once;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::warn;

mod console;
pub mod cpuid;
mod error;
pub mod harness;
pub mod hypervisor;
pub mod instance;
pub mod kvm;
pub mod layout;
pub mod memory;
pub mod result;
pub mod run;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use error::Error;
pub use harness::{Harness, HarnessConfig};
pub use instance::{GuestImage, Instance};
pub use kvm::KvmHandle;
pub use layout::Layout;
pub use result::{ResultType, Verdict};
pub use run::{Reporter, RunSummary, StopHandle, Termination, TracingReporter};

use crate::error::Classify;

/// The signal used to kick threads out of KVM_RUN.
const SIG_KICK: Signal = Signal::SIGUSR1;

/// Open `/dev/kvm`. Failing to do so means the host can't run tests.
pub fn open_kvm() -> Result<KvmHandle, Error> {
    KvmHandle::new().environment()
}

fn install_signal_handler() {
    static INSTALL_SIGNAL_HANDLER: Once = Once::new();
    INSTALL_SIGNAL_HANDLER.call_once(|| {
        extern "C" fn handler(_: i32) {
            // Don't do anything.
        }
        let res = unsafe {
            sigaction(
                SIG_KICK,
                &SigAction::new(
                    SigHandler::Handler(handler),
                    SaFlags::empty(),
                    SigSet::empty(),
                ),
            )
        };
        if let Err(err) = res {
            warn!("failed to install signal handler, timeouts won't work: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::{GuestImage, Harness, HarnessConfig, TracingReporter, open_kvm};

    /// Needs access to `/dev/kvm`.
    #[test]
    #[ignore]
    fn test_real_kvm_create_destroy() {
        let kvm = open_kvm().unwrap();
        // `hlt` without a result.
        let image = GuestImage::new(&[0xf4]);
        let mut harness = Harness::new(&kvm, HarnessConfig::default());
        for _ in 0..4 {
            harness.setup(&image).unwrap();
            harness.cleanup();
        }
        harness.setup(&image).unwrap();
        let err = harness.run(&mut TracingReporter).unwrap_err();
        assert!(err.to_string().contains("did not return any result"));
    }
}
