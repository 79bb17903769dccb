//! Driving the vCPU until the guest is done.

use std::{
    mem::offset_of,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, anyhow, bail};
use nix::sys::pthread::{Pthread, pthread_kill, pthread_self};
use tracing::{debug, error, info, trace, warn};

use crate::{
    SIG_KICK,
    console::Console,
    error::{Classify, Error},
    hypervisor::{Hypervisor, VirtualCpu},
    instance::Instance,
    kvm::{KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT, KvmExit, KvmExitIo, KvmExitMmio, KvmRun},
    result::{RESULT_EXIT, ResultType, Verdict, validate},
};

/// Where an instance is in its run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Ready to enter the guest.
    Runnable,
    /// The guest exited and the exit hasn't been handled yet.
    ExitPending,
    /// The guest reported that it's done.
    Halted,
    /// The run ended with an error.
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The guest signaled that it's done.
    Exited,
    /// The guest reported a broken environment.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub verdicts: Vec<Verdict>,
    pub termination: Termination,
    /// Lines the guest wrote to its console.
    pub console: Vec<String>,
}

impl RunSummary {
    /// The most severe verdict.
    pub fn worst(&self) -> Option<ResultType> {
        self.verdicts
            .iter()
            .map(|verdict| verdict.result)
            .max_by_key(|result| result.severity())
    }

    /// The overall result of the run. A guest that exits without reporting
    /// anything is broken.
    pub fn outcome(&self) -> ResultType {
        self.worst().unwrap_or(ResultType::Broken)
    }
}

/// Receives verdicts as soon as the guest reports them.
pub trait Reporter {
    fn report(&mut self, verdict: &Verdict);
}

/// Logs every verdict.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&mut self, verdict: &Verdict) {
        let Verdict {
            result,
            file,
            lineno,
            message,
        } = verdict;
        match result {
            ResultType::Pass | ResultType::Info | ResultType::Conf => {
                info!(%file, lineno, "{result}: {message}")
            }
            ResultType::Warn => warn!(%file, lineno, "{result}: {message}"),
            ResultType::Fail | ResultType::Broken => error!(%file, lineno, "{result}: {message}"),
        }
    }
}

impl Reporter for Vec<Verdict> {
    fn report(&mut self, verdict: &Verdict) {
        self.push(verdict.clone());
    }
}

/// Asks a run loop on another thread to stop.
///
/// The loop checks for the request every time the vCPU exits. [`StopHandle::kick`]
/// forces an exit out of a guest that doesn't exit on its own.
#[derive(Debug, Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    thread: Pthread,
}

impl StopHandle {
    /// A handle for a run loop on the calling thread.
    pub fn for_current_thread() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            thread: pthread_self(),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Interrupt the thread if it's currently in the guest.
    pub fn kick(&self) {
        if let Err(err) = pthread_kill(self.thread, SIG_KICK) {
            debug!("failed to kick vcpu thread: {err}");
        }
    }
}

impl<H> Instance<H>
where
    H: Hypervisor,
{
    /// Run the guest until it exits, reports a broken environment or faults.
    ///
    /// Each verdict the guest reports is passed to `reporter` right away and
    /// collected in the returned summary.
    pub fn run(
        &mut self,
        reporter: &mut dyn Reporter,
        stop: &StopHandle,
    ) -> Result<RunSummary, Error> {
        let mut console = Console::new();
        let mut verdicts = Vec::new();
        let res = self.run_loop(reporter, stop, &mut console, &mut verdicts);
        let console = console.finish();
        match res {
            Ok(termination) => {
                info!(?termination, verdicts = verdicts.len(), "guest finished");
                Ok(RunSummary {
                    verdicts,
                    termination,
                    console,
                })
            }
            Err(err) => {
                self.state = ExecState::Faulted;
                Err(err)
            }
        }
    }

    fn run_loop(
        &mut self,
        reporter: &mut dyn Reporter,
        stop: &StopHandle,
        console: &mut Console,
        verdicts: &mut Vec<Verdict>,
    ) -> Result<Termination, Error> {
        loop {
            if stop.is_requested() {
                return Err(Error::Execution(anyhow!(
                    "stopped before the guest finished"
                )));
            }

            self.state = ExecState::Runnable;

            if !self.vcpu().execution()?.run().execution()? {
                trace!("vcpu was interrupted");
                continue;
            }
            self.state = ExecState::ExitPending;

            let exit = self.read_exit().execution()?;
            match exit {
                KvmExit::Hlt => {
                    let header = self.read_result_header().execution()?;
                    if header.result == RESULT_EXIT {
                        self.state = ExecState::Halted;
                        return Ok(Termination::Exited);
                    }

                    let result = validate(header.result)?;
                    let verdict = Verdict {
                        result,
                        file: self.guest_file_name(header.file_addr),
                        lineno: header.lineno,
                        message: self.read_message().execution()?,
                    };
                    reporter.report(&verdict);
                    verdicts.push(verdict);

                    if result == ResultType::Broken {
                        return Ok(Termination::Aborted);
                    }

                    // Other exits leave the channel alone.
                    self.reset_result()
                        .context("failed to reset the result channel")
                        .execution()?;
                }
                KvmExit::Io(io) => self.service_io(io, console).execution()?,
                KvmExit::Mmio(mmio) => self.service_mmio(mmio).execution()?,
                KvmExit::Interrupted | KvmExit::IrqWindowOpen => {}
                KvmExit::Shutdown => return Err(self.fault("triple fault")),
                KvmExit::FailEntry(fail) => {
                    let reason = fail.hardware_entry_failure_reason;
                    return Err(self.fault(format_args!(
                        "vm entry failed (hardware reason {reason:#x})"
                    )));
                }
                KvmExit::Internal(internal) => {
                    let suberror = internal.suberror;
                    return Err(self.fault(format_args!(
                        "internal hypervisor error (suberror {suberror})"
                    )));
                }
                KvmExit::SystemEvent(event) => {
                    let ty = event.ty;
                    return Err(self.fault(format_args!("system event {ty}")));
                }
                exit => return Err(self.fault(format_args!("unexpected exit {exit:?}"))),
            }
        }
    }

    fn read_exit(&self) -> anyhow::Result<KvmExit> {
        let run_state = self.run_state.as_ref().context("run state isn't mapped")?;
        let exit_reason = run_state
            .ptr::<u32>(offset_of!(KvmRun, exit_reason))?
            .read();
        let mut exit_data = [0; 256];
        run_state.read_into(offset_of!(KvmRun, exit_data), &mut exit_data)?;
        Ok(KvmExit::decode(exit_reason, &exit_data))
    }

    fn fault(&self, what: impl std::fmt::Display) -> Error {
        let rip = self
            .vcpu()
            .and_then(|vcpu| vcpu.get_regs())
            .map_or_else(|_| "<unknown>".to_owned(), |regs| format!("{:#x}", regs.rip));
        Error::Execution(anyhow!("guest crashed: {what} at rip {rip}"))
    }

    fn service_io(&self, io: KvmExitIo, console: &mut Console) -> anyhow::Result<()> {
        let run_state = self.run_state.as_ref().context("run state isn't mapped")?;
        let port = io.port;
        let size = usize::from(io.size);
        let len = size
            .checked_mul(usize::try_from(io.count)?)
            .context("port i/o too big")?;
        let offset = usize::try_from(io.data_offset)?;

        match io.direction {
            KVM_EXIT_IO_OUT => {
                let mut data = vec![0; len];
                run_state.read_into(offset, &mut data)?;
                if port == self.layout.console_port {
                    // Only the low byte of each access is a character.
                    let bytes = data.chunks(size.max(1)).map(|access| access[0]);
                    console.write(&bytes.collect::<Vec<_>>());
                } else {
                    trace!(port, ?data, "ignoring port write");
                }
            }
            KVM_EXIT_IO_IN => {
                trace!(port, len, "serving port read");
                run_state.write_bytes(offset, &vec![0; len])?;
            }
            direction => bail!("invalid port i/o direction {direction}"),
        }

        Ok(())
    }

    fn service_mmio(&self, mmio: KvmExitMmio) -> anyhow::Result<()> {
        let run_state = self.run_state.as_ref().context("run state isn't mapped")?;
        let addr = mmio.phys_addr;
        let len = usize::try_from(mmio.len)?.min(8);
        if mmio.is_write != 0 {
            trace!(addr, len, "ignoring mmio write");
        } else {
            trace!(addr, len, "serving mmio read");
            let offset = offset_of!(KvmRun, exit_data) + offset_of!(KvmExitMmio, data);
            run_state.write_bytes(offset, &[0; 8][..len])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecState, Reporter, RunSummary, StopHandle, Termination};
    use crate::{
        error::Error,
        instance::{GuestImage, Instance},
        kvm::{KVM_EXIT_FAIL_ENTRY, KVM_EXIT_IRQ_WINDOW_OPEN, KVM_EXIT_INTR},
        layout::{DEFAULT_RAM_SIZE, Layout},
        result::{ResultType, Verdict},
        sim::{GuestStep, Script, SimHypervisor, SimStats},
    };

    const FILE_ADDR: u64 = 0x3000;

    fn script() -> Script {
        Script::new(Layout::default()).write_str(FILE_ADDR, "kvm_test.c")
    }

    fn run(sim: &SimHypervisor) -> (Result<RunSummary, Error>, Vec<Verdict>, ExecState) {
        let mut instance = Instance::create(
            sim,
            Layout::default(),
            &GuestImage::new(&[0xf4]),
            DEFAULT_RAM_SIZE,
        )
        .unwrap();
        let mut reported = Vec::new();
        let res = instance.run(&mut reported, &StopHandle::for_current_thread());
        let state = instance.state();
        drop(instance);
        assert_eq!(sim.stats(), SimStats::default());
        (res, reported, state)
    }

    #[test]
    fn test_pass_then_exit() {
        let sim = SimHypervisor::with_script(
            script()
                .report(ResultType::Pass.code(), FILE_ADDR, 42, "all good")
                .exit(),
        );
        let (res, reported, state) = run(&sim);
        let summary = res.unwrap();

        let expected = Verdict {
            result: ResultType::Pass,
            file: "kvm_test.c".to_owned(),
            lineno: 42,
            message: "all good".to_owned(),
        };
        assert_eq!(summary.verdicts, [expected.clone()]);
        assert_eq!(reported, [expected]);
        assert_eq!(summary.termination, Termination::Exited);
        assert_eq!(summary.worst(), Some(ResultType::Pass));
        assert_eq!(state, ExecState::Halted);
    }

    #[test]
    fn test_exit_without_verdicts() {
        let sim = SimHypervisor::with_script(script().exit());
        let (res, _, state) = run(&sim);
        let summary = res.unwrap();
        assert!(summary.verdicts.is_empty());
        assert_eq!(summary.worst(), None);
        assert_eq!(summary.outcome(), ResultType::Broken);
        assert_eq!(state, ExecState::Halted);
    }

    #[test]
    fn test_outcome_is_worst_verdict() {
        let sim = SimHypervisor::with_script(
            script()
                .report(ResultType::Warn.code(), FILE_ADDR, 1, "careful")
                .report(ResultType::Pass.code(), FILE_ADDR, 2, "ok")
                .exit(),
        );
        let summary = run(&sim).0.unwrap();
        assert_eq!(summary.outcome(), ResultType::Warn);
    }

    #[test]
    fn test_result_survives_console_exit() {
        let sim = SimHypervisor::with_script(
            script()
                .set_result(ResultType::Pass.code(), FILE_ADDR, 7, "printed first")
                .console("x\n")
                .halt()
                .exit(),
        );
        let (res, reported, state) = run(&sim);
        let summary = res.unwrap();
        assert_eq!(summary.console, ["x"]);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].result, ResultType::Pass);
        assert_eq!(reported[0].lineno, 7);
        assert_eq!(reported[0].message, "printed first");
        assert_eq!(state, ExecState::Halted);
    }

    #[test]
    fn test_result_survives_interrupt() {
        let sim = SimHypervisor::with_script(
            script()
                .set_result(ResultType::Fail.code(), FILE_ADDR, 9, "interrupted")
                .step(GuestStep::Exit(KVM_EXIT_INTR))
                .step(GuestStep::In { port: 0x60, len: 1 })
                .halt()
                .exit(),
        );
        let summary = run(&sim).0.unwrap();
        assert_eq!(summary.verdicts.len(), 1);
        assert_eq!(summary.verdicts[0].result, ResultType::Fail);
        assert_eq!(summary.verdicts[0].message, "interrupted");
        assert_eq!(summary.termination, Termination::Exited);
    }

    #[test]
    fn test_result_is_cleared_after_verdict() {
        // The second halt carries no new result.
        let sim = SimHypervisor::with_script(
            script()
                .report(ResultType::Pass.code(), FILE_ADDR, 1, "once")
                .halt(),
        );
        let (res, reported, _) = run(&sim);
        assert_eq!(reported.len(), 1);
        let err = res.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("did not return any result"));
    }

    #[test]
    fn test_multiple_verdicts() {
        let sim = SimHypervisor::with_script(
            script()
                .report(ResultType::Info.code(), FILE_ADDR, 1, "starting")
                .report(ResultType::Fail.code(), FILE_ADDR, 2, "wrong value")
                .report(ResultType::Pass.code(), FILE_ADDR, 3, "second check")
                .exit(),
        );
        let summary = run(&sim).0.unwrap();
        let results = summary
            .verdicts
            .iter()
            .map(|verdict| verdict.result)
            .collect::<Vec<_>>();
        assert_eq!(
            results,
            [ResultType::Info, ResultType::Fail, ResultType::Pass]
        );
        assert_eq!(summary.worst(), Some(ResultType::Fail));
    }

    #[test]
    fn test_broken_verdict_aborts() {
        let sim = SimHypervisor::with_script(
            script()
                .report(ResultType::Broken.code(), FILE_ADDR, 5, "setup failed")
                .report(ResultType::Pass.code(), FILE_ADDR, 6, "unreachable")
                .exit(),
        );
        let summary = run(&sim).0.unwrap();
        assert_eq!(summary.termination, Termination::Aborted);
        assert_eq!(summary.verdicts.len(), 1);
        assert_eq!(summary.worst(), Some(ResultType::Broken));
    }

    #[test]
    fn test_halt_without_result() {
        let sim = SimHypervisor::with_script(script().halt());
        let (res, _, state) = run(&sim);
        let err = res.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("did not return any result"));
        assert_eq!(state, ExecState::Faulted);
    }

    #[test]
    fn test_invalid_result_is_rejected() {
        let sim = SimHypervisor::with_script(script().report(0x41, FILE_ADDR, 1, "flags"));
        let err = run(&sim).0.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("invalid result value 65"));
    }

    #[test]
    fn test_bad_file_pointer() {
        let sim = SimHypervisor::with_script(
            script()
                .report(ResultType::Pass.code(), 0xdead_0000_0000, 1, "ok")
                .exit(),
        );
        let summary = run(&sim).0.unwrap();
        assert_eq!(summary.verdicts[0].file, "<unknown>");
    }

    #[test]
    fn test_triple_fault() {
        let sim = SimHypervisor::with_script(script().step(GuestStep::Shutdown));
        let (res, _, state) = run(&sim);
        let err = res.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert_eq!(err.result_type(), ResultType::Broken);
        let message = err.to_string();
        assert!(message.contains("triple fault"), "{message}");
        assert!(message.contains("rip 0xfff0"), "{message}");
        assert_eq!(state, ExecState::Faulted);
    }

    #[test]
    fn test_empty_script_faults() {
        let sim = SimHypervisor::new();
        assert!(matches!(run(&sim).0, Err(Error::Execution(_))));
    }

    #[test]
    fn test_failed_entry() {
        let sim = SimHypervisor::with_script(script().step(GuestStep::Exit(KVM_EXIT_FAIL_ENTRY)));
        let err = run(&sim).0.unwrap_err();
        assert!(err.to_string().contains("vm entry failed"));
    }

    #[test]
    fn test_unexpected_exit() {
        let sim = SimHypervisor::with_script(script().step(GuestStep::Exit(1234)));
        let err = run(&sim).0.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert!(err.to_string().contains("1234"));
    }

    #[test]
    fn test_interrupts_resume() {
        let sim = SimHypervisor::with_script(
            script()
                .step(GuestStep::Exit(KVM_EXIT_INTR))
                .step(GuestStep::Exit(KVM_EXIT_IRQ_WINDOW_OPEN))
                .report(ResultType::Pass.code(), FILE_ADDR, 1, "ok")
                .exit(),
        );
        let summary = run(&sim).0.unwrap();
        assert_eq!(summary.verdicts.len(), 1);
        assert_eq!(sim.runs(), 4);
    }

    #[test]
    fn test_console_output() {
        let sim = SimHypervisor::with_script(
            script()
                .console("hello\nwor")
                .console("ld\npartial")
                .exit(),
        );
        let summary = run(&sim).0.unwrap();
        assert_eq!(summary.console, ["hello", "world", "partial"]);
    }

    #[test]
    fn test_reads_return_zeros() {
        let sim = SimHypervisor::with_script(
            script()
                .step(GuestStep::In { port: 0x60, len: 4 })
                .step(GuestStep::MmioRead {
                    addr: 0xfee0_0000,
                    len: 4,
                })
                .step(GuestStep::MmioWrite {
                    addr: 0xfee0_0000,
                    data: vec![1, 2, 3, 4],
                })
                .step(GuestStep::Out {
                    port: 0x80,
                    data: vec![0xaa],
                })
                .exit(),
        );
        let summary = run(&sim).0.unwrap();
        assert!(summary.console.is_empty());
        assert_eq!(sim.reads(), [vec![0; 4], vec![0; 4]]);
    }

    #[test]
    fn test_stop_request_is_observed() {
        let sim = SimHypervisor::with_script(script().exit());
        let mut instance = Instance::create(
            &sim,
            Layout::default(),
            &GuestImage::new(&[0xf4]),
            DEFAULT_RAM_SIZE,
        )
        .unwrap();
        let stop = StopHandle::for_current_thread();
        stop.request();
        let err = instance
            .run(&mut Vec::<Verdict>::new(), &stop)
            .unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert_eq!(sim.runs(), 0);
    }

    #[test]
    fn test_reporter_sees_verdicts_first() {
        struct Counter(usize);

        impl Reporter for Counter {
            fn report(&mut self, _: &Verdict) {
                self.0 += 1;
            }
        }

        let sim = SimHypervisor::with_script(
            script()
                .report(ResultType::Warn.code(), FILE_ADDR, 1, "careful")
                .report(ResultType::Conf.code(), FILE_ADDR, 2, "skipped")
                .halt(),
        );
        let mut instance = Instance::create(
            &sim,
            Layout::default(),
            &GuestImage::new(&[0xf4]),
            DEFAULT_RAM_SIZE,
        )
        .unwrap();
        let mut counter = Counter(0);
        let res = instance.run(&mut counter, &StopHandle::for_current_thread());
        // The trailing halt doesn't carry a result.
        assert!(res.is_err());
        assert_eq!(counter.0, 2);
    }
}
