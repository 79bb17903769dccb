//! Default setup, run and cleanup hooks for a test.

use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::{
    error::Error,
    hypervisor::Hypervisor,
    install_signal_handler,
    instance::{GuestImage, Instance},
    layout::Layout,
    run::{Reporter, RunSummary, StopHandle},
};

/// How often the watchdog kicks a vCPU that hasn't stopped yet.
const KICK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarnessConfig {
    pub ram_size: usize,
    /// Stop the guest if it runs longer than this.
    pub timeout: Option<Duration>,
    pub layout: Layout,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let layout = Layout::default();
        Self {
            ram_size: layout.default_ram_size,
            timeout: None,
            layout,
        }
    }
}

pub struct Harness<'a, H>
where
    H: Hypervisor,
{
    hypervisor: &'a H,
    config: HarnessConfig,
    instance: Option<Instance<H>>,
}

impl<'a, H> Harness<'a, H>
where
    H: Hypervisor,
{
    pub fn new(hypervisor: &'a H, config: HarnessConfig) -> Self {
        Self {
            hypervisor,
            config,
            instance: None,
        }
    }

    pub fn instance(&self) -> Option<&Instance<H>> {
        self.instance.as_ref()
    }

    /// Build the instance for `image`. An instance left over from an earlier
    /// setup is destroyed first.
    pub fn setup(&mut self, image: &GuestImage<'_>) -> Result<(), Error> {
        self.cleanup();
        let instance = Instance::create(
            self.hypervisor,
            self.config.layout,
            image,
            self.config.ram_size,
        )?;
        self.instance = Some(instance);
        Ok(())
    }

    /// Run the instance built by [`Harness::setup`] and destroy it.
    pub fn run(&mut self, reporter: &mut dyn Reporter) -> Result<RunSummary, Error> {
        let mut instance = self
            .instance
            .take()
            .ok_or_else(|| Error::Execution(anyhow!("no instance was set up")))?;

        install_signal_handler();
        let stop = StopHandle::for_current_thread();
        let res = match self.config.timeout {
            Some(timeout) => {
                let res = with_watchdog(stop.clone(), timeout, || instance.run(reporter, &stop));
                res.map_err(|err| {
                    if stop.is_requested() {
                        Error::Execution(anyhow!("test timed out after {timeout:?}"))
                    } else {
                        err
                    }
                })
            }
            None => instance.run(reporter, &stop),
        };

        instance.destroy();
        res
    }

    /// Destroy anything [`Harness::setup`] left behind.
    pub fn cleanup(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            instance.destroy();
        }
    }
}

/// Call `f` while a watchdog thread stops it once `timeout` has passed.
fn with_watchdog<T>(stop: StopHandle, timeout: Duration, f: impl FnOnce() -> T) -> T {
    let (done_sender, done_receiver) = mpsc::channel::<()>();

    let watchdog = thread::spawn(move || {
        if done_receiver.recv_timeout(timeout) != Err(RecvTimeoutError::Timeout) {
            return;
        }

        warn!(?timeout, "guest timed out");
        stop.request();

        // A kick that arrives before the thread enters the guest is lost, so
        // keep kicking until the run loop is done.
        loop {
            stop.kick();
            match done_receiver.recv_timeout(KICK_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }
    });

    let res = f();
    drop(done_sender);
    if watchdog.join().is_err() {
        warn!("watchdog thread panicked");
    }
    debug!("watchdog stopped");
    res
}
