use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kvmtest::{
    GuestImage, Harness, HarnessConfig, TracingReporter, layout::DEFAULT_RAM_SIZE,
};
use tracing::{error, warn};

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt::init();

    let kvmtest = Kvmtest::parse();
    match kvmtest.subcommand {
        KvmtestSubcommand::Run(args) => run(args),
    }
}

#[derive(Parser)]
#[command(version)]
struct Kvmtest {
    #[command(subcommand)]
    subcommand: KvmtestSubcommand,
}

#[derive(Subcommand)]
enum KvmtestSubcommand {
    /// Run a test payload.
    Run(RunCommand),
}

#[derive(Args)]
struct RunCommand {
    /// Path to the flat binary to load at the kernel base.
    #[arg(long, value_name = "PATH")]
    payload: PathBuf,
    /// Path to the code to place at the reset vector.
    #[arg(long, value_name = "PATH")]
    reset_code: Option<PathBuf>,
    /// Guest RAM size in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_RAM_SIZE, env = "KVMTEST_RAM_SIZE")]
    ram_size: usize,
    /// Stop the guest after this many seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

fn run(run: RunCommand) -> Result<ExitCode> {
    let payload = std::fs::read(&run.payload).context("failed to read payload")?;
    let reset_code = run
        .reset_code
        .map(std::fs::read)
        .transpose()
        .context("failed to read reset code")?;

    let mut image = GuestImage::new(&payload);
    if let Some(reset_code) = &reset_code {
        image = image.with_reset_code(reset_code);
    }

    let config = HarnessConfig {
        ram_size: run.ram_size,
        timeout: run.timeout.map(Duration::from_secs),
        ..HarnessConfig::default()
    };

    let res = kvmtest::open_kvm().and_then(|kvm| {
        let mut harness = Harness::new(&kvm, config);
        harness.setup(&image)?;
        harness.run(&mut TracingReporter)
    });

    let result = match res {
        Ok(summary) => {
            if summary.verdicts.is_empty() {
                warn!("guest didn't report any results");
            }
            summary.outcome()
        }
        Err(err) => {
            error!("{err}");
            err.result_type()
        }
    };
    Ok(ExitCode::from(result.exit_code()))
}
