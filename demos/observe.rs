//! Runs a workload under observation and logs the pages it touches.
//!
//! ```text
//! observe <program> [args...]
//! ```
//!
//! The program is started with an extra `--parent-pid=<pid>` argument and is
//! expected to send `SIGUSR1` to the observer once after publishing its
//! embedding table addresses, then twice around every lookup, waiting for
//! the `SIGUSR1` acknowledgement each time.
//!
//! Settings are read from `PTEWATCH_*` environment variables.

use std::{
    fs::File,
    io::{BufWriter, Write},
    process::{Child, Command},
    time::Duration,
};

use ptewatch::{
    BackendKind, ObserverConfig, PageTableAccess, Pid, RangeMode,
    channel::ChannelClient,
    epoch::{
        EpochCoordinator, FixedRanges, HandshakeListener, ProcessTarget, RangeSource, RunSummary,
    },
};

/// Size of one embedding vector in bytes.
const EMB_SIZE: u64 = 64;

/// Number of rows of each embedding table.
const TABLE_SIZES: [u64; 26] = [
    1460, 583, 10131227, 2202608, 305, 24, 12517, 633, 3, 93145, 5683, 8351593, 3194, 27, 14992,
    5461306, 10, 5652, 2173, 4, 7046547, 18, 15, 286181, 105, 142572,
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(program) = args.next() else {
        eprintln!("usage: observe <program> [args...]");
        std::process::exit(2);
    };

    let config = ObserverConfig::from_env()?;

    let ranges = match &config.ranges {
        RangeMode::Fixed { path, policy } => RangeSource::fixed(
            FixedRanges::from_tables(path, EMB_SIZE, &TABLE_SIZES),
            *policy,
        ),
        RangeMode::Mapped { .. } => config.range_source(Vec::new()),
    };

    let output: Box<dyn Write> = match &config.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    };

    // Registered before the workload starts, so no handshake is lost.
    let mut handshakes = HandshakeListener::register()?;

    // The backend is opened first; an unavailable one never starts the
    // workload.
    let workload = Workload {
        program,
        args: args.collect(),
    };

    let summary = match config.backend {
        BackendKind::Channel => {
            let access = ChannelClient::open(config.endpoint())?.with_capacity(config.capacity);
            observe(access, &workload, ranges, output, config.poll_interval, &mut handshakes)?
        }
        BackendKind::Idle => {
            let access = config.idle_backend()?;
            observe(access, &workload, ranges, output, config.poll_interval, &mut handshakes)?
        }
    };

    tracing::info!(%summary, "observation finished");
    Ok(())
}

struct Workload {
    program: String,
    args: Vec<String>,
}

impl Workload {
    fn spawn(&self) -> std::io::Result<Child> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(format!("--parent-pid={}", std::process::id()))
            .spawn()?;

        tracing::info!(program = %self.program, pid = child.id(), "workload started");
        Ok(child)
    }
}

fn observe<Access>(
    access: Access,
    workload: &Workload,
    ranges: RangeSource,
    output: Box<dyn Write>,
    poll_interval: Duration,
    handshakes: &mut HandshakeListener,
) -> Result<RunSummary, Box<dyn std::error::Error>>
where
    Access: PageTableAccess,
{
    let mut child = workload.spawn()?;
    let target = ProcessTarget::child(Pid(child.id() as i32));

    let summary = EpochCoordinator::new(access, target, ranges, output).and_then(|coordinator| {
        coordinator
            .with_poll_interval(poll_interval)
            .run(handshakes)
    });

    // A fatal error leaves the workload without an observer.
    if summary.is_err() {
        tracing::warn!(pid = child.id(), "observation failed, stopping workload");
        let _ = child.kill();
        let _ = child.wait();
    }

    Ok(summary?)
}
