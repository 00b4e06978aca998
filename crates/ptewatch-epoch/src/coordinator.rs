use std::{
    io::Write,
    time::{Duration, Instant},
};

use ptewatch_core::{AddressRange, PageTableAccess};

use crate::{CoordinatorError, EpochLog, HandshakeSource, RangeSource, Target};

/// Default interval between two checks for target termination.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State of the epoch protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    /// Waiting for the handshake announcing the address list.
    AwaitingRanges,

    /// Ready to arm the next epoch.
    Idle,

    /// Access indicators are reset; the target performs its unit of work.
    Armed,

    /// The last epoch is recorded.
    Sampled,
}

impl std::fmt::Display for EpochState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingRanges => f.write_str("awaiting-ranges"),
            Self::Idle => f.write_str("idle"),
            Self::Armed => f.write_str("armed"),
            Self::Sampled => f.write_str("sampled"),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Number of epochs recorded.
    pub epochs: u64,

    /// Number of pages recorded over all epochs.
    pub pages: u64,

    /// Index of the epoch that was armed but never sampled.
    pub dropped_epoch: Option<u64>,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} epochs, {} pages", self.epochs, self.pages)?;

        if let Some(epoch) = self.dropped_epoch {
            write!(f, ", epoch {epoch} dropped")?;
        }

        Ok(())
    }
}

/// Observer side of the epoch protocol.
///
/// Every handshake from the target advances the state machine:
///
/// ```text
/// AwaitingRanges ──▶ Idle ──▶ Armed ──▶ Sampled ──▶ Armed ──▶ ...
/// ```
///
/// Arming clears the access indicators of the epoch's ranges; sampling
/// scans them and appends the accessed pages to the log. The target is
/// acknowledged after both, so its unit of work is bracketed by the two.
pub struct EpochCoordinator<Access, T, W>
where
    Access: PageTableAccess,
    T: Target,
    W: Write,
{
    access: Access,
    target: T,
    ranges: RangeSource,
    log: EpochLog<W>,
    state: EpochState,
    epoch: u64,
    armed: Vec<AddressRange>,
    started: Instant,
    poll_interval: Duration,
}

impl<Access, T, W> EpochCoordinator<Access, T, W>
where
    Access: PageTableAccess,
    T: Target,
    W: Write,
{
    /// Creates a new coordinator.
    ///
    /// A fixed address list loaded at startup is read here; failure to
    /// read it is fatal.
    pub fn new(
        access: Access,
        target: T,
        mut ranges: RangeSource,
        writer: W,
    ) -> Result<Self, CoordinatorError> {
        let state = if ranges.awaits_handshake() {
            EpochState::AwaitingRanges
        } else {
            ranges.load()?;
            EpochState::Idle
        };

        Ok(Self {
            access,
            target,
            ranges,
            log: EpochLog::new(writer),
            state,
            epoch: 0,
            armed: Vec::new(),
            started: Instant::now(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Sets the interval between two checks for target termination.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> EpochState {
        self.state
    }

    /// Returns the index of the current or last epoch.
    ///
    /// Epochs are numbered from 1; 0 means no epoch was armed yet.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns the ranges of the armed epoch.
    pub fn armed_ranges(&self) -> &[AddressRange] {
        &self.armed
    }

    /// Returns the epoch log.
    pub fn log(&self) -> &EpochLog<W> {
        &self.log
    }

    /// Returns the target.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Consumes the coordinator and returns the log.
    pub fn into_log(self) -> EpochLog<W> {
        self.log
    }

    /// Advances the state machine by one handshake.
    pub fn on_handshake(&mut self) -> Result<(), CoordinatorError> {
        match self.state {
            EpochState::AwaitingRanges => {
                self.ranges.load()?;
                self.state = EpochState::Idle;
                Ok(())
            }
            EpochState::Idle | EpochState::Sampled => self.arm(),
            EpochState::Armed => self.sample(),
        }
    }

    /// Drives the protocol until the target terminates.
    ///
    /// An epoch that is armed when the target terminates is dropped.
    pub fn run<H>(&mut self, handshakes: &mut H) -> Result<RunSummary, CoordinatorError>
    where
        H: HandshakeSource,
    {
        let pid = self.target.pid();
        tracing::info!(%pid, state = %self.state, "observing target");

        while self.target.is_alive() {
            if handshakes.wait(self.poll_interval) {
                self.on_handshake()?;
            }
        }

        let dropped_epoch = self.abandon();

        let summary = RunSummary {
            epochs: self.log.epochs(),
            pages: self.log.pages(),
            dropped_epoch,
        };

        tracing::info!(%pid, %summary, "target exited");
        Ok(summary)
    }

    fn arm(&mut self) -> Result<(), CoordinatorError> {
        let pid = self.target.pid();
        self.epoch += 1;

        let begin = Instant::now();
        let ranges = self.ranges.ranges(pid)?;

        // Ranges that failed to clear still carry stale indicators.
        let armed = self.access.clear_ranges(pid, &ranges)?;

        tracing::debug!(
            %pid,
            epoch = self.epoch,
            ranges = ranges.len(),
            armed = armed.len(),
            elapsed = ?begin.elapsed(),
            "epoch armed"
        );

        self.armed = armed;
        self.state = EpochState::Armed;
        self.acknowledge()
    }

    fn sample(&mut self) -> Result<(), CoordinatorError> {
        let pid = self.target.pid();
        let elapsed_us = self.started.elapsed().as_micros();

        let begin = Instant::now();
        let pages = self.access.scan_ranges(pid, &self.armed)?;
        self.log
            .record(self.epoch, elapsed_us, &pages)
            .map_err(CoordinatorError::Log)?;

        tracing::debug!(
            %pid,
            epoch = self.epoch,
            pages = pages.len(),
            elapsed = ?begin.elapsed(),
            "epoch sampled"
        );

        self.armed.clear();
        self.state = EpochState::Sampled;
        self.acknowledge()
    }

    fn acknowledge(&mut self) -> Result<(), CoordinatorError> {
        match self.target.acknowledge() {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
                // Termination is picked up by the next liveness check.
                tracing::warn!(pid = %self.target.pid(), "target gone before acknowledgement");
                Ok(())
            }
            Err(err) => Err(CoordinatorError::Acknowledge(err)),
        }
    }

    fn abandon(&mut self) -> Option<u64> {
        if self.state != EpochState::Armed {
            return None;
        }

        tracing::warn!(
            pid = %self.target.pid(),
            epoch = self.epoch,
            "target exited during epoch, dropping it"
        );

        self.armed.clear();
        self.state = EpochState::Idle;
        Some(self.epoch)
    }
}
