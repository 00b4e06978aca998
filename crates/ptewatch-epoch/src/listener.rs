use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use signal_hook::SigId;

use crate::CoordinatorError;

/// Interval at which [`HandshakeListener::wait`] checks for a handshake.
const SPIN_INTERVAL: Duration = Duration::from_millis(1);

/// Source of handshake notifications from the target.
pub trait HandshakeSource {
    /// Waits up to `timeout` for the next handshake.
    ///
    /// Returns `true` if a handshake arrived. Handshakes that arrive while
    /// nobody waits are kept until the next call, but several of them
    /// collapse into one.
    fn wait(&mut self, timeout: Duration) -> bool;
}

/// Handshake delivered as `SIGUSR1`.
///
/// The signal handler only raises a flag; the coordinator consumes it from
/// its own thread.
pub struct HandshakeListener {
    flag: Arc<AtomicBool>,
    id: SigId,
}

impl HandshakeListener {
    /// Registers a handler for `SIGUSR1`.
    pub fn register() -> Result<Self, CoordinatorError> {
        Self::register_signal(signal_hook::consts::SIGUSR1)
    }

    /// Registers a handler for `signal`.
    pub fn register_signal(signal: libc::c_int) -> Result<Self, CoordinatorError> {
        let flag = Arc::new(AtomicBool::new(false));
        let id = signal_hook::flag::register(signal, flag.clone())
            .map_err(CoordinatorError::Signal)?;

        Ok(Self { flag, id })
    }
}

impl HandshakeSource for HandshakeListener {
    fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.flag.swap(false, Ordering::AcqRel) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            std::thread::sleep(SPIN_INTERVAL.min(deadline - now));
        }
    }
}

impl Drop for HandshakeListener {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.id);
    }
}
