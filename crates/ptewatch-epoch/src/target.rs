use ptewatch_core::Pid;

/// The observed process, as seen by the coordinator.
pub trait Target {
    /// Returns the process ID of the target.
    fn pid(&self) -> Pid;

    /// Checks if the target is still running.
    ///
    /// Must not block.
    fn is_alive(&mut self) -> bool;

    /// Notifies the target that it may proceed.
    fn acknowledge(&mut self) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    Child,
    Attached,
}

/// A target process acknowledged with `SIGUSR1`.
#[derive(Debug)]
pub struct ProcessTarget {
    pid: Pid,
    relation: Relation,
    exited: bool,
}

impl ProcessTarget {
    /// Creates a target for a child of the calling process.
    ///
    /// Termination is detected with a non-blocking `waitpid`, which also
    /// reaps the child.
    pub fn child(pid: Pid) -> Self {
        Self {
            pid,
            relation: Relation::Child,
            exited: false,
        }
    }

    /// Creates a target for an arbitrary process.
    ///
    /// Termination is detected by probing the process with signal 0.
    pub fn attach(pid: Pid) -> Self {
        Self {
            pid,
            relation: Relation::Attached,
            exited: false,
        }
    }

    fn probe_child(&self) -> bool {
        let mut status = 0;

        // SAFETY: `status` is a valid pointer for the duration of the call.
        let result = unsafe { libc::waitpid(self.pid.0, &mut status, libc::WNOHANG) };

        match result {
            0 => true,
            -1 => {
                let err = std::io::Error::last_os_error();
                tracing::debug!(pid = %self.pid, %err, "waitpid failed");
                false
            }
            _ => {
                tracing::debug!(pid = %self.pid, status, "target exited");
                false
            }
        }
    }

    fn probe_attached(&self) -> bool {
        // SAFETY: signal 0 performs the permission and existence checks only.
        if unsafe { libc::kill(self.pid.0, 0) } == 0 {
            return true;
        }

        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

impl Target for ProcessTarget {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        if self.exited {
            return false;
        }

        let alive = match self.relation {
            Relation::Child => self.probe_child(),
            Relation::Attached => self.probe_attached(),
        };

        self.exited = !alive;
        alive
    }

    fn acknowledge(&mut self) -> std::io::Result<()> {
        // SAFETY: `kill` has no memory safety requirements.
        if unsafe { libc::kill(self.pid.0, libc::SIGUSR1) } == -1 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    }
}
