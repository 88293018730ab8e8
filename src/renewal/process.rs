use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    NotFound,
    NoPermission,
}

/// Liveness checks and signal delivery for recorded daemon processes
pub trait ProcessController: Send + Sync {
    fn check_process(&self, pid: u32) -> io::Result<ProcessStatus>;

    fn send_signal(&self, pid: u32, signal: Signal) -> io::Result<()>;
}

pub struct UnixProcessController;

impl UnixProcessController {
    fn to_pid_t(pid: u32) -> io::Result<libc::pid_t> {
        // pid 0 and negative pids address process groups, never a single daemon
        match libc::pid_t::try_from(pid) {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "PID out of range")),
        }
    }
}

impl ProcessController for UnixProcessController {
    fn check_process(&self, pid: u32) -> io::Result<ProcessStatus> {
        let pid_t = Self::to_pid_t(pid)?;

        let result = unsafe { libc::kill(pid_t, 0) };
        if result == 0 {
            return Ok(ProcessStatus::Running);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(ProcessStatus::NotFound),
            Some(libc::EPERM) => Ok(ProcessStatus::NoPermission),
            _ => Err(err),
        }
    }

    fn send_signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let pid_t = Self::to_pid_t(pid)?;

        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };

        let result = unsafe { libc::kill(pid_t, sig) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
