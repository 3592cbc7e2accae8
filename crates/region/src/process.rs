//! Subprocess teardown
//!
//! A pool can be told about child processes it should outlive. When the pool
//! is cleared or destroyed each recorded process is signalled and reaped
//! according to its [`KillPolicy`]:
//!
//! 1. Processes that already exited are reaped without a signal
//! 2. `AfterTimeout` and `OnlyOnce` get a polite termination request;
//!    `Always` gets killed outright
//! 3. If any termination request was delivered, poll the `AfterTimeout`
//!    processes with a sleep that starts at the poll interval and doubles
//!    until they are all gone or the timeout is spent
//! 4. `AfterTimeout` survivors are killed
//! 5. Every process that was signalled is waited for, blocking

#[cfg(feature = "std")]
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// What to do with a subprocess when its pool is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KillPolicy {
    /// Leave it running
    Never,
    /// Kill it immediately
    Always,
    /// Ask it to terminate, give it until the timeout, then kill it
    AfterTimeout,
    /// Ask it to terminate once and wait for it, however long that takes
    OnlyOnce,
}

/// Signals a subprocess can receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Polite termination request
    Terminate,
    /// Forced kill
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitMode {
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    /// The process has exited and was reaped
    Exited,
    StillRunning,
}

/// Handle on a process the pool can signal and reap
pub trait Subprocess: Send + Sync {
    /// Deliver `signal`; `true` if it was delivered
    fn signal(&self, signal: Signal) -> bool;

    fn wait(&self, mode: WaitMode) -> WaitStatus;
}

/// [`Subprocess`] backed by a [`std::process::Child`]
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
#[derive(Debug)]
pub struct ChildProcess {
    child: Mutex<Child>,
}

#[cfg(feature = "std")]
impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child: Mutex::new(child),
        }
    }

    pub fn id(&self) -> u32 {
        self.child.lock().id()
    }
}

#[cfg(feature = "std")]
impl From<Child> for ChildProcess {
    fn from(child: Child) -> Self {
        Self::new(child)
    }
}

#[cfg(feature = "std")]
impl Subprocess for ChildProcess {
    fn signal(&self, signal: Signal) -> bool {
        let mut child = self.child.lock();
        match signal {
            #[cfg(unix)]
            Signal::Terminate => {
                let Ok(pid) = libc::pid_t::try_from(child.id()) else {
                    return false;
                };
                // SAFETY: plain syscall on a pid we spawned and have not reaped
                unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
            }
            #[cfg(not(unix))]
            Signal::Terminate => child.kill().is_ok(),
            Signal::Kill => child.kill().is_ok(),
        }
    }

    fn wait(&self, mode: WaitMode) -> WaitStatus {
        let mut child = self.child.lock();
        match mode {
            WaitMode::Blocking => {
                if let Err(err) = child.wait() {
                    warn!(pid = child.id(), error = %err, "blocking wait on subprocess failed");
                }
                WaitStatus::Exited
            }
            WaitMode::NonBlocking => match child.try_wait() {
                Ok(None) => WaitStatus::StillRunning,
                Ok(Some(_)) => WaitStatus::Exited,
                Err(err) => {
                    warn!(pid = child.id(), error = %err, "subprocess poll failed");
                    WaitStatus::Exited
                }
            },
        }
    }
}

pub(crate) struct SubprocessRecord {
    pub(crate) process: Arc<dyn Subprocess>,
    pub(crate) policy: KillPolicy,
}

/// Timing of the termination poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KillTiming {
    pub(crate) timeout: Duration,
    pub(crate) poll_interval: Duration,
}

/// Signal and reap every recorded process
pub(crate) fn reap(mut records: Vec<SubprocessRecord>, timing: KillTiming) {
    if records.is_empty() {
        return;
    }
    debug!(count = records.len(), "tearing down subprocesses");

    for record in &mut records {
        if record.process.wait(WaitMode::NonBlocking) == WaitStatus::Exited {
            record.policy = KillPolicy::Never;
        }
    }

    let mut need_timeout = false;
    for record in &records {
        match record.policy {
            KillPolicy::AfterTimeout | KillPolicy::OnlyOnce => {
                if record.process.signal(Signal::Terminate) {
                    need_timeout = true;
                }
            }
            KillPolicy::Always => {
                record.process.signal(Signal::Kill);
            }
            KillPolicy::Never => {}
        }
    }

    if need_timeout {
        let mut interval = timing.poll_interval;
        std::thread::sleep(interval);
        loop {
            let mut running = false;
            for record in &mut records {
                if record.policy != KillPolicy::AfterTimeout {
                    continue;
                }
                if record.process.wait(WaitMode::NonBlocking) == WaitStatus::StillRunning {
                    running = true;
                } else {
                    record.policy = KillPolicy::Never;
                }
            }
            if !running || interval >= timing.timeout {
                break;
            }
            trace!(?interval, "waiting for subprocesses to exit");
            std::thread::sleep(interval);
            interval = interval.saturating_mul(2);
        }
    }

    for record in &records {
        if record.policy == KillPolicy::AfterTimeout {
            record.process.signal(Signal::Kill);
        }
    }

    for record in &records {
        if record.policy != KillPolicy::Never {
            record.process.wait(WaitMode::Blocking);
        }
    }
}
