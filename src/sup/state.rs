use std::fmt;

/// Service state
///
/// Every kind of service (daemon, task, run, inetd listener and inetd
/// connection) moves through the same set of states. Which transitions
/// are taken depends on the service kind, the runlevel and the
/// aggregate of the service's conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not running and not eligible to run in the active runlevel
    Halted,

    /// Enabled in the active runlevel, waiting for its conditions to
    /// come up before it can be started
    Ready,

    /// Process is up (for inetd listeners: the socket is open)
    Running,

    /// Process has been SIGSTOP'ed because a condition it depends on
    /// is in flux. Leaving this state always sends SIGCONT
    Waiting,

    /// SIGTERM sent, waiting for the process to be collected. A
    /// forced-kill timeout is armed while in this state
    Stopping,

    /// One-shot work has completed in the current runlevel
    Done,
}

impl State {
    /// A settled state holds no process and expects no collection.
    pub fn is_settled(&self) -> bool {
        matches!(self, State::Halted | State::Done)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            State::Halted => "halted",
            State::Ready => "ready",
            State::Running => "running",
            State::Waiting => "waiting",
            State::Stopping => "stopping",
            State::Done => "done",
        };
        f.write_str(s)
    }
}
