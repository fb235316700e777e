use crate::sup::config::{Kind, ServiceDef};
use crate::sup::state::State;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::time::Instant;

/// Why a service is held back from running even though its runlevel
/// and conditions would allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    None,
    /// Stopped by an operator, or a manual service that was never
    /// started
    Stopped,
    /// Crashed recently, a retry timer owns the next attempt
    Restarting,
    /// Hit the respawn ceiling; only operator action or a runlevel
    /// re-entry makes it eligible again
    Crashed,
    /// Command could not be resolved in PATH at start time
    Missing,
}

/// A supervised unit: the definition plus all runtime state the
/// machine tracks for it.
pub struct Service {
    pub def: ServiceDef,
    pub state: State,
    pub block: Block,
    pub pid: Pid,
    pub started_at: Option<Instant>,
    /// Short-term crash counter driving the back-off schedule
    pub restart_cnt: u8,
    /// Lifetime respawn count, for status output
    pub restarts: u64,
    /// One-shot has completed in the current runlevel
    pub once: bool,
    /// Definition changed during the latest reload and the machine has
    /// not acted on it yet
    pub dirty: bool,
    /// Removed by reload; swept from the registry once stopped
    pub doomed: bool,
    /// Targeted by the current teardown phase
    pub teardown: bool,
    pub exit: Option<WaitStatus>,
}

impl Service {
    pub fn new(def: ServiceDef) -> Service {
        // manual daemons wait for an explicit start request
        let block = if def.manual && def.kind == Kind::Service {
            Block::Stopped
        } else {
            Block::None
        };

        Service {
            def,
            state: State::Halted,
            block,
            pid: Pid::from_raw(0),
            started_at: None,
            restart_cnt: 0,
            restarts: 0,
            once: false,
            dirty: false,
            doomed: false,
            teardown: false,
            exit: None,
        }
    }

    pub fn ident(&self) -> String {
        self.def.ident()
    }

    /// Condition name asserted while this service's process is up.
    pub fn pid_cond(&self) -> String {
        format!("pid/{}", self.def.ident())
    }

    pub fn has_pid(&self) -> bool {
        self.pid.as_raw() > 1
    }

    pub fn set_pid(&mut self, pid: Pid) {
        self.pid = pid;
        self.started_at = Some(Instant::now());
    }

    pub fn clear_pid(&mut self) {
        self.pid = Pid::from_raw(0);
        self.started_at = None;
    }

    pub fn is_daemon(&self) -> bool {
        self.def.kind == Kind::Service
    }

    /// Task or run: one-shot work gated by the `once` flag.
    pub fn is_runtask(&self) -> bool {
        matches!(self.def.kind, Kind::Task | Kind::Run)
    }

    pub fn is_inetd(&self) -> bool {
        self.def.kind == Kind::Inetd
    }

    pub fn is_conn(&self) -> bool {
        self.def.kind == Kind::InetdConn
    }

    /// One line for the enumeration command.
    pub fn status_row(&self) -> String {
        let block = match self.block {
            Block::None => "",
            Block::Stopped => " (stopped)",
            Block::Restarting => " (restarting)",
            Block::Crashed => " (crashed)",
            Block::Missing => " (missing)",
        };
        format!(
            "{:<24} {:>9}{:<13} {:>7} {:<9} {}",
            self.ident(),
            self.state.to_string(),
            block,
            self.pid.as_raw(),
            self.def.runlevels_str(),
            self.def.desc
        )
    }
}
