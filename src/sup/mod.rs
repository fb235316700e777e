pub mod cond;
pub mod config;
pub mod errors;
pub mod hooks;
pub mod inetd;
pub mod pidfile;
pub mod registry;
pub mod reload;
pub mod service;
pub mod sm;
pub mod state;
pub mod timer;

#[cfg(test)]
mod sm_test;

use crate::manager::{PowerMode, Proc};
use crate::sup::cond::CondStore;
use crate::sup::config::ServiceDef;
use crate::sup::errors::SupError;
use crate::sup::hooks::{HookPoint, Hooks};
use crate::sup::inetd::Listeners;
use crate::sup::pidfile::{PidChange, PidWatch};
use crate::sup::registry::{Registered, Registry};
use crate::sup::service::{Block, Service};
use crate::sup::timer::{TimerKind, Timers};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// How long a stopped service gets between SIGTERM and SIGKILL. Also
/// the window a daemon has to materialize its pid file.
pub const SVC_TERM_TIMEOUT: Duration = Duration::from_secs(5);

/// Respawn ceiling; beyond this a crashing service needs operator
/// attention.
pub const RESPAWN_MAX: u8 = 10;

/// Timer slot for the fleet-wide SIGKILL grace period. Not a valid
/// service identity, so it can never collide.
pub(crate) const SHUTDOWN_IDENT: &str = "@shutdown";

/// Everything the supervisor loop reacts to. Produced by the signal
/// task, the reaper, timers, pid-file watchers, inetd listeners and
/// the control socket; consumed serially by [`Sup::handle_event`].
#[derive(Debug)]
pub enum Event {
    /// Re-read configuration and reconcile (SIGHUP or control request)
    Reload,
    /// Take the system down (signals or control request)
    Shutdown(PowerMode),
    /// Toggle the global no-respawn switch
    NoRespawn(bool),
    /// A child was reaped
    ChildExit { pid: Pid, status: WaitStatus },
    /// A service timer fired
    Timer {
        ident: String,
        kind: TimerKind,
        gen: u64,
    },
    /// A watched pid file changed
    PidFile { ident: String, change: PidChange },
    /// An inetd listener accepted a connection
    InetdConn {
        ident: String,
        stream: std::net::TcpStream,
    },
    /// A control request, with its reply channel
    Control {
        cmd: Cmd,
        reply: oneshot::Sender<Reply>,
    },
    /// Deferred work: run a state-machine sweep
    Work,
}

/// Decoded control requests, the semantic side of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    Nop,
    Status { ident: String },
    Iter { index: usize },
    Start { ident: String },
    Stop { ident: String },
    Restart { ident: String },
    Signal { ident: String, signo: i32 },
    Reload,
    RunlevelGet,
    RunlevelSet { level: u32 },
    Query { ident: String },
    CondGet { name: String },
    CondSet { name: String },
    CondClear { name: String },
    Debug,
    Power(PowerMode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    AckText(String),
    Nack(String),
}

/// Supervisor paths and policy knobs.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory of service definition files
    pub conf_dir: PathBuf,
    /// Runtime state directory; conditions live in `<run_dir>/cond`,
    /// default pid files in `<run_dir>/..`
    pub run_dir: PathBuf,
    /// Where default pid files go
    pub pid_dir: PathBuf,
    /// Runlevel entered automatically once bootstrap completes
    pub default_runlevel: u8,
    /// Not pid 1: exit instead of calling reboot(2)
    pub container: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            conf_dir: PathBuf::from("/etc/rinit.d"),
            run_dir: PathBuf::from("/run/rinit"),
            pid_dir: PathBuf::from("/run"),
            default_runlevel: 2,
            container: false,
        }
    }
}

/// Where the machine as a whole is. Teardown phases gate individual
/// service transitions; see the step function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Runlevel S: waiting for all bootstrap run/task records to
    /// complete before entering the default runlevel
    Bootstrap,
    Run,
    /// Reload: waiting for removed/changed services to be collected
    ReloadTeardown,
    /// Runlevel change: waiting for services not in the next level
    RunlevelTeardown { next: u8 },
    /// Shutdown: waiting for every supervised process to be collected
    ShutdownStop(PowerMode),
    /// Shutdown: fleet SIGTERM sent, grace timer armed
    ShutdownKill(PowerMode),
}

/// The supervisor: registry, condition store, runlevel and the state
/// machine over them. Owned by a single task; everything it touches is
/// driven through [`Sup::handle_event`], one event at a time.
pub struct Sup {
    pub settings: Settings,
    pub registry: Registry,
    pub conds: CondStore,
    pub hooks: Hooks,
    pub(crate) proc: Box<dyn Proc>,
    pub(crate) timers: Box<dyn Timers>,
    pub(crate) pidwatch: Box<dyn PidWatch>,
    pub(crate) listeners: Box<dyn Listeners>,
    tx: UnboundedSender<Event>,
    pub runlevel: u8,
    pub prevlevel: u8,
    phase: Phase,
    norespawn: bool,
    work_posted: bool,
    /// Definitions waiting for reload teardown to finish
    pending: Option<Vec<ServiceDef>>,
    next_conn_id: u64,
    debug: bool,
    done: bool,
}

impl Sup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        conds: CondStore,
        proc: Box<dyn Proc>,
        timers: Box<dyn Timers>,
        pidwatch: Box<dyn PidWatch>,
        listeners: Box<dyn Listeners>,
        tx: UnboundedSender<Event>,
    ) -> Sup {
        Sup {
            settings,
            registry: Registry::new(),
            conds,
            hooks: Hooks::new(),
            proc,
            timers,
            pidwatch,
            listeners,
            tx,
            runlevel: 0,
            prevlevel: 0,
            phase: Phase::Bootstrap,
            norespawn: false,
            work_posted: false,
            pending: None,
            next_conn_id: 1,
            debug: false,
            done: false,
        }
    }

    /// Register one definition at boot time. Later files win on
    /// identity collisions, with a warning.
    pub fn register(&mut self, def: ServiceDef) {
        let ident = def.ident();
        match self.registry.register(def) {
            Registered::Inserted => debug!("registered service {}", ident),
            Registered::Updated => warn!("service {} redefined, later file wins", ident),
            Registered::Unchanged => warn!("service {} defined twice", ident),
        }
    }

    /// Kick the machine after boot-time registration.
    pub fn bootstrap(&mut self) {
        info!("bootstrapping, runlevel S");
        self.hooks.run(HookPoint::Banner);
        let _ = self.conds.set(HookPoint::Banner.cond_name());
        self.schedule_work();
    }

    /// The supervisor loop is finished; the caller should return.
    pub fn finished(&self) -> bool {
        self.done
    }

    /// Post a deferred sweep. Re-posting while one is pending is a
    /// no-op, which is what coalesces bursts of condition changes into
    /// a single sweep per loop turn.
    pub fn schedule_work(&mut self) {
        if self.work_posted {
            return;
        }
        self.work_posted = true;
        let _ = self.tx.send(Event::Work);
    }

    pub(crate) fn in_teardown(&self) -> bool {
        matches!(
            self.phase,
            Phase::ReloadTeardown
                | Phase::RunlevelTeardown { .. }
                | Phase::ShutdownStop(_)
                | Phase::ShutdownKill(_)
        )
    }

    pub(crate) fn shutting_down(&self) -> bool {
        matches!(self.phase, Phase::ShutdownStop(_) | Phase::ShutdownKill(_))
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Work => {
                self.work_posted = false;
                self.sweep();
            }
            Event::Reload => {
                if let Err(err) = self.reload_from_disk() {
                    warn!("reload failed: {:#}", err);
                }
            }
            Event::Shutdown(mode) => self.start_shutdown(mode),
            Event::NoRespawn(stop) => {
                info!(
                    "{} normal supervision",
                    if stop { "suspending" } else { "resuming" }
                );
                self.norespawn = stop;
                if !stop {
                    self.schedule_work();
                }
            }
            Event::ChildExit { pid, status } => self.collect(pid, status),
            Event::Timer { ident, gen, .. } => self.timer_fired(&ident, gen),
            Event::PidFile { ident, change } => self.pidfile_event(&ident, change),
            Event::InetdConn { ident, stream } => self.accept_conn(&ident, stream),
            Event::Control { cmd, reply } => {
                let r = self.handle_cmd(cmd);
                let _ = reply.send(r);
            }
        }
    }

    fn handle_cmd(&mut self, cmd: Cmd) -> Reply {
        match cmd {
            Cmd::Nop => Reply::Ack,

            Cmd::Status { ident } => match self.registry.get(&ident) {
                Some(svc) => Reply::AckText(status_json(svc)),
                None => Reply::Nack(SupError::unknown_service(ident).to_string()),
            },

            Cmd::Iter { index } => {
                let idents = self.registry.idents();
                match idents.get(index) {
                    Some(ident) => {
                        let svc = self.registry.get(ident).unwrap();
                        Reply::AckText(svc.status_row())
                    }
                    None => Reply::Nack("end".into()),
                }
            }

            Cmd::Start { ident } => match self.op_start(&ident) {
                Ok(()) => Reply::Ack,
                Err(err) => Reply::Nack(err.to_string()),
            },

            Cmd::Stop { ident } => match self.op_stop(&ident) {
                Ok(()) => Reply::Ack,
                Err(err) => Reply::Nack(err.to_string()),
            },

            Cmd::Restart { ident } => match self.op_restart(&ident) {
                Ok(()) => Reply::Ack,
                Err(err) => Reply::Nack(err.to_string()),
            },

            Cmd::Signal { ident, signo } => match self.op_signal(&ident, signo) {
                Ok(()) => Reply::Ack,
                Err(err) => Reply::Nack(err.to_string()),
            },

            Cmd::Reload => match self.reload_from_disk() {
                Ok(()) => Reply::Ack,
                Err(err) => Reply::Nack(format!("{:#}", err)),
            },

            Cmd::RunlevelGet => {
                let prev = runlevel_char(self.prevlevel);
                Reply::AckText(format!("{} {}", prev, runlevel_char(self.runlevel)))
            }

            Cmd::RunlevelSet { level } => {
                if level > 9 {
                    return Reply::Nack(SupError::InvalidRunlevel { level }.to_string());
                }
                match self.set_runlevel(level as u8) {
                    Ok(()) => Reply::Ack,
                    Err(err) => Reply::Nack(err.to_string()),
                }
            }

            Cmd::Query { ident } => {
                if self.registry.get(&ident).is_some() {
                    Reply::Ack
                } else {
                    Reply::Nack(SupError::unknown_service(ident).to_string())
                }
            }

            Cmd::CondGet { name } => {
                if !cond::valid_name(&name) {
                    return Reply::Nack(SupError::invalid_condition(name).to_string());
                }
                Reply::AckText(self.conds.get(&name).to_string())
            }

            Cmd::CondSet { name } => match self.conds.set(&name) {
                Ok(changed) => {
                    if changed {
                        self.schedule_work();
                    }
                    Reply::Ack
                }
                Err(err) => Reply::Nack(err.to_string()),
            },

            Cmd::CondClear { name } => match self.conds.clear(&name) {
                Ok(changed) => {
                    if changed {
                        self.schedule_work();
                    }
                    Reply::Ack
                }
                Err(err) => Reply::Nack(err.to_string()),
            },

            Cmd::Debug => {
                self.debug = !self.debug;
                log::set_max_level(if self.debug {
                    log::LevelFilter::Debug
                } else {
                    log::LevelFilter::Info
                });
                Reply::AckText(format!("debug {}", if self.debug { "on" } else { "off" }))
            }

            Cmd::Power(mode) => {
                self.start_shutdown(mode);
                Reply::Ack
            }
        }
    }

    /// Operator start: lift whatever block is in the way and let the
    /// machine take it from halted.
    fn op_start(&mut self, ident: &str) -> Result<(), SupError> {
        if self.shutting_down() {
            return Err(SupError::ShuttingDown);
        }
        let svc = self
            .registry
            .get_mut(ident)
            .ok_or_else(|| SupError::unknown_service(ident))?;
        svc.block = Block::None;
        svc.restart_cnt = 0;
        self.timers.cancel(ident);
        self.schedule_work();
        Ok(())
    }

    fn op_stop(&mut self, ident: &str) -> Result<(), SupError> {
        let svc = self
            .registry
            .get_mut(ident)
            .ok_or_else(|| SupError::unknown_service(ident))?;
        svc.block = Block::Stopped;
        // stopping something that has no process is still a success
        self.stop_svc(ident);
        self.schedule_work();
        Ok(())
    }

    fn op_restart(&mut self, ident: &str) -> Result<(), SupError> {
        if self.shutting_down() {
            return Err(SupError::ShuttingDown);
        }
        let svc = self
            .registry
            .get_mut(ident)
            .ok_or_else(|| SupError::unknown_service(ident))?;
        svc.block = Block::None;
        svc.restart_cnt = 0;

        let sighup = svc.def.sighup;
        let running = svc.state == state::State::Running && svc.has_pid();
        if running && sighup {
            self.restart_svc(ident);
        } else if running {
            // collect + halted + ready brings it back up
            self.stop_svc(ident);
        }
        self.schedule_work();
        Ok(())
    }

    fn op_signal(&mut self, ident: &str, signo: i32) -> Result<(), SupError> {
        let sig = Signal::try_from(signo).map_err(|_| SupError::InvalidSignal { signo })?;
        let svc = self
            .registry
            .get(ident)
            .ok_or_else(|| SupError::unknown_service(ident))?;
        if !svc.has_pid() {
            return Err(SupError::service_is_down(ident));
        }
        let pid = svc.pid;
        if let Err(err) = self.proc.signal(pid, sig) {
            warn!("failed to signal {}: {:#}", ident, err);
        }
        Ok(())
    }

    /// Mutate one service record, if it exists.
    pub(crate) fn with_svc<R>(
        &mut self,
        ident: &str,
        f: impl FnOnce(&mut Service) -> R,
    ) -> Option<R> {
        self.registry.get_mut(ident).map(f)
    }
}

fn runlevel_char(level: u8) -> String {
    if level == 0 {
        "S".into()
    } else {
        level.to_string()
    }
}

/// One service as a JSON document, for the status command.
fn status_json(svc: &Service) -> String {
    let exit = svc.exit.map(|status| match status {
        WaitStatus::Exited(_, code) => format!("exit {}", code),
        WaitStatus::Signaled(_, sig, _) => format!("signal {:?}", sig),
        other => format!("{:?}", other),
    });

    serde_json::json!({
        "name": svc.ident(),
        "cmd": svc.def.cmd,
        "state": svc.state.to_string(),
        "block": format!("{:?}", svc.block).to_lowercase(),
        "pid": svc.pid.as_raw(),
        "runlevels": svc.def.runlevels_str(),
        "restarts": svc.restarts,
        "once": svc.once,
        "dirty": svc.dirty,
        "exit": exit,
        "description": svc.def.desc,
    })
    .to_string()
}
