//! The service state machine and the phases that sequence it: sweeps,
//! crash-respawn, configuration reload, runlevel changes and shutdown.

use crate::manager::PowerMode;
use crate::sup::cond::CondState;
use crate::sup::config::{self, Kind, PidFile, ServiceDef};
use crate::sup::errors::SupError;
use crate::sup::hooks::HookPoint;
use crate::sup::pidfile::{self, PidChange};
use crate::sup::registry::Registered;
use crate::sup::reload;
use crate::sup::service::{Block, Service};
use crate::sup::state::State;
use crate::sup::timer::TimerKind;
use crate::sup::{Phase, Sup, RESPAWN_MAX, SHUTDOWN_IDENT, SVC_TERM_TIMEOUT};
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::time::Duration;

/// First respawn attempt comes almost immediately after the crash.
const RETRY_FIRST: Duration = Duration::from_millis(10);
/// Back-off for the first half of the respawn budget.
const RETRY_SHORT: Duration = Duration::from_secs(2);
/// Back-off once the budget is half spent.
const RETRY_LONG: Duration = Duration::from_secs(5);
/// Between the fleet-wide SIGTERM and SIGKILL on the way down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What a step did to one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Unchanged,
    Changed,
    /// The record is gone (finished inetd connection)
    Removed,
}

/// Read-only snapshot of the fields a transition decision needs.
#[derive(Clone, Copy)]
struct View {
    state: State,
    enabled: bool,
    agg: CondState,
    kind: Kind,
    pid: Pid,
    dirty: bool,
    sighup: bool,
}

impl Sup {
    /// Only services whose runlevel mask includes the active runlevel,
    /// with no block in the way, are eligible. One-shots drop out once
    /// they have completed in this runlevel.
    pub(crate) fn enabled(&self, svc: &Service) -> bool {
        if svc.is_conn() {
            // connection children live exactly as long as their process
            return true;
        }
        if svc.block != Block::None || svc.doomed {
            return false;
        }
        if !svc.def.in_runlevel(self.runlevel) {
            return false;
        }
        if svc.is_runtask() && svc.once {
            return false;
        }
        true
    }

    fn view(&self, ident: &str) -> Option<View> {
        let svc = self.registry.get(ident)?;
        Some(View {
            state: svc.state,
            enabled: self.enabled(svc),
            agg: self.conds.agg(&svc.def.cond),
            kind: svc.def.kind,
            pid: svc.pid,
            dirty: svc.dirty,
            sighup: svc.def.sighup,
        })
    }

    /// Transition one service. Re-enters until the service is stable,
    /// then schedules a sweep if anything moved, since one service
    /// changing state can unblock others.
    pub(crate) fn step(&mut self, ident: &str) -> Step {
        let Some(mut v) = self.view(ident) else {
            return Step::Removed;
        };
        let mut changed = false;

        loop {
            match v.state {
                State::Halted => {
                    if v.enabled {
                        self.set_state(ident, State::Ready);
                    }
                }

                State::Done => {
                    if v.kind == Kind::InetdConn {
                        self.unregister(ident);
                        self.schedule_work();
                        return Step::Removed;
                    }
                    if v.dirty {
                        self.set_state(ident, State::Halted);
                    }
                }

                State::Stopping => {
                    if v.pid.as_raw() == 0 {
                        // collected normally, no need for the big hammer
                        self.timers.cancel(ident);
                        match v.kind {
                            Kind::Service | Kind::Inetd => self.set_state(ident, State::Halted),
                            Kind::Task | Kind::Run | Kind::InetdConn => {
                                self.set_state(ident, State::Done)
                            }
                        }
                    }
                }

                State::Ready => {
                    if !v.enabled {
                        self.set_state(ident, State::Halted);
                    } else if v.agg == CondState::On && !self.in_teardown() {
                        // wait for a fleet teardown to finish before
                        // bringing anything up
                        self.start_svc(ident);
                    }
                }

                State::Running => {
                    if !v.enabled {
                        self.stop_svc(ident);
                    } else if v.pid.as_raw() == 0 && v.kind != Kind::Inetd {
                        match v.kind {
                            Kind::Service => self.daemon_lost(ident),
                            Kind::InetdConn => self.set_state(ident, State::Stopping),
                            Kind::Task | Kind::Run => {
                                self.with_svc(ident, |s| s.once = true);
                                self.set_state(ident, State::Stopping);
                            }
                            Kind::Inetd => unreachable!(),
                        }
                    } else {
                        match v.agg {
                            CondState::Off => self.stop_svc(ident),
                            CondState::Flux => {
                                if v.pid.as_raw() > 1 {
                                    let _ = self.proc.signal(v.pid, Signal::SIGSTOP);
                                }
                                self.set_state(ident, State::Waiting);
                            }
                            CondState::On => {
                                if v.dirty {
                                    if v.sighup {
                                        if !self.in_teardown() {
                                            self.restart_svc(ident);
                                            self.with_svc(ident, |s| s.dirty = false);
                                        }
                                    } else {
                                        self.stop_svc(ident);
                                        self.with_svc(ident, |s| s.dirty = false);
                                    }
                                }
                            }
                        }
                    }
                }

                State::Waiting => {
                    if !v.enabled {
                        if v.pid.as_raw() > 1 {
                            let _ = self.proc.signal(v.pid, Signal::SIGCONT);
                        }
                        self.stop_svc(ident);
                    } else if v.pid.as_raw() == 0 {
                        // lost while frozen; go around again
                        self.with_svc(ident, |s| {
                            s.restart_cnt = s.restart_cnt.saturating_add(1)
                        });
                        self.set_state(ident, State::Ready);
                    } else {
                        match v.agg {
                            CondState::On => {
                                let _ = self.proc.signal(v.pid, Signal::SIGCONT);
                                self.set_state(ident, State::Running);
                                if !v.dirty && v.kind == Kind::Service {
                                    // the freeze turned out to be
                                    // spurious, republish our view
                                    let cond = format!("pid/{}", ident);
                                    let _ = self.conds.set(&cond);
                                }
                            }
                            CondState::Off => {
                                let _ = self.proc.signal(v.pid, Signal::SIGCONT);
                                self.stop_svc(ident);
                            }
                            CondState::Flux => (),
                        }
                    }
                }
            }

            let Some(next) = self.view(ident) else {
                if changed {
                    self.schedule_work();
                }
                return Step::Removed;
            };
            if next.state == v.state {
                break;
            }
            v = next;
            changed = true;
        }

        if changed {
            self.schedule_work();
            Step::Changed
        } else {
            Step::Unchanged
        }
    }

    /// Step every service, in registration order, until a full pass
    /// changes nothing.
    pub(crate) fn sweep(&mut self) {
        loop {
            let mut changed = false;
            for ident in self.registry.idents() {
                match self.step(&ident) {
                    Step::Changed | Step::Removed => changed = true,
                    Step::Unchanged => (),
                }
            }
            if !changed {
                break;
            }
        }
        self.check_phase();
    }

    pub(crate) fn set_state(&mut self, ident: &str, new: State) {
        let Some(svc) = self.registry.get_mut(ident) else {
            return;
        };
        if svc.state == new {
            return;
        }
        debug!("{:>20}({}): {} -> {}", ident, svc.pid, svc.state, new);
        svc.state = new;
        let inetd = svc.is_inetd();
        if new == State::Stopping && !inetd {
            // if the pid isn't collected in time, kill it
            self.timers.arm(ident, TimerKind::Kill, SVC_TERM_TIMEOUT);
        }
    }

    fn start_svc(&mut self, ident: &str) {
        if self.norespawn {
            debug!("{}: norespawn in effect, not starting", ident);
            return;
        }
        let Some(svc) = self.registry.get(ident) else {
            return;
        };
        let kind = svc.def.kind;
        let cmd = svc.def.cmd.clone();

        if kind == Kind::Inetd {
            let addr = svc.def.listen.clone().unwrap_or_default();
            self.listeners.open(ident, &addr);
            self.with_svc(ident, |s| s.dirty = false);
            self.set_state(ident, State::Running);
            return;
        }

        if !self.proc.exists(&cmd) {
            error!("service {} does not exist!", cmd);
            self.with_svc(ident, |s| s.block = Block::Missing);
            return;
        }

        let spawned = {
            let svc = self.registry.get(ident).unwrap();
            self.proc.spawn(svc)
        };
        let pid = match spawned {
            Ok(pid) => pid,
            Err(err) => {
                error!("service {} failed to start: {:#}", ident, err);
                self.with_svc(ident, |s| s.restart_cnt = s.restart_cnt.saturating_add(1));
                // transient, retry on the back-off schedule
                self.timers.arm_if_idle(ident, TimerKind::Retry, RETRY_SHORT);
                return;
            }
        };

        self.with_svc(ident, |s| {
            s.set_pid(pid);
            s.dirty = false;
        });
        self.set_state(ident, State::Running);

        match kind {
            Kind::Run => {
                // sequential by contract: everything else waits
                let status = self.proc.wait(pid);
                if let Err(err) = &status {
                    warn!("failed to await {}: {:#}", ident, err);
                }
                self.with_svc(ident, |s| {
                    s.exit = status.ok();
                    s.clear_pid();
                    s.once = true;
                });
                self.set_state(ident, State::Stopping);
            }
            Kind::Service => self.watch_pidfile(ident, pid),
            _ => (),
        }
    }

    fn watch_pidfile(&mut self, ident: &str, pid: Pid) {
        let Some(svc) = self.registry.get(ident) else {
            return;
        };
        let Some(path) = svc.def.pidfile_path(&self.settings.pid_dir) else {
            return;
        };
        let own = svc.def.owns_pidfile();

        self.pidwatch.watch(ident, &path);
        if !own {
            if let Err(err) = pidfile::write_pid(&path, pid) {
                warn!("failed writing pid file {}: {}", path.display(), err);
            }
        }
        // a daemon that never materializes its pid file is a crash
        self.timers
            .arm_if_idle(ident, TimerKind::PidFile, SVC_TERM_TIMEOUT);
    }

    pub(crate) fn stop_svc(&mut self, ident: &str) {
        let Some(svc) = self.registry.get(ident) else {
            return;
        };
        if matches!(svc.state, State::Halted | State::Done | State::Stopping) {
            return;
        }
        let inetd = svc.is_inetd();
        let pid = svc.pid;

        if inetd {
            self.listeners.close(ident);
            self.set_state(ident, State::Stopping);
            return;
        }

        self.timers.cancel(ident);
        if pid.as_raw() <= 1 {
            // nothing to deliver to; stopping is still a success
            return;
        }

        debug!("sending SIGTERM to {} pid {}", ident, pid);
        self.set_state(ident, State::Stopping);
        if let Err(err) = self.proc.signal(pid, Signal::SIGTERM) {
            warn!("failed to stop {}: {:#}", ident, err);
        }
    }

    /// The forced-kill timeout hit while stopping.
    fn kill_svc(&mut self, ident: &str) {
        let Some(svc) = self.registry.get(ident) else {
            return;
        };
        let pid = svc.pid;
        if pid.as_raw() <= 1 {
            debug!("{}: aborting SIGKILL, already terminated", ident);
            return;
        }
        warn!("{}: did not stop in time, sending SIGKILL to pid {}", ident, pid);
        let _ = self.proc.signal(pid, Signal::SIGKILL);
    }

    /// Deliver SIGHUP to a service that advertises support for it, then
    /// touch its pid file so the re-assertion is observed.
    pub(crate) fn restart_svc(&mut self, ident: &str) {
        if self.norespawn {
            return;
        }
        let Some(svc) = self.registry.get(ident) else {
            return;
        };
        if !svc.def.sighup {
            return;
        }
        let pid = svc.pid;
        if pid.as_raw() <= 1 {
            debug!("{}: bad pid {} for SIGHUP", ident, pid);
            self.with_svc(ident, |s| s.clear_pid());
            return;
        }
        let touch = if svc.def.owns_pidfile() {
            None
        } else {
            svc.def.pidfile_path(&self.settings.pid_dir)
        };

        info!("restarting {} via SIGHUP", ident);
        let _ = self.proc.signal(pid, Signal::SIGHUP);
        if let Some(path) = touch {
            let _ = pidfile::write_pid(&path, pid);
        }
    }

    /// A daemon's process went away while it was supposed to run.
    fn daemon_lost(&mut self, ident: &str) {
        self.with_svc(ident, |s| s.block = Block::Restarting);
        self.set_state(ident, State::Halted);
        debug!("delayed restart of {}", ident);
        // the pid-file window is moot now, but an earlier back-off
        // timer keeps its cadence
        if self.timers.armed(ident) == Some(TimerKind::PidFile) {
            self.timers.cancel(ident);
        }
        self.timers.arm_if_idle(ident, TimerKind::Retry, RETRY_FIRST);
    }

    /// The retry timer fired: either the service recovered since, or it
    /// is still crashing and gets another attempt, counted against the
    /// respawn budget.
    fn retry_svc(&mut self, ident: &str) {
        let Some(svc) = self.registry.get(ident) else {
            return;
        };
        let cnt = svc.restart_cnt;
        let crashing = (svc.state == State::Halted && svc.block == Block::Restarting)
            || (svc.state == State::Ready && cnt > 0);

        if !crashing {
            debug!("{} not crashing anymore", ident);
            self.with_svc(ident, |s| s.restart_cnt = 0);
            return;
        }

        if cnt >= RESPAWN_MAX {
            error!("{} keeps crashing, not restarting", ident);
            self.with_svc(ident, |s| s.block = Block::Crashed);
            self.step(ident);
            return;
        }

        self.with_svc(ident, |s| {
            s.restart_cnt += 1;
            s.restarts += 1;
            s.block = Block::None;
        });
        debug!("{} crashed, starting again, attempt {}", ident, cnt + 1);
        self.step(ident);

        let delay = if cnt + 1 <= RESPAWN_MAX / 2 {
            RETRY_SHORT
        } else {
            RETRY_LONG
        };
        self.timers.arm(ident, TimerKind::Retry, delay);
    }

    /// The pid-file window closed without a valid pid showing up.
    fn pidfile_timeout(&mut self, ident: &str) {
        let Some(svc) = self.registry.get(ident) else {
            return;
        };
        if svc.state != State::Running || !svc.has_pid() {
            return;
        }
        warn!(
            "{}: no pid file within {:?}, treating as crash",
            ident, SVC_TERM_TIMEOUT
        );
        let at_ceiling = self.with_svc(ident, |s| {
            s.restart_cnt = s.restart_cnt.saturating_add(1);
            s.restart_cnt >= RESPAWN_MAX
        });
        if at_ceiling == Some(true) {
            self.with_svc(ident, |s| s.block = Block::Crashed);
        }
        self.stop_svc(ident);
        self.schedule_work();
    }

    pub(crate) fn timer_fired(&mut self, ident: &str, gen: u64) {
        // a fire that raced re-arming or cancellation is stale
        let Some(kind) = self.timers.claim(ident, gen) else {
            return;
        };
        match kind {
            TimerKind::Kill => self.kill_svc(ident),
            TimerKind::Retry => self.retry_svc(ident),
            TimerKind::PidFile => self.pidfile_timeout(ident),
            TimerKind::Grace => self.finish_shutdown(),
        }
    }

    /// A child was reaped.
    pub(crate) fn collect(&mut self, pid: Pid, status: WaitStatus) {
        let Some(svc) = self.registry.by_pid_mut(pid) else {
            debug!("collected unknown pid {}", pid);
            return;
        };
        let ident = svc.ident();
        let daemon = svc.is_daemon();
        let path = svc.def.pidfile_path(&self.settings.pid_dir);
        svc.exit = Some(status);
        svc.clear_pid();
        debug!("collected {} ({})", ident, pid);

        if daemon {
            self.pidwatch.unwatch(&ident);
            // clean up if the daemon did not
            if let Some(path) = path {
                if let Err(err) = pidfile::remove(&path) {
                    warn!("failed removing pid file {}: {}", path.display(), err);
                }
            }
            let cond = format!("pid/{}", ident);
            let _ = self.conds.clear(&cond);
        }

        self.step(&ident);
        self.check_phase();
        self.schedule_work();
    }

    /// A watched pid file changed on disk.
    pub(crate) fn pidfile_event(&mut self, ident: &str, change: PidChange) {
        let Some(svc) = self.registry.get(ident) else {
            return;
        };
        if !svc.is_daemon() {
            return;
        }
        let cond = svc.pid_cond();
        let Some(path) = svc.def.pidfile_path(&self.settings.pid_dir) else {
            return;
        };
        let svc_pid = svc.pid;

        match change {
            PidChange::Removed => {
                if self.conds.clear(&cond).unwrap_or(false) {
                    self.schedule_work();
                }
            }
            PidChange::Created => match pidfile::read_pid(&path) {
                Some(seen) if seen == svc_pid => self.pidfile_settled(ident, &cond),
                Some(seen) if svc_pid.as_raw() > 1 => {
                    // last writer wins, but only a descendant of the
                    // supervised process is believed
                    if self.proc.is_descendant(seen, svc_pid) {
                        info!("{}: adopting pid {} from pid file", ident, seen);
                        self.with_svc(ident, |s| s.pid = seen);
                    } else {
                        warn!(
                            "{}: pid file names {} but supervised pid is {}, keeping ours",
                            ident, seen, svc_pid
                        );
                    }
                    self.pidfile_settled(ident, &cond);
                }
                Some(_) => (), // no process of ours, stale file
                None => {
                    // unreadable content: freeze dependents until the
                    // writer settles
                    let _ = self.conds.flux(&cond);
                    self.schedule_work();
                }
            },
        }
    }

    fn pidfile_settled(&mut self, ident: &str, cond: &str) {
        if self.timers.armed(ident) == Some(TimerKind::PidFile) {
            self.timers.cancel(ident);
        }
        if self.conds.set(cond).unwrap_or(false) {
            self.schedule_work();
        }
    }

    /// An inetd listener accepted a connection: register an ephemeral
    /// child record and hand it the socket.
    pub(crate) fn accept_conn(&mut self, ident: &str, stream: std::net::TcpStream) {
        if self.in_teardown() || self.norespawn {
            return; // connection dropped on the floor
        }
        let Some(parent) = self.registry.get(ident) else {
            return;
        };
        if parent.state != State::Running {
            return;
        }

        let mut def = parent.def.clone();
        def.kind = Kind::InetdConn;
        self.next_conn_id += 1;
        def.id = (10_000 + self.next_conn_id).to_string();
        def.pidfile = PidFile::None;
        def.cond.clear();
        def.manual = false;

        let cident = def.ident();
        let mut svc = Service::new(def);
        match self.proc.spawn_conn(&svc, stream) {
            Ok(pid) => {
                svc.set_pid(pid);
                svc.state = State::Running;
                debug!("inetd {}: connection child {} ({})", ident, cident, pid);
                self.registry.insert(svc);
            }
            Err(err) => error!("inetd {}: failed to spawn child: {:#}", ident, err),
        }
    }

    /// Forget a record and every runtime resource tied to it.
    pub(crate) fn unregister(&mut self, ident: &str) {
        self.drop_runtime(ident);
        self.registry.remove(ident);
        debug!("unregistered {}", ident);
    }

    fn drop_runtime(&mut self, ident: &str) {
        self.timers.cancel(ident);
        self.pidwatch.unwatch(ident);
        self.listeners.close(ident);
        let _ = self.conds.clear(&format!("pid/{}", ident));
    }

    /// Phase progression: checked after every sweep and collect.
    pub(crate) fn check_phase(&mut self) {
        match self.phase {
            Phase::Bootstrap => {
                if self.runtasks_completed() {
                    let level = self.settings.default_runlevel;
                    info!("bootstrap complete, entering runlevel {}", level);
                    if let Err(err) = self.set_runlevel(level) {
                        error!("failed to leave bootstrap: {}", err);
                    }
                }
            }
            Phase::ReloadTeardown => {
                let busy = self
                    .registry
                    .iter()
                    .any(|s| s.teardown && s.pid.as_raw() > 1);
                if !busy {
                    self.finish_reload();
                }
            }
            Phase::RunlevelTeardown { next } => {
                let busy = self
                    .registry
                    .iter()
                    .any(|s| !s.is_conn() && !s.def.in_runlevel(next) && s.pid.as_raw() > 1);
                if !busy {
                    self.finish_runlevel(next);
                }
            }
            Phase::ShutdownStop(mode) => {
                if !self.registry.iter().any(|s| s.pid.as_raw() > 1) {
                    self.finish_stop(mode);
                }
            }
            Phase::Run | Phase::ShutdownKill(_) => (),
        }
    }

    /// Have all one-shots of the current runlevel had their turn?
    /// Records gated on the post-bootstrap hook conditions are exempt,
    /// as are records whose conditions are plainly off.
    fn runtasks_completed(&self) -> bool {
        for svc in self.registry.iter() {
            if !svc.is_runtask() || svc.block != Block::None {
                continue;
            }
            if !svc.def.in_runlevel(self.runlevel) {
                continue;
            }
            if svc.def.cond.iter().any(|c| {
                c == HookPoint::SvcUp.cond_name() || c == HookPoint::SystemUp.cond_name()
            }) {
                continue;
            }
            if self.conds.agg(&svc.def.cond) == CondState::Off {
                continue;
            }
            if !svc.once {
                debug!("{} has not yet completed ...", svc.ident());
                return false;
            }
        }
        true
    }

    /// Re-read the configuration directory and reconcile.
    pub(crate) fn reload_from_disk(&mut self) -> anyhow::Result<()> {
        let defs = config::load_dir(&self.settings.conf_dir)?;
        self.reload(defs)?;
        Ok(())
    }

    /// Reconcile a fresh definition set against the registry: stop the
    /// removed and the incompatibly changed, run the reconfiguration
    /// hook once everything targeted is collected, then apply and
    /// restart.
    pub fn reload(&mut self, defs: Vec<ServiceDef>) -> Result<(), SupError> {
        if self.shutting_down() {
            return Err(SupError::ShuttingDown);
        }
        if self.in_teardown() {
            return Err(SupError::TeardownInProgress);
        }
        reload::check_conflicts(&defs)?;

        let plan = reload::classify(&self.registry, &defs);
        info!(
            "reloading configuration: {} new, {} changed, {} removed",
            plan.fresh.len(),
            plan.changed_hup.len() + plan.changed_restart.len(),
            plan.removed.len()
        );

        for ident in &plan.removed {
            self.with_svc(ident, |s| {
                s.dirty = true;
                s.doomed = true;
            });
        }
        for ident in plan.changed_hup.iter().chain(plan.changed_restart.iter()) {
            self.with_svc(ident, |s| s.dirty = true);
        }

        self.conds.bump_gen();
        self.pending = Some(defs);
        self.phase = Phase::ReloadTeardown;

        let targets: Vec<String> = plan.teardown_targets().cloned().collect();
        for ident in &targets {
            self.with_svc(ident, |s| s.teardown = true);
            self.stop_svc(ident);
        }

        self.check_phase(); // may already be quiet
        self.schedule_work();
        Ok(())
    }

    fn finish_reload(&mut self) {
        debug!("reload teardown complete");
        self.hooks.run(HookPoint::SvcReconf);
        let _ = self.conds.set(HookPoint::SvcReconf.cond_name());

        let doomed = self.registry.sweep_doomed();
        for ident in &doomed {
            self.drop_runtime(ident);
            info!("removed service {}", ident);
        }

        if let Some(defs) = self.pending.take() {
            for def in defs {
                let ident = def.ident();
                match self.registry.register(def) {
                    Registered::Inserted => debug!("new service {}", ident),
                    Registered::Updated => {
                        self.with_svc(&ident, |s| s.dirty = true);
                    }
                    Registered::Unchanged => (),
                }
            }
        }
        for svc in self.registry.iter_mut() {
            svc.teardown = false;
        }

        self.phase = if self.runlevel == 0 {
            Phase::Bootstrap
        } else {
            Phase::Run
        };
        self.schedule_work();
    }

    /// Change the active runlevel. 0 and 6 divert to the shutdown path.
    pub fn set_runlevel(&mut self, level: u8) -> Result<(), SupError> {
        if level > 9 {
            return Err(SupError::InvalidRunlevel {
                level: level as u32,
            });
        }
        if self.shutting_down() {
            return Err(SupError::ShuttingDown);
        }
        match level {
            0 => {
                self.start_shutdown(PowerMode::Halt);
                return Ok(());
            }
            6 => {
                self.start_shutdown(PowerMode::Reboot);
                return Ok(());
            }
            _ => (),
        }
        if level == self.runlevel {
            return Ok(()); // idempotent
        }
        if self.in_teardown() {
            return Err(SupError::TeardownInProgress);
        }

        info!("switching to runlevel {}", level);
        self.phase = Phase::RunlevelTeardown { next: level };

        let targets: Vec<String> = self
            .registry
            .iter()
            .filter(|s| !s.is_conn() && !s.def.in_runlevel(level) && !s.state.is_settled())
            .map(|s| s.ident())
            .collect();
        for ident in &targets {
            self.stop_svc(ident);
        }

        self.check_phase();
        self.schedule_work();
        Ok(())
    }

    fn finish_runlevel(&mut self, next: u8) {
        self.hooks.run(HookPoint::RunlevelChange);
        let _ = self.conds.set(HookPoint::RunlevelChange.cond_name());

        self.prevlevel = self.runlevel;
        self.runlevel = next;
        info!("entered runlevel {}", next);

        // fresh runlevel: one-shots run again, crashed daemons get
        // another chance
        for svc in self.registry.iter_mut() {
            if svc.is_runtask() {
                svc.once = false;
                if svc.state == State::Done {
                    svc.state = State::Halted;
                }
            }
            if svc.block == Block::Crashed {
                svc.block = Block::None;
                svc.restart_cnt = 0;
            }
        }

        let was_bootstrap = self.prevlevel == 0 && next != 0;
        self.phase = Phase::Run;

        if was_bootstrap {
            self.hooks.run(HookPoint::SvcUp);
            let _ = self.conds.set(HookPoint::SvcUp.cond_name());
            self.hooks.run(HookPoint::SystemUp);
            let _ = self.conds.set(HookPoint::SystemUp.cond_name());
        }
        self.schedule_work();
    }

    /// Stop the fleet, run the shutdown hooks, then signal everything
    /// left and hand over to the kernel.
    pub(crate) fn start_shutdown(&mut self, mode: PowerMode) {
        if self.shutting_down() {
            return;
        }
        info!("shutting down ({:?})", mode);
        self.phase = Phase::ShutdownStop(mode);
        for ident in self.registry.idents() {
            self.stop_svc(&ident);
        }
        self.check_phase();
        self.schedule_work();
    }

    fn finish_stop(&mut self, mode: PowerMode) {
        self.hooks.run(HookPoint::Shutdown);
        let _ = self.conds.set(HookPoint::Shutdown.cond_name());

        self.phase = Phase::ShutdownKill(mode);
        // catch whatever is not under supervision
        let _ = self.proc.signal(Pid::from_raw(-1), Signal::SIGTERM);
        self.timers
            .arm(SHUTDOWN_IDENT, TimerKind::Grace, SHUTDOWN_GRACE);
    }

    fn finish_shutdown(&mut self) {
        let Phase::ShutdownKill(mode) = self.phase else {
            return;
        };
        let _ = self.proc.signal(Pid::from_raw(-1), Signal::SIGKILL);
        if let Err(err) = self.proc.power(mode, self.settings.container) {
            error!("failed to go down ({:?}): {:#}", mode, err);
        }
        self.done = true;
    }
}
