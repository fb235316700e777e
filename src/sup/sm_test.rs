//! State-machine scenario tests, run against stub process/timer/watch
//! backends so nothing forks and nothing sleeps.

use crate::manager::{PowerMode, Proc};
use crate::sup::cond::{CondState, CondStore};
use crate::sup::config::{RawService, ServiceDef};
use crate::sup::hooks::HookPoint;
use crate::sup::inetd::Listeners;
use crate::sup::pidfile::{PidChange, PidWatch};
use crate::sup::service::Block;
use crate::sup::state::State;
use crate::sup::timer::{TimerKind, Timers};
use crate::sup::{Cmd, Event, Reply, Settings, Sup};
use anyhow::{bail, Result};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;

#[derive(Default)]
struct ProcState {
    next_pid: i32,
    missing: HashSet<String>,
    fail_spawn: HashSet<String>,
    run_exit: i32,
    descendant: bool,
    /// every observable action, in order
    ops: Vec<String>,
    powered: Option<PowerMode>,
}

#[derive(Clone, Default)]
struct FakeProc(Arc<Mutex<ProcState>>);

impl Proc for FakeProc {
    fn exists(&self, cmd: &str) -> bool {
        !self.0.lock().unwrap().missing.contains(cmd)
    }

    fn spawn(&mut self, svc: &crate::sup::service::Service) -> Result<Pid> {
        let mut st = self.0.lock().unwrap();
        if st.fail_spawn.contains(&svc.def.cmd) {
            bail!("spawn refused");
        }
        st.next_pid += 1;
        let pid = 100 + st.next_pid;
        st.ops.push(format!("start {}", svc.ident()));
        Ok(Pid::from_raw(pid))
    }

    fn spawn_conn(
        &mut self,
        svc: &crate::sup::service::Service,
        _stream: std::net::TcpStream,
    ) -> Result<Pid> {
        let mut st = self.0.lock().unwrap();
        st.next_pid += 1;
        let pid = 100 + st.next_pid;
        st.ops.push(format!("conn {}", svc.ident()));
        Ok(Pid::from_raw(pid))
    }

    fn wait(&mut self, pid: Pid) -> Result<WaitStatus> {
        let mut st = self.0.lock().unwrap();
        let code = st.run_exit;
        st.ops.push(format!("wait {}", pid));
        Ok(WaitStatus::Exited(pid, code))
    }

    fn signal(&self, pid: Pid, sig: Signal) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .ops
            .push(format!("{:?} {}", sig, pid.as_raw()));
        Ok(())
    }

    fn is_descendant(&mut self, _child: Pid, _ancestor: Pid) -> bool {
        self.0.lock().unwrap().descendant
    }

    fn power(&mut self, mode: PowerMode, _container: bool) -> Result<()> {
        self.0.lock().unwrap().powered = Some(mode);
        Ok(())
    }
}

#[derive(Default)]
struct TimerState {
    slots: HashMap<String, (TimerKind, u64, Duration)>,
    next_gen: u64,
}

#[derive(Clone, Default)]
struct ManualTimers(Arc<Mutex<TimerState>>);

impl Timers for ManualTimers {
    fn arm(&mut self, ident: &str, kind: TimerKind, delay: Duration) -> u64 {
        let mut st = self.0.lock().unwrap();
        st.next_gen += 1;
        let gen = st.next_gen;
        st.slots.insert(ident.into(), (kind, gen, delay));
        gen
    }

    fn arm_if_idle(&mut self, ident: &str, kind: TimerKind, delay: Duration) -> bool {
        if self.0.lock().unwrap().slots.contains_key(ident) {
            return false;
        }
        self.arm(ident, kind, delay);
        true
    }

    fn cancel(&mut self, ident: &str) {
        self.0.lock().unwrap().slots.remove(ident);
    }

    fn armed(&self, ident: &str) -> Option<TimerKind> {
        self.0.lock().unwrap().slots.get(ident).map(|s| s.0)
    }

    fn claim(&mut self, ident: &str, gen: u64) -> Option<TimerKind> {
        let mut st = self.0.lock().unwrap();
        match st.slots.get(ident) {
            Some(slot) if slot.1 == gen => st.slots.remove(ident).map(|s| s.0),
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
struct FakeWatch(Arc<Mutex<Vec<String>>>);

impl PidWatch for FakeWatch {
    fn watch(&mut self, ident: &str, _path: &Path) {
        self.0.lock().unwrap().push(format!("watch {}", ident));
    }
    fn unwatch(&mut self, ident: &str) {
        self.0.lock().unwrap().push(format!("unwatch {}", ident));
    }
}

#[derive(Clone, Default)]
struct FakeListeners(Arc<Mutex<Vec<String>>>);

impl Listeners for FakeListeners {
    fn open(&mut self, ident: &str, addr: &str) {
        self.0.lock().unwrap().push(format!("open {} {}", ident, addr));
    }
    fn close(&mut self, ident: &str) {
        self.0.lock().unwrap().push(format!("close {}", ident));
    }
}

struct Harness {
    sup: Sup,
    rx: UnboundedReceiver<Event>,
    proc: FakeProc,
    timers: ManualTimers,
    listeners: FakeListeners,
    _tmp: tempfile::TempDir,
}

fn def(yaml: &str, stem: &str) -> ServiceDef {
    let raw: RawService = serde_yaml::from_str(yaml).unwrap();
    raw.into_def(stem).unwrap()
}

impl Harness {
    fn new(defs: &[ServiceDef]) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings {
            conf_dir: tmp.path().join("conf"),
            run_dir: tmp.path().join("run"),
            pid_dir: tmp.path().join("run"),
            default_runlevel: 2,
            container: true,
        };
        std::fs::create_dir_all(&settings.pid_dir).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let proc = FakeProc::default();
        let timers = ManualTimers::default();
        let watch = FakeWatch::default();
        let listeners = FakeListeners::default();

        let mut sup = Sup::new(
            settings,
            CondStore::new(),
            Box::new(proc.clone()),
            Box::new(timers.clone()),
            Box::new(watch.clone()),
            Box::new(listeners.clone()),
            tx,
        );
        for d in defs {
            sup.register(d.clone());
        }

        Harness {
            sup,
            rx,
            proc,
            timers,
            listeners,
            _tmp: tmp,
        }
    }

    /// Boot and drain until idle; ends up in the default runlevel
    /// unless bootstrap work is pending.
    fn boot(defs: &[ServiceDef]) -> Harness {
        let mut h = Harness::new(defs);
        h.sup.bootstrap();
        h.pump();
        h
    }

    /// Deliver queued events until the loop is idle.
    fn pump(&mut self) {
        while let Ok(ev) = self.rx.try_recv() {
            self.sup.handle_event(ev);
        }
    }

    fn state(&self, ident: &str) -> State {
        self.sup.registry.get(ident).unwrap().state
    }

    fn pid(&self, ident: &str) -> i32 {
        self.sup.registry.get(ident).unwrap().pid.as_raw()
    }

    fn ops(&self) -> Vec<String> {
        self.proc.0.lock().unwrap().ops.clone()
    }

    /// Simulate the reaper collecting a service's process.
    fn reap(&mut self, ident: &str, code: i32) {
        let pid = Pid::from_raw(self.pid(ident));
        assert!(pid.as_raw() > 1, "{} has no process to reap", ident);
        self.sup.handle_event(Event::ChildExit {
            pid,
            status: WaitStatus::Exited(pid, code),
        });
        self.pump();
    }

    /// Fire the armed timer for `ident`.
    fn fire(&mut self, ident: &str) {
        let (kind, gen) = {
            let st = self.timers.0.lock().unwrap();
            let slot = st.slots.get(ident).unwrap_or_else(|| {
                panic!("no timer armed for {}", ident);
            });
            (slot.0, slot.1)
        };
        self.sup.handle_event(Event::Timer {
            ident: ident.into(),
            kind,
            gen,
        });
        self.pump();
    }

    /// The daemon's pid file came up with the pid we spawned.
    fn settle(&mut self, ident: &str) {
        self.sup.handle_event(Event::PidFile {
            ident: ident.into(),
            change: PidChange::Created,
        });
        self.pump();
    }

    fn cond_set(&mut self, name: &str) {
        self.sup.conds.set(name).unwrap();
        self.sup.schedule_work();
        self.pump();
    }

    fn cond_clear(&mut self, name: &str) {
        self.sup.conds.clear(name).unwrap();
        self.sup.schedule_work();
        self.pump();
    }

    fn cmd(&mut self, cmd: Cmd) -> Reply {
        let (tx, mut rx) = oneshot::channel();
        self.sup.handle_event(Event::Control { cmd, reply: tx });
        self.pump();
        rx.try_recv().expect("no reply")
    }

    fn count_hook(&mut self, point: HookPoint) -> Arc<Mutex<Vec<String>>> {
        // hooks share the proc op log so ordering is observable
        let ops = Arc::new(Mutex::new(Vec::new()));
        let theirs = Arc::clone(&ops);
        let shared = Arc::clone(&self.proc.0);
        self.sup.hooks.register(point, move |p| {
            theirs.lock().unwrap().push(format!("{:?}", p));
            shared.lock().unwrap().ops.push(format!("hook {:?}", p));
        });
        ops
    }
}

#[test]
fn boot_brings_daemons_into_the_default_runlevel() {
    let h = Harness::boot(&[def("exec: /bin/alpha", "alpha")]);

    assert_eq!(h.sup.runlevel, 2);
    assert_eq!(h.state("alpha"), State::Running);
    assert!(h.pid("alpha") > 1);
    assert_eq!(h.sup.conds.get("hook/banner"), CondState::On);
    assert_eq!(h.sup.conds.get("hook/system-up"), CondState::On);
}

#[test]
fn conditions_gate_startup() {
    let mut h = Harness::boot(&[def("exec: /bin/alpha\nconditions: [usr/ok]", "alpha")]);

    // enabled but gated
    assert_eq!(h.state("alpha"), State::Ready);
    assert!(h.ops().is_empty());

    h.cond_set("usr/ok");
    assert_eq!(h.state("alpha"), State::Running);
}

#[test]
fn condition_off_stops_with_sigterm_and_a_kill_timer() {
    let mut h = Harness::boot(&[def("exec: /bin/alpha\nconditions: [usr/ok]", "alpha")]);
    h.cond_set("usr/ok");
    let pid = h.pid("alpha");

    h.cond_clear("usr/ok");
    assert_eq!(h.state("alpha"), State::Stopping);
    assert!(h.ops().contains(&format!("SIGTERM {}", pid)));
    // a stopping service always has the forced-kill timeout armed
    assert_eq!(h.timers.armed("alpha"), Some(TimerKind::Kill));

    h.reap("alpha", 0);
    // still gated off: parked in ready, not restarted
    assert_eq!(h.state("alpha"), State::Ready);
    assert_eq!(h.timers.armed("alpha"), None);
    let starts = h.ops().iter().filter(|o| *o == "start alpha").count();
    assert_eq!(starts, 1);
}

#[test]
fn kill_timer_escalates_to_sigkill() {
    let mut h = Harness::boot(&[def("exec: /bin/alpha\nconditions: [usr/ok]", "alpha")]);
    h.cond_set("usr/ok");
    let pid = h.pid("alpha");

    h.cond_clear("usr/ok");
    h.fire("alpha");
    assert!(h.ops().contains(&format!("SIGKILL {}", pid)));
}

#[test]
fn flux_freezes_instead_of_stopping() {
    let mut h = Harness::boot(&[def("exec: /bin/alpha\nconditions: [net/eth0/up]", "alpha")]);
    h.cond_set("net/eth0/up");
    let pid = h.pid("alpha");

    h.sup.conds.reassert("net");
    h.sup.schedule_work();
    h.pump();
    assert_eq!(h.state("alpha"), State::Waiting);
    assert!(h.ops().contains(&format!("SIGSTOP {}", pid)));

    h.cond_set("net/eth0/up");
    assert_eq!(h.state("alpha"), State::Running);
    assert_eq!(h.pid("alpha"), pid);
    assert!(h.ops().contains(&format!("SIGCONT {}", pid)));
    // frozen, thawed, never killed
    assert!(!h.ops().iter().any(|op| op.starts_with("SIGTERM")));
    assert!(!h.ops().iter().any(|op| op.starts_with("SIGKILL")));
}

#[test]
fn waiting_to_stopping_sends_sigcont_before_sigterm() {
    let mut h = Harness::boot(&[def("exec: /bin/alpha\nconditions: [net/eth0/up]", "alpha")]);
    h.cond_set("net/eth0/up");
    let pid = h.pid("alpha");

    h.sup.conds.reassert("net");
    h.sup.schedule_work();
    h.pump();
    assert_eq!(h.state("alpha"), State::Waiting);

    h.cond_clear("net/eth0/up");
    assert_eq!(h.state("alpha"), State::Stopping);
    let ops = h.ops();
    let cont = ops.iter().position(|o| *o == format!("SIGCONT {}", pid));
    let term = ops.iter().position(|o| *o == format!("SIGTERM {}", pid));
    assert!(cont.unwrap() < term.unwrap());
}

#[test]
fn crashed_daemon_respawns_with_backoff() {
    let mut h = Harness::boot(&[def("exec: /bin/alpha", "alpha")]);
    h.settle("alpha");
    let first = h.pid("alpha");

    h.reap("alpha", 1);
    assert_eq!(h.state("alpha"), State::Halted);
    assert_eq!(
        h.sup.registry.get("alpha").unwrap().block,
        Block::Restarting
    );
    assert_eq!(h.timers.armed("alpha"), Some(TimerKind::Retry));

    h.fire("alpha");
    assert_eq!(h.state("alpha"), State::Running);
    assert_ne!(h.pid("alpha"), first);
    assert_eq!(h.sup.registry.get("alpha").unwrap().restart_cnt, 1);

    // service stays up: the next firing resets the budget
    h.fire("alpha");
    assert_eq!(h.sup.registry.get("alpha").unwrap().restart_cnt, 0);
    assert_eq!(h.state("alpha"), State::Running);
}

#[test]
fn respawn_ceiling_marks_the_service_crashed() {
    let mut h = Harness::boot(&[def("exec: /bin/alpha", "alpha")]);
    h.settle("alpha");

    for _ in 0..crate::sup::RESPAWN_MAX {
        h.reap("alpha", 1);
        h.fire("alpha");
    }
    // one more crash exhausts the budget
    h.reap("alpha", 1);
    h.fire("alpha");

    let svc = h.sup.registry.get("alpha").unwrap();
    assert_eq!(svc.block, Block::Crashed);
    assert_eq!(svc.state, State::Halted);
    assert!(svc.restart_cnt <= crate::sup::RESPAWN_MAX);
    assert_eq!(h.timers.armed("alpha"), None);

    // no automatic start until an operator acts
    h.sup.schedule_work();
    h.pump();
    assert_eq!(h.state("alpha"), State::Halted);

    assert_eq!(h.cmd(Cmd::Start { ident: "alpha".into() }), Reply::Ack);
    assert_eq!(h.state("alpha"), State::Running);
    assert_eq!(h.sup.registry.get("alpha").unwrap().restart_cnt, 0);
}

#[test]
fn missing_binary_does_not_burn_the_respawn_budget() {
    let mut h = Harness::new(&[def("exec: /bin/ghost", "ghost")]);
    h.proc.0.lock().unwrap().missing.insert("/bin/ghost".into());
    h.sup.bootstrap();
    h.pump();

    let svc = h.sup.registry.get("ghost").unwrap();
    assert_eq!(svc.block, Block::Missing);
    assert_eq!(svc.state, State::Halted);
    assert_eq!(svc.restart_cnt, 0);

    // operator retry once the binary is installed
    h.proc.0.lock().unwrap().missing.clear();
    assert_eq!(h.cmd(Cmd::Start { ident: "ghost".into() }), Reply::Ack);
    assert_eq!(h.state("ghost"), State::Running);
}

#[test]
fn spawn_failure_retries_on_the_backoff_timer() {
    let mut h = Harness::new(&[def("exec: /bin/flaky", "flaky")]);
    h.proc.0.lock().unwrap().fail_spawn.insert("/bin/flaky".into());
    h.sup.bootstrap();
    h.pump();

    assert_eq!(h.state("flaky"), State::Ready);
    assert_eq!(h.sup.registry.get("flaky").unwrap().restart_cnt, 1);
    assert_eq!(h.timers.armed("flaky"), Some(TimerKind::Retry));

    h.proc.0.lock().unwrap().fail_spawn.clear();
    h.fire("flaky");
    assert_eq!(h.state("flaky"), State::Running);
}

#[test]
fn run_task_is_sequential_and_marks_once() {
    let defs = [
        def("exec: /bin/setup\nkind: run\nrunlevels: \"S\"", "setup"),
        def("exec: /bin/alpha", "alpha"),
    ];
    let h = Harness::boot(&defs);

    // the run completed synchronously during bootstrap, then the
    // default runlevel came up
    assert_eq!(h.sup.runlevel, 2);
    assert_eq!(h.state("alpha"), State::Running);
    let svc = h.sup.registry.get("setup").unwrap();
    assert!(matches!(svc.state, State::Halted | State::Done));

    let ops = h.ops();
    let run = ops.iter().position(|o| o == "start setup").unwrap();
    let daemon = ops.iter().position(|o| o == "start alpha").unwrap();
    assert!(run < daemon);
}

#[test]
fn gated_off_bootstrap_task_does_not_block_progression() {
    let defs = [
        def(
            "exec: /bin/fsck\nkind: task\nrunlevels: \"S\"\nconditions: [usr/never]",
            "fsck",
        ),
        def("exec: /bin/alpha", "alpha"),
    ];
    let h = Harness::boot(&defs);

    // the gated task was skipped, bootstrap completed anyway
    assert_eq!(h.sup.runlevel, 2);
    assert_eq!(h.state("alpha"), State::Running);
    assert!(!h.ops().contains(&"start fsck".to_string()));
}

#[test]
fn bootstrap_waits_for_background_tasks() {
    let defs = [
        def("exec: /bin/seed\nkind: task\nrunlevels: \"S\"", "seed"),
        def("exec: /bin/alpha", "alpha"),
    ];
    let mut h = Harness::new(&defs);
    h.sup.bootstrap();
    h.pump();

    // task spawned, still running: stuck in runlevel S
    assert_eq!(h.sup.runlevel, 0);
    assert_eq!(h.state("seed"), State::Running);
    assert!(!h.ops().contains(&"start alpha".to_string()));

    h.reap("seed", 0);
    assert_eq!(h.sup.runlevel, 2);
    assert!(h.state("seed").is_settled());
    assert_eq!(h.state("alpha"), State::Running);
}

#[test]
fn sighup_capable_service_survives_a_definition_change() {
    let defs = [
        def("exec: /bin/a\nsighup: true", "a"),
        def("exec: /bin/b", "b"),
    ];
    let mut h = Harness::boot(&defs);
    h.settle("a");
    h.settle("b");
    let pid_a = h.pid("a");
    let pid_b = h.pid("b");

    let new = vec![
        def("exec: /bin/a --changed\nsighup: true", "a"),
        def("exec: /bin/b --changed", "b"),
    ];
    h.sup.reload(new).unwrap();
    h.pump();
    // b needs a stop/start cycle
    assert!(h.ops().contains(&format!("SIGTERM {}", pid_b)));
    h.reap("b", 0);

    // a kept its process and got SIGHUP
    assert_eq!(h.pid("a"), pid_a);
    assert!(h.ops().contains(&format!("SIGHUP {}", pid_a)));

    // b came back with a new pid
    assert_eq!(h.state("b"), State::Running);
    assert_ne!(h.pid("b"), pid_b);

    assert!(h.sup.registry.iter().all(|s| !s.dirty));
    assert_eq!(h.sup.registry.get("a").unwrap().def.args, vec!["--changed"]);
    assert_eq!(h.sup.registry.get("b").unwrap().def.args, vec!["--changed"]);
}

#[test]
fn reload_removes_dropped_services_and_runs_the_hook_once() {
    let defs = [def("exec: /bin/a", "a"), def("exec: /bin/b", "b")];
    let mut h = Harness::boot(&defs);
    h.settle("a");
    h.settle("b");
    let pid_b = h.pid("b");
    let hook = h.count_hook(HookPoint::SvcReconf);

    h.sup.reload(vec![def("exec: /bin/a", "a")]).unwrap();
    h.pump();
    // teardown in flight until b is collected
    assert!(h.sup.registry.get("b").is_some());
    assert!(hook.lock().unwrap().is_empty());
    assert!(h.ops().contains(&format!("SIGTERM {}", pid_b)));

    h.reap("b", 0);
    assert!(h.sup.registry.get("b").is_none());
    assert_eq!(hook.lock().unwrap().len(), 1);
    assert_eq!(h.state("a"), State::Running);
}

#[test]
fn reload_with_identity_conflict_is_rejected_untouched() {
    let mut h = Harness::boot(&[def("exec: /bin/a", "a")]);
    h.settle("a");
    let pid = h.pid("a");

    let dup = vec![def("exec: /bin/a", "a"), def("exec: /bin/a", "a2")];
    assert!(h.sup.reload(dup).is_err());
    h.pump();

    assert_eq!(h.pid("a"), pid);
    assert_eq!(h.state("a"), State::Running);
    assert!(!h.sup.registry.get("a").unwrap().dirty);
    assert!(!h.sup.in_teardown());
}

#[test]
fn reloading_the_same_set_twice_is_a_noop() {
    let defs = vec![def("exec: /bin/a", "a"), def("exec: /bin/b", "b")];
    let mut h = Harness::boot(&defs);
    h.settle("a");
    h.settle("b");
    let pid_a = h.pid("a");
    let ops_before = h.ops().len();

    for _ in 0..2 {
        h.sup.reload(defs.clone()).unwrap();
        h.pump();
    }

    assert_eq!(h.pid("a"), pid_a);
    assert_eq!(h.state("a"), State::Running);
    assert!(h.sup.registry.iter().all(|s| !s.dirty));
    // no starts, stops or signals happened
    assert_eq!(h.ops().len(), ops_before);
}

#[test]
fn runlevel_switch_stops_starts_and_clears_once() {
    let defs = [
        def("exec: /bin/a\nrunlevels: \"2345\"", "a"),
        def("exec: /bin/b\nrunlevels: \"23\"", "b"),
        def("exec: /bin/c\nrunlevels: \"45\"", "c"),
        def("exec: /bin/t\nkind: task\nrunlevels: \"2\"", "t"),
    ];
    let mut h = Harness::boot(&defs);
    h.settle("a");
    h.settle("b");
    h.reap("t", 0); // background task completes
    let pid_a = h.pid("a");
    let pid_b = h.pid("b");
    assert!(h.sup.registry.get("t").unwrap().once);
    let hook = h.count_hook(HookPoint::RunlevelChange);

    h.sup.set_runlevel(4).unwrap();
    h.pump();
    assert!(h.ops().contains(&format!("SIGTERM {}", pid_b)));
    h.reap("b", 0);

    assert_eq!(h.sup.runlevel, 4);
    assert_eq!(h.sup.prevlevel, 2);
    assert_eq!(hook.lock().unwrap().len(), 1);

    // a kept running, b went down, c came up
    assert_eq!(h.pid("a"), pid_a);
    assert_eq!(h.state("b"), State::Halted);
    assert_eq!(h.state("c"), State::Running);
    assert!(!h.sup.registry.get("t").unwrap().once);

    // the hook ran after b was collected and before c started
    let ops = h.ops();
    let hook_at = ops
        .iter()
        .position(|o| o == "hook RunlevelChange")
        .unwrap();
    let c_at = ops.iter().position(|o| o == "start c").unwrap();
    assert!(hook_at < c_at);
}

#[test]
fn setting_the_same_runlevel_twice_is_a_noop() {
    let mut h = Harness::boot(&[def("exec: /bin/a", "a")]);
    h.settle("a");
    let ops_before = h.ops().len();

    h.sup.set_runlevel(2).unwrap();
    h.pump();
    assert_eq!(h.ops().len(), ops_before);
    assert_eq!(h.sup.runlevel, 2);
}

#[test]
fn stopping_a_service_without_a_process_reports_success() {
    let mut h = Harness::boot(&[def("exec: /bin/a\nconditions: [usr/ok]", "a")]);
    assert_eq!(h.state("a"), State::Ready);
    assert_eq!(h.pid("a"), 0);

    assert_eq!(h.cmd(Cmd::Stop { ident: "a".into() }), Reply::Ack);
    assert_eq!(h.state("a"), State::Halted);
    assert!(!h.ops().iter().any(|o| o.starts_with("SIG")));
}

#[test]
fn manual_service_waits_for_an_explicit_start() {
    let mut h = Harness::boot(&[def("exec: /bin/a\nmanual: true", "a")]);
    assert_eq!(h.state("a"), State::Halted);
    assert!(h.ops().is_empty());

    assert_eq!(h.cmd(Cmd::Start { ident: "a".into() }), Reply::Ack);
    assert_eq!(h.state("a"), State::Running);
}

#[test]
fn norespawn_suspends_supervision() {
    let mut h = Harness::boot(&[def("exec: /bin/a", "a")]);
    h.settle("a");

    h.sup.handle_event(Event::NoRespawn(true));
    h.pump();
    h.reap("a", 1);
    h.fire("a"); // retry fires but must not start anything
    assert_ne!(h.state("a"), State::Running);

    h.sup.handle_event(Event::NoRespawn(false));
    h.pump();
    // next retry brings it back
    if h.timers.armed("a").is_some() {
        h.fire("a");
    }
    assert_eq!(h.state("a"), State::Running);
}

#[test]
fn unknown_identities_nack() {
    let mut h = Harness::boot(&[]);
    let reply = h.cmd(Cmd::Status {
        ident: "nope".into(),
    });
    assert!(matches!(reply, Reply::Nack(msg) if msg.contains("unknown")));
    assert_eq!(
        h.cmd(Cmd::Query { ident: "nope".into() }),
        Reply::Nack("service \"nope\" unknown".into())
    );
}

#[test]
fn status_payload_is_json() {
    let mut h = Harness::boot(&[def("exec: /bin/a\ndescription: test daemon", "a")]);
    h.settle("a");
    let reply = h.cmd(Cmd::Status { ident: "a".into() });
    let Reply::AckText(body) = reply else {
        panic!("expected payload");
    };
    let v: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["name"], "a");
    assert_eq!(v["state"], "running");
    assert_eq!(v["description"], "test daemon");
}

#[test]
fn shutdown_stops_the_fleet_then_signals_and_powers_off() {
    let mut h = Harness::boot(&[def("exec: /bin/a", "a")]);
    h.settle("a");
    let pid = h.pid("a");
    let hook = h.count_hook(HookPoint::Shutdown);

    h.sup.handle_event(Event::Shutdown(PowerMode::Reboot));
    h.pump();
    assert!(h.ops().contains(&format!("SIGTERM {}", pid)));
    assert!(hook.lock().unwrap().is_empty());

    h.reap("a", 0);
    // fleet quiet: hook ran, stragglers get SIGTERM, grace timer armed
    assert_eq!(hook.lock().unwrap().len(), 1);
    assert!(h.ops().contains(&"SIGTERM -1".to_string()));

    h.fire(crate::sup::SHUTDOWN_IDENT);
    assert!(h.ops().contains(&"SIGKILL -1".to_string()));
    assert_eq!(h.proc.0.lock().unwrap().powered, Some(PowerMode::Reboot));
    assert!(h.sup.finished());
}

#[test]
fn inetd_listener_opens_and_spawns_connection_children() {
    let mut h = Harness::boot(&[def(
        "exec: /bin/cat\nkind: inetd\nlisten: \"127.0.0.1:7\"",
        "cat",
    )]);
    assert_eq!(h.state("cat"), State::Running);
    assert!(h
        .listeners
        .0
        .lock()
        .unwrap()
        .contains(&"open cat 127.0.0.1:7".to_string()));

    // a client connects
    let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let _client = std::net::TcpStream::connect(addr).unwrap();
    let (stream, _) = server.accept().unwrap();

    h.sup.handle_event(Event::InetdConn {
        ident: "cat".into(),
        stream,
    });
    h.pump();

    let conn_ident = h
        .sup
        .registry
        .iter()
        .find(|s| s.is_conn())
        .map(|s| s.ident())
        .expect("no connection child registered");
    assert_eq!(h.state(&conn_ident), State::Running);

    // connection finishes: the record disappears
    h.reap(&conn_ident, 0);
    assert!(h.sup.registry.get(&conn_ident).is_none());

    // stopping the listener closes the socket
    h.cmd(Cmd::Stop { ident: "cat".into() });
    assert!(h
        .listeners
        .0
        .lock()
        .unwrap()
        .contains(&"close cat".to_string()));
    assert_eq!(h.state("cat"), State::Halted);
}

#[test]
fn garbage_pid_file_holds_dependents_in_flux() {
    let defs = [
        def("exec: /bin/a", "a"),
        def("exec: /bin/b\nconditions: [pid/a]", "b"),
    ];
    let mut h = Harness::boot(&defs);
    h.settle("a");
    assert_eq!(h.state("b"), State::Running);
    let pid_b = h.pid("b");

    // something scribbled over a's pid file
    let path = h._tmp.path().join("run/a.pid");
    std::fs::write(&path, "garbage\n").unwrap();
    h.sup.handle_event(Event::PidFile {
        ident: "a".into(),
        change: PidChange::Created,
    });
    h.pump();

    assert_eq!(h.sup.conds.get("pid/a"), CondState::Flux);
    assert_eq!(h.state("b"), State::Waiting);
    assert!(h.ops().contains(&format!("SIGSTOP {}", pid_b)));

    // writer settles with the real pid
    std::fs::write(&path, format!("{}\n", h.pid("a"))).unwrap();
    h.sup.handle_event(Event::PidFile {
        ident: "a".into(),
        change: PidChange::Created,
    });
    h.pump();
    assert_eq!(h.sup.conds.get("pid/a"), CondState::On);
    assert_eq!(h.state("b"), State::Running);
    assert_eq!(h.pid("b"), pid_b);
}

#[test]
fn foreign_pid_in_pid_file_is_adopted_only_from_descendants() {
    let mut h = Harness::boot(&[def("exec: /bin/a", "a")]);
    h.settle("a");
    let supervised = h.pid("a");
    let path = h._tmp.path().join("run/a.pid");

    // not a descendant: keep our pid
    std::fs::write(&path, "9999\n").unwrap();
    h.sup.handle_event(Event::PidFile {
        ident: "a".into(),
        change: PidChange::Created,
    });
    h.pump();
    assert_eq!(h.pid("a"), supervised);

    // a descendant: adopt it
    h.proc.0.lock().unwrap().descendant = true;
    std::fs::write(&path, "9999\n").unwrap();
    h.sup.handle_event(Event::PidFile {
        ident: "a".into(),
        change: PidChange::Created,
    });
    h.pump();
    assert_eq!(h.pid("a"), 9999);
}

#[test]
fn collect_clears_the_pid_condition() {
    let defs = [
        def("exec: /bin/a", "a"),
        def("exec: /bin/b\nconditions: [pid/a]", "b"),
    ];
    let mut h = Harness::boot(&defs);
    h.settle("a");
    assert_eq!(h.sup.conds.get("pid/a"), CondState::On);
    assert_eq!(h.state("b"), State::Running);

    h.reap("a", 1);
    assert_eq!(h.sup.conds.get("pid/a"), CondState::Off);
    // b follows its condition down
    assert_eq!(h.state("b"), State::Stopping);
}
