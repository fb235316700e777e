use crate::sup::config::{Kind, LogSpec, Rlimit};
use crate::sup::service::Service;
use crate::sup::Event;
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{self, SigSet, Signal, SigmaskHow};
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::{Group, Pid, User};
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use sysinfo::{PidExt, ProcessExt, System, SystemExt};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc::UnboundedSender;

mod sink;

/// How the machine goes down once the fleet is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Halt,
    Poweroff,
    Reboot,
    Suspend,
}

/// Process plumbing behind the state machine. The supervisor core only
/// talks to this trait, so scenario tests can run against a fake that
/// never forks.
pub trait Proc: Send {
    /// Can the command be resolved to an executable right now?
    fn exists(&self, cmd: &str) -> bool;

    /// Fork/exec a service. SIGCHLD is blocked across the fork; the
    /// child applies limits and credentials, sets up stdio per the log
    /// spec, unblocks signals and execs.
    fn spawn(&mut self, svc: &Service) -> Result<Pid>;

    /// Spawn an inetd connection child with the accepted socket as its
    /// stdio.
    fn spawn_conn(&mut self, svc: &Service, stream: std::net::TcpStream) -> Result<Pid>;

    /// Blocking wait for one specific child. Only used for `run`
    /// services, which by contract stall everything else.
    fn wait(&mut self, pid: Pid) -> Result<WaitStatus>;

    fn signal(&self, pid: Pid, sig: Signal) -> Result<()>;

    /// Is `child` a descendant of `ancestor`? Decides whether a
    /// foreign pid found in a pid file is adopted.
    fn is_descendant(&mut self, child: Pid, ancestor: Pid) -> bool;

    /// Sync filesystems and hand control to the kernel (or exit, in
    /// container mode).
    fn power(&mut self, mode: PowerMode, container: bool) -> Result<()>;
}

/// The real thing: fork/exec via `Command` with a pre-exec hook.
pub struct NixProc;

impl NixProc {
    pub fn new() -> NixProc {
        NixProc
    }

    fn build(&self, svc: &Service, exe: &Path) -> Result<Command> {
        let def = &svc.def;

        let mut user = None;
        if let Some(name) = &def.user {
            user = User::from_name(name)
                .with_context(|| format!("failed to look up user {:?}", name))?
                .map(|u| (u.uid, u.gid, u.dir));
            if user.is_none() {
                bail!("no such user {:?}", name);
            }
        }
        let mut gid = user.as_ref().map(|(_, gid, _)| *gid);
        if let Some(name) = &def.group {
            let group = Group::from_name(name)
                .with_context(|| format!("failed to look up group {:?}", name))?;
            match group {
                Some(g) => gid = Some(g.gid),
                None => bail!("no such group {:?}", name),
            }
        }

        let mut cmd = Command::new(exe);
        cmd.args(&def.args).envs(&def.env).current_dir("/");

        if let Some((uid, _, home)) = &user {
            if uid.as_raw() != 0 {
                cmd.env("PATH", "/usr/bin:/bin");
                cmd.env("HOME", home);
            }
        }

        let rlimits = resolved_rlimits(&def.rlimits);
        let set_uid = user.as_ref().map(|(uid, _, _)| *uid);
        unsafe {
            cmd.pre_exec(move || {
                for (res, soft, hard) in &rlimits {
                    // a bad limit must not keep the service down
                    let _ = setrlimit(*res, *soft, *hard);
                }
                if let Some(gid) = gid {
                    nix::unistd::setgid(gid)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                }
                if let Some(uid) = set_uid {
                    nix::unistd::setuid(uid)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                }
                let all = SigSet::all();
                let _ = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&all), None);
                Ok(())
            });
        }

        Ok(cmd)
    }

    fn spawn_guarded(&self, mut cmd: Command, svc: &Service) -> Result<Pid> {
        // block SIGCHLD across the fork so the reaper cannot observe
        // the child before its pid is on record
        let mut chld = SigSet::empty();
        chld.add(Signal::SIGCHLD);
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&chld), None)
            .context("failed to block SIGCHLD")?;

        let spawned = cmd.spawn();

        let unblock = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&chld), None);
        let mut child = spawned.with_context(|| format!("failed to spawn {}", svc.ident()))?;
        unblock.context("failed to unblock SIGCHLD")?;

        let pid = Pid::from_raw(child.id() as i32);
        debug!("spawned {} as pid {}", svc.ident(), pid);

        match &svc.def.log {
            LogSpec::File(path) => {
                if let Some(out) = child.stdout.take() {
                    sink::to_file(out, path.clone(), svc.ident());
                }
                if let Some(err) = child.stderr.take() {
                    sink::to_file(err, path.clone(), svc.ident());
                }
            }
            LogSpec::Syslog { tag, .. } => {
                let tag = tag.clone().unwrap_or_else(|| svc.ident());
                if let Some(out) = child.stdout.take() {
                    sink::to_log(out, tag.clone());
                }
                if let Some(err) = child.stderr.take() {
                    sink::to_log(err, tag);
                }
            }
            _ => (),
        }

        Ok(pid)
    }
}

impl Default for NixProc {
    fn default() -> Self {
        NixProc::new()
    }
}

impl Proc for NixProc {
    fn exists(&self, cmd: &str) -> bool {
        resolve(cmd).is_some()
    }

    fn spawn(&mut self, svc: &Service) -> Result<Pid> {
        let exe = resolve(&svc.def.cmd)
            .with_context(|| format!("command {:?} not found in PATH", svc.def.cmd))?;

        let mut cmd = self.build(svc, &exe)?;
        match &svc.def.log {
            LogSpec::Off | LogSpec::Null => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
            }
            LogSpec::Console => {
                cmd.stdin(Stdio::null());
            }
            LogSpec::File(_) | LogSpec::Syslog { .. } => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }

        self.spawn_guarded(cmd, svc)
    }

    fn spawn_conn(&mut self, svc: &Service, stream: std::net::TcpStream) -> Result<Pid> {
        debug_assert_eq!(svc.def.kind, Kind::InetdConn);
        let exe = resolve(&svc.def.cmd)
            .with_context(|| format!("command {:?} not found in PATH", svc.def.cmd))?;

        let out = stream.try_clone().context("failed to clone socket")?;
        let err = stream.try_clone().context("failed to clone socket")?;

        let mut cmd = self.build(svc, &exe)?;
        cmd.stdin(Stdio::from(unsafe { OwnedFd::from_raw_fd(stream.into_raw_fd()) }))
            .stdout(Stdio::from(unsafe { OwnedFd::from_raw_fd(out.into_raw_fd()) }))
            .stderr(Stdio::from(unsafe { OwnedFd::from_raw_fd(err.into_raw_fd()) }));

        // the parent's copies of the accepted socket go away with the
        // Stdio temporaries; only the child keeps it open
        self.spawn_guarded(cmd, svc)
    }

    fn wait(&mut self, pid: Pid) -> Result<WaitStatus> {
        loop {
            match wait::waitpid(pid, None) {
                Ok(status) => return Ok(status),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => bail!("waitpid({}) failed: {}", pid, err),
            }
        }
    }

    fn signal(&self, pid: Pid, sig: Signal) -> Result<()> {
        Ok(signal::kill(pid, sig)?)
    }

    fn is_descendant(&mut self, child: Pid, ancestor: Pid) -> bool {
        let mut system = System::new();
        system.refresh_processes();

        let anc = sysinfo::Pid::from_u32(ancestor.as_raw() as u32);
        let mut cur = sysinfo::Pid::from_u32(child.as_raw() as u32);
        for _ in 0..64 {
            match system.process(cur).and_then(|p| p.parent()) {
                Some(parent) if parent == anc => return true,
                Some(parent) => cur = parent,
                None => return false,
            }
        }
        false
    }

    fn power(&mut self, mode: PowerMode, container: bool) -> Result<()> {
        nix::unistd::sync();
        if container {
            std::process::exit(0);
        }

        use nix::sys::reboot::{reboot, RebootMode};
        let how = match mode {
            PowerMode::Halt => RebootMode::RB_HALT_SYSTEM,
            PowerMode::Poweroff => RebootMode::RB_POWER_OFF,
            PowerMode::Reboot => RebootMode::RB_AUTOBOOT,
            PowerMode::Suspend => RebootMode::RB_SW_SUSPEND,
        };
        reboot(how).map(|_| ()).map_err(Into::into)
    }
}

/// PATH resolution. Paths with a slash are taken as-is.
fn resolve(cmd: &str) -> Option<PathBuf> {
    fn executable(path: &Path) -> bool {
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    if cmd.contains('/') {
        let path = PathBuf::from(cmd);
        return executable(&path).then_some(path);
    }

    let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/sbin:/usr/bin:/sbin:/bin".into());
    for dir in path.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(cmd);
        if executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn resolved_rlimits(limits: &[Rlimit]) -> Vec<(Resource, u64, u64)> {
    let infinity = nix::libc::RLIM_INFINITY;
    limits
        .iter()
        .filter_map(|l| match resource_by_name(&l.resource) {
            Some(res) => Some((res, l.soft.unwrap_or(infinity), l.hard.unwrap_or(infinity))),
            None => {
                warn!("unknown resource limit {:?}, skipping", l.resource);
                None
            }
        })
        .collect()
}

fn resource_by_name(name: &str) -> Option<Resource> {
    let res = match name {
        "as" | "vmem" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "nofile" => Resource::RLIMIT_NOFILE,
        "nproc" => Resource::RLIMIT_NPROC,
        "rss" => Resource::RLIMIT_RSS,
        "stack" => Resource::RLIMIT_STACK,
        _ => return None,
    };
    Some(res)
}

/// Drain every reapable child. Separate from the signal loop so it can
/// also run once at startup for children inherited across an exec.
fn collect_exited() -> Vec<WaitStatus> {
    let mut statuses = Vec::new();
    loop {
        let status = match wait::waitpid(Option::None, Some(wait::WaitPidFlag::WNOHANG)) {
            Ok(status) => status,
            Err(_) => return statuses,
        };
        match status {
            WaitStatus::StillAlive => break,
            _ => statuses.push(status),
        }
    }
    statuses
}

/// The reaper: waits for SIGCHLD, drains all reapable children and
/// forwards their exit statuses to the supervisor loop. Orphans
/// re-parented to pid 1 are collected here for free.
pub async fn reap(tx: UnboundedSender<Event>) {
    let mut chld = match unix_signal(SignalKind::child()) {
        Ok(stream) => stream,
        Err(err) => {
            // without SIGCHLD there is no supervision at all
            panic!("failed to bind SIGCHLD: {}", err);
        }
    };

    loop {
        for status in collect_exited() {
            if let Some(pid) = status.pid() {
                let _ = tx.send(Event::ChildExit { pid, status });
            }
        }
        if chld.recv().await.is_none() {
            return;
        }
    }
}
