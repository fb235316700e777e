use crate::sup::cond;
use anyhow::{bail, Context, Result};
use log::error;
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Runlevels a service runs in when the definition does not say,
/// matching the classic [2345] default.
pub const DEFAULT_RUNLEVELS: u16 = 0b00_0011_1100;

/// All ten runlevel bits, S (bit 0) through 9.
pub const ALL_RUNLEVELS: u16 = 0b11_1111_1111;

/// Upper bound on argv entries for a single service.
pub const MAX_SVC_ARGS: usize = 64;

/// Service kind, decides which transitions the state machine takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Long-lived daemon, respawned when it dies
    Service,
    /// One-shot command, awaited in the background
    Task,
    /// One-shot command, run sequentially; nothing else progresses
    /// until it has exited
    Run,
    /// Socket listener, accepted connections become `inetd-conn`
    /// children
    Inetd,
    /// Ephemeral child spawned by an inetd listener; never read from
    /// configuration
    #[serde(rename = "inetd-conn")]
    InetdConn,
}

/// Where a supervised process sends its stdout/stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSpec {
    /// Discard
    Off,
    /// Discard, explicit form
    Null,
    /// Inherit the supervisor's console
    Console,
    /// Append to a file, one line at a time
    File(PathBuf),
    /// Forward through the supervisor's own logger under a tag
    Syslog {
        tag: Option<String>,
        prio: Option<String>,
    },
}

/// Pid file contract for daemons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidFile {
    /// Not a daemon, no pid file
    None,
    /// Supervisor derives `<rundir>/<ident>.pid` and creates it
    Default,
    /// Explicit path, supervisor creates it
    Path(PathBuf),
    /// Explicit path, the daemon maintains the file itself
    Own(PathBuf),
}

/// One resource limit, by lowercase resource name ("nofile", "core", ...).
/// A missing bound means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: String,
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

/// A fully decoded service definition, the unit the registry stores and
/// reloads diff against.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDef {
    pub kind: Kind,
    /// Command, absolute path or resolved in PATH at start time
    pub cmd: String,
    /// Arguments, not including the command itself
    pub args: Vec<String>,
    /// Instance id, a nonzero integer string. "1" unless given
    pub id: String,
    /// Short name, basename of cmd unless overridden
    pub name: String,
    pub desc: String,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Bitmask over runlevels, bit 0 is the bootstrap level S
    pub runlevels: u16,
    /// Conditions gating the service, aggregated by the store
    pub cond: Vec<String>,
    /// Service re-reads its config on SIGHUP instead of needing a
    /// stop/start cycle
    pub sighup: bool,
    /// Only start on an explicit operator request
    pub manual: bool,
    pub pidfile: PidFile,
    pub log: LogSpec,
    pub env: HashMap<String, String>,
    pub rlimits: Vec<Rlimit>,
    /// Listen address for inetd listeners, "host:port"
    pub listen: Option<String>,
    /// Built-in record, survives configuration reloads
    pub protect: bool,
}

impl ServiceDef {
    /// Identity string, `name` or `name:id` for secondary instances.
    pub fn ident(&self) -> String {
        if self.id == "1" {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.id)
        }
    }

    pub fn in_runlevel(&self, level: u8) -> bool {
        self.runlevels & (1u16 << level) != 0
    }

    /// Resolved pid file path for daemons, if any.
    pub fn pidfile_path(&self, run_dir: &Path) -> Option<PathBuf> {
        match &self.pidfile {
            PidFile::None => None,
            PidFile::Default => Some(run_dir.join(format!("{}.pid", self.ident()))),
            PidFile::Path(p) | PidFile::Own(p) => Some(p.clone()),
        }
    }

    /// True when the daemon writes and maintains the pid file itself.
    pub fn owns_pidfile(&self) -> bool {
        matches!(self.pidfile, PidFile::Own(_))
    }

    /// Renders the runlevel mask back to the compact [S..9] form.
    pub fn runlevels_str(&self) -> String {
        let mut out = String::from("[");
        for bit in 0..=9u8 {
            if self.runlevels & (1 << bit) != 0 {
                if bit == 0 {
                    out.push('S');
                } else {
                    out.push((b'0' + bit) as char);
                }
            }
        }
        out.push(']');
        out
    }
}

/// Raw YAML schema, one file per service. Everything is optional except
/// `exec`; the file stem names the service unless `name` overrides it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawService {
    pub kind: Option<Kind>,
    pub exec: String,
    pub id: String,
    pub name: Option<String>,
    pub description: String,
    pub user: Option<String>,
    pub group: Option<String>,
    pub runlevels: String,
    pub conditions: Vec<String>,
    pub sighup: bool,
    pub manual: bool,
    pub pidfile: Option<String>,
    pub log: String,
    pub tag: Option<String>,
    pub priority: Option<String>,
    pub env: HashMap<String, String>,
    pub rlimits: HashMap<String, serde_yaml::Value>,
    pub listen: Option<String>,
}

impl RawService {
    /// Decode and validate into a [`ServiceDef`]. `stem` is the file
    /// stem used as the fallback name.
    pub fn into_def(self, stem: &str) -> Result<ServiceDef> {
        let argv = match shlex::split(&self.exec) {
            Some(argv) if !argv.is_empty() => argv,
            _ => bail!("missing or unparsable exec directive"),
        };
        if argv.len() > MAX_SVC_ARGS {
            bail!("too many arguments ({} max)", MAX_SVC_ARGS);
        }

        let kind = self.kind.unwrap_or(Kind::Service);
        if kind == Kind::InetdConn {
            bail!("inetd-conn records are created at accept time, not configured");
        }
        if kind == Kind::Inetd && self.listen.is_none() {
            bail!("inetd service needs a listen address");
        }

        let id = if self.id.is_empty() {
            "1".to_string()
        } else {
            self.id
        };
        if id.parse::<u64>().map(|n| n == 0).unwrap_or(true) {
            bail!("service id must be a nonzero integer, got {:?}", id);
        }

        let cmd = argv[0].clone();
        let name = match self.name {
            Some(name) => name,
            None => {
                let base = cmd.rsplit('/').next().unwrap_or(&cmd);
                if base.is_empty() {
                    stem.to_string()
                } else {
                    base.to_string()
                }
            }
        };

        for c in &self.conditions {
            if !cond::valid_name(c) {
                bail!("invalid condition name {:?}", c);
            }
        }

        let pidfile = match (&kind, self.pidfile.as_deref()) {
            (Kind::Service, None) => PidFile::Default,
            (Kind::Service, Some(p)) => {
                let (own, path) = match p.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, p),
                };
                if !path.starts_with('/') {
                    bail!("pid file path must be absolute: {:?}", p);
                }
                if own {
                    PidFile::Own(PathBuf::from(path))
                } else {
                    PidFile::Path(PathBuf::from(path))
                }
            }
            (_, Some(_)) => bail!("pid file only makes sense for kind: service"),
            (_, None) => PidFile::None,
        };

        let log = parse_log(&self.log, self.tag, self.priority)?;
        let rlimits = parse_rlimits(&self.rlimits)?;

        Ok(ServiceDef {
            kind,
            cmd,
            args: argv[1..].to_vec(),
            id,
            name,
            desc: self.description,
            user: self.user,
            group: self.group,
            runlevels: parse_runlevels(&self.runlevels)?,
            cond: self.conditions,
            sighup: self.sighup,
            manual: self.manual,
            pidfile,
            log,
            env: self.env,
            rlimits,
            listen: self.listen,
            protect: false,
        })
    }
}

/// Parse the compact runlevel syntax: digits 0-9 and S, an optional
/// surrounding [], a leading ! to negate the set. Empty means [2345].
pub fn parse_runlevels(s: &str) -> Result<u16> {
    let s = s.trim().trim_start_matches('[').trim_end_matches(']');
    if s.is_empty() {
        return Ok(DEFAULT_RUNLEVELS);
    }

    let (negate, body) = match s.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let mut mask = 0u16;
    for c in body.chars() {
        match c {
            'S' | 's' => mask |= 1,
            '0'..='9' => mask |= 1 << (c as u8 - b'0'),
            _ => bail!("invalid runlevel character {:?}", c),
        }
    }

    if negate {
        mask = ALL_RUNLEVELS & !mask;
    }
    Ok(mask)
}

fn parse_log(s: &str, tag: Option<String>, prio: Option<String>) -> Result<LogSpec> {
    match s.trim() {
        "" | "off" => Ok(LogSpec::Off),
        "null" | "/dev/null" => Ok(LogSpec::Null),
        "console" | "/dev/console" => Ok(LogSpec::Console),
        "syslog" | "log" => Ok(LogSpec::Syslog { tag, prio }),
        other => match other.strip_prefix("file:") {
            Some(path) if path.starts_with('/') => Ok(LogSpec::File(PathBuf::from(path))),
            _ if other.starts_with('/') => Ok(LogSpec::File(PathBuf::from(other))),
            _ => bail!("invalid log spec {:?}", s),
        },
    }
}

fn parse_rlimits(raw: &HashMap<String, serde_yaml::Value>) -> Result<Vec<Rlimit>> {
    use serde_yaml::Value;

    fn bound(v: &Value) -> Result<Option<u64>> {
        match v {
            Value::Number(n) => n
                .as_u64()
                .map(Some)
                .context("resource limit must be a non-negative integer"),
            Value::String(s) if s == "unlimited" || s == "infinity" => Ok(None),
            _ => bail!("resource limit must be an integer or \"unlimited\""),
        }
    }

    let mut out = Vec::new();
    for (name, value) in raw {
        let (soft, hard) = match value {
            Value::Sequence(seq) if seq.len() == 2 => (bound(&seq[0])?, bound(&seq[1])?),
            single => {
                let b = bound(single)?;
                (b, b)
            }
        };
        out.push(Rlimit {
            resource: name.clone(),
            soft,
            hard,
        });
    }
    // stable order so definition comparison is not at the mercy of map order
    out.sort_by(|a, b| a.resource.cmp(&b.resource));
    Ok(out)
}

/// Load a single definition file.
pub fn load<T: AsRef<Path>>(t: T) -> Result<ServiceDef> {
    let p = t.as_ref();
    let stem = p
        .file_stem()
        .and_then(OsStr::to_str)
        .with_context(|| format!("invalid file name: {}", p.display()))?;

    let file = File::open(p).with_context(|| format!("failed to open {}", p.display()))?;
    let raw: RawService =
        serde_yaml::from_reader(&file).with_context(|| format!("failed to parse {}", p.display()))?;
    raw.into_def(stem)
}

/// Walk a directory and load every `.yaml` definition in it, in file
/// name order so load order is stable across reloads. Files that fail
/// to load are reported and skipped.
pub fn load_dir<T: AsRef<Path>>(p: T) -> Result<Vec<ServiceDef>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(&p)
        .with_context(|| format!("failed to read config dir {}", p.as_ref().display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let fp = entry.path();
        if matches!(fp.extension(), Some(ext) if ext == OsStr::new("yaml")) {
            files.push(fp);
        }
    }
    files.sort();

    let mut defs = Vec::new();
    for fp in files {
        match load(&fp) {
            Ok(def) => defs.push(def),
            Err(err) => {
                error!("failed to load config file {:?}: {:#}", fp, err);
                continue;
            }
        }
    }
    Ok(defs)
}
