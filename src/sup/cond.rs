use log::warn;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use crate::sup::errors::SupError;

/// Name of the generation marker inside the condition directory. Plain
/// condition files carry the generation they were asserted in; a
/// symlink to this marker denotes a condition in flux.
const RECONF: &str = "reconf";

/// Tri-state condition value.
///
/// `Flux` is transient and means "currently changing": services that
/// depend on it are frozen with SIGSTOP rather than stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondState {
    Off,
    Flux,
    On,
}

impl std::fmt::Display for CondState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            CondState::Off => "off",
            CondState::Flux => "flux",
            CondState::On => "on",
        })
    }
}

/// Validate a condition name: nonempty slash-delimited path whose
/// components are `[A-Za-z0-9._-]`, with no `.` or `..` components.
/// `:` is also accepted so pid conditions can carry the `name:id`
/// identity of secondary service instances.
pub fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    name.split('/').all(|comp| {
        !comp.is_empty()
            && comp != "."
            && comp != ".."
            && comp
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'))
    })
}

/// Hierarchical tri-state condition store.
///
/// The in-memory map is the ground truth; when constructed with a base
/// directory every change is shadowed to the filesystem for external
/// visibility (file present = on, absent = off, symlink to the reconf
/// marker = flux). Shadow failures are logged, never fatal.
pub struct CondStore {
    vals: HashMap<String, CondState>,
    base: Option<PathBuf>,
    gen: u32,
}

impl CondStore {
    /// In-memory store without a filesystem shadow.
    pub fn new() -> CondStore {
        CondStore {
            vals: HashMap::new(),
            base: None,
            gen: 1,
        }
    }

    /// Store shadowed under `base` (the `cond/` runtime directory).
    pub fn with_base<P: AsRef<Path>>(base: P) -> io::Result<CondStore> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        let store = CondStore {
            vals: HashMap::new(),
            base: Some(base),
            gen: 1,
        };
        store.write_reconf();
        Ok(store)
    }

    pub fn generation(&self) -> u32 {
        self.gen
    }

    /// Bump the configuration generation; called once per reload.
    pub fn bump_gen(&mut self) {
        self.gen += 1;
        self.write_reconf();
    }

    /// Current value; a name never asserted is off.
    pub fn get(&self, name: &str) -> CondState {
        self.vals.get(name).copied().unwrap_or(CondState::Off)
    }

    /// Assert a condition. Returns whether the value changed. The
    /// magic name `nop` is accepted and ignored.
    pub fn set(&mut self, name: &str) -> Result<bool, SupError> {
        self.put(name, CondState::On)
    }

    /// Deassert a condition. Returns whether the value changed.
    pub fn clear(&mut self, name: &str) -> Result<bool, SupError> {
        self.put(name, CondState::Off)
    }

    /// Mark a single condition as in flux.
    pub fn flux(&mut self, name: &str) -> Result<bool, SupError> {
        self.put(name, CondState::Flux)
    }

    fn put(&mut self, name: &str, next: CondState) -> Result<bool, SupError> {
        if name == "nop" {
            return Ok(false);
        }
        if !valid_name(name) {
            return Err(SupError::invalid_condition(name));
        }

        let prev = self.get(name);
        if prev == next {
            return Ok(false);
        }

        if next == CondState::Off {
            self.vals.remove(name);
        } else {
            self.vals.insert(name.to_string(), next);
        }
        self.mirror(name, next);
        Ok(true)
    }

    /// Mark every known condition under `prefix` as flux, deferring the
    /// on/off decision to a later set/clear. Used by event producers
    /// that must refresh their view without stopping dependents.
    pub fn reassert(&mut self, prefix: &str) -> usize {
        let names = self.matching(prefix);
        for name in &names {
            self.vals.insert(name.clone(), CondState::Flux);
            self.mirror(name, CondState::Flux);
        }
        names.len()
    }

    /// Clear every condition under `prefix` in one logical step.
    pub fn deassert(&mut self, prefix: &str) -> usize {
        let names = self.matching(prefix);
        for name in &names {
            self.vals.remove(name);
            self.mirror(name, CondState::Off);
        }
        names.len()
    }

    /// Aggregate of a dependency list: off if any is off, else flux if
    /// any is flux, else on. The empty list aggregates to on.
    pub fn agg<'a, I>(&self, names: I) -> CondState
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut flux = false;
        for name in names {
            match self.get(name) {
                CondState::Off => return CondState::Off,
                CondState::Flux => flux = true,
                CondState::On => (),
            }
        }
        if flux {
            CondState::Flux
        } else {
            CondState::On
        }
    }

    /// True when `name` gates any entry of `deps`.
    pub fn affects(name: &str, deps: &[String]) -> bool {
        deps.iter().any(|d| d == name)
    }

    fn matching(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.trim_end_matches('/');
        self.vals
            .keys()
            .filter(|k| {
                k.as_str() == prefix
                    || (k.len() > prefix.len() && k.starts_with(prefix) && k.as_bytes()[prefix.len()] == b'/')
            })
            .cloned()
            .collect()
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.base.as_ref().map(|b| b.join(name))
    }

    fn write_reconf(&self) {
        let Some(path) = self.path(RECONF) else {
            return;
        };
        if let Err(err) = write_atomic(&path, &format!("{}\n", self.gen)) {
            warn!("failed updating condition generation {}: {}", path.display(), err);
        }
    }

    fn mirror(&self, name: &str, state: CondState) {
        let Some(path) = self.path(name) else {
            return;
        };

        let res = match state {
            CondState::On => {
                if let Some(dir) = path.parent() {
                    let _ = fs::create_dir_all(dir);
                }
                write_atomic(&path, &format!("{}\n", self.gen))
            }
            CondState::Off => match fs::remove_file(&path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
                _ => Ok(()),
            },
            CondState::Flux => {
                let _ = fs::remove_file(&path);
                if let Some(dir) = path.parent() {
                    let _ = fs::create_dir_all(dir);
                }
                let target = self.path(RECONF).unwrap();
                symlink(target, &path)
            }
        };

        if let Err(err) = res {
            warn!("failed mirroring condition {} -> {}: {}", name, state, err);
        }
    }
}

impl Default for CondStore {
    fn default() -> Self {
        CondStore::new()
    }
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
