use crate::sup::config::ServiceDef;
use crate::sup::service::Service;
use nix::unistd::Pid;

/// Result of an upsert into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    Inserted,
    /// Definition replaced in place, runtime state kept
    Updated,
    /// Definition identical to the stored one
    Unchanged,
}

/// The collection of service records.
///
/// Backed by a plain vector so iteration follows registration order;
/// the order definitions were loaded in is the order the machine steps
/// them in, which is what makes file-load order meaningful.
#[derive(Default)]
pub struct Registry {
    svcs: Vec<Service>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { svcs: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.svcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.svcs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.svcs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Service> {
        self.svcs.iter_mut()
    }

    /// Identity snapshot in registration order, for sweeps that mutate
    /// the registry while walking it.
    pub fn idents(&self) -> Vec<String> {
        self.svcs.iter().map(|s| s.ident()).collect()
    }

    pub fn get(&self, ident: &str) -> Option<&Service> {
        self.svcs.iter().find(|s| s.ident() == ident)
    }

    pub fn get_mut(&mut self, ident: &str) -> Option<&mut Service> {
        self.svcs.iter_mut().find(|s| s.ident() == ident)
    }

    pub fn by_key(&self, cmd: &str, id: &str) -> Option<&Service> {
        self.svcs
            .iter()
            .find(|s| s.def.cmd == cmd && s.def.id == id)
    }

    pub fn by_key_mut(&mut self, cmd: &str, id: &str) -> Option<&mut Service> {
        self.svcs
            .iter_mut()
            .find(|s| s.def.cmd == cmd && s.def.id == id)
    }

    pub fn by_pid_mut(&mut self, pid: Pid) -> Option<&mut Service> {
        if pid.as_raw() <= 1 {
            return None;
        }
        self.svcs.iter_mut().find(|s| s.pid == pid)
    }

    /// Insert a new definition or update the record with the same
    /// `(cmd, id)` in place, preserving pid, state and counters.
    pub fn register(&mut self, def: ServiceDef) -> Registered {
        match self.by_key_mut(&def.cmd, &def.id) {
            Some(svc) => {
                if svc.def == def {
                    Registered::Unchanged
                } else {
                    svc.def = def;
                    Registered::Updated
                }
            }
            None => {
                self.svcs.push(Service::new(def));
                Registered::Inserted
            }
        }
    }

    /// Insert a prebuilt record (inetd connections).
    pub fn insert(&mut self, svc: Service) {
        self.svcs.push(svc);
    }

    pub fn remove(&mut self, ident: &str) -> Option<Service> {
        let at = self.svcs.iter().position(|s| s.ident() == ident)?;
        Some(self.svcs.remove(at))
    }

    /// Drop every record marked doomed, returning their identities.
    pub fn sweep_doomed(&mut self) -> Vec<String> {
        let mut removed = Vec::new();
        self.svcs.retain(|s| {
            if s.doomed {
                removed.push(s.ident());
                false
            } else {
                true
            }
        });
        removed
    }
}
