use crate::sup::config::ServiceDef;
use crate::sup::errors::SupError;
use crate::sup::registry::Registry;
use std::collections::HashSet;

/// Outcome of diffing a fresh definition set against the registry.
/// Identities are reassigned stably by `(cmd, id)`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Not in the registry yet
    pub fresh: Vec<String>,
    /// Changed, and the service takes SIGHUP: the process survives
    pub changed_hup: Vec<String>,
    /// Changed in a way that needs a stop/start cycle
    pub changed_restart: Vec<String>,
    /// No longer configured; stopped and swept
    pub removed: Vec<String>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.changed_hup.is_empty() && self.changed_restart.is_empty() && self.removed.is_empty()
    }

    /// Identities that must be collected before the startup phase.
    pub fn teardown_targets(&self) -> impl Iterator<Item = &String> {
        self.removed.iter().chain(self.changed_restart.iter())
    }
}

/// Reject definition sets that carry the same `(cmd, id)` twice.
pub fn check_conflicts(defs: &[ServiceDef]) -> Result<(), SupError> {
    let mut seen = HashSet::new();
    for def in defs {
        if !seen.insert((def.cmd.as_str(), def.id.as_str())) {
            return Err(SupError::duplicate_identity(def.ident()));
        }
    }
    Ok(())
}

/// Classify every registry record against the incoming set. Protected
/// records and inetd connection children are never removed by reload.
pub fn classify(reg: &Registry, defs: &[ServiceDef]) -> Plan {
    let mut plan = Plan::default();

    for svc in reg.iter() {
        if svc.is_conn() || svc.def.protect {
            continue;
        }
        match defs
            .iter()
            .find(|d| d.cmd == svc.def.cmd && d.id == svc.def.id)
        {
            None => plan.removed.push(svc.ident()),
            Some(def) if *def == svc.def => (),
            Some(def) => {
                // a change is deliverable by SIGHUP only when both the
                // old and the new definition advertise the capability
                if svc.def.sighup && def.sighup {
                    plan.changed_hup.push(svc.ident());
                } else {
                    plan.changed_restart.push(svc.ident());
                }
            }
        }
    }

    for def in defs {
        if reg.by_key(&def.cmd, &def.id).is_none() {
            plan.fresh.push(def.ident());
        }
    }

    plan
}
