use std::collections::HashMap;

/// Named moments in bootstrap, runtime and shutdown at which external
/// chains run before the supervisor proceeds. Running a point also
/// asserts its `hook/<name>` condition so late services can gate on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// First thing after the logger is up
    Banner,
    /// All bootstrap services have been started
    SvcUp,
    /// The configured default runlevel has been entered
    SystemUp,
    /// Between reload teardown and restart
    SvcReconf,
    /// Between runlevel teardown and startup
    RunlevelChange,
    /// Fleet stopped, about to signal stragglers and go down
    Shutdown,
}

impl HookPoint {
    pub fn cond_name(&self) -> &'static str {
        match self {
            HookPoint::Banner => "hook/banner",
            HookPoint::SvcUp => "hook/svc-up",
            HookPoint::SystemUp => "hook/system-up",
            HookPoint::SvcReconf => "hook/svc-reconf",
            HookPoint::RunlevelChange => "hook/runlevel-change",
            HookPoint::Shutdown => "hook/shutdown",
        }
    }
}

type HookFn = Box<dyn FnMut(HookPoint) + Send>;

/// Chains of callables over named points. No dynamic loading; chains
/// are registered at build/startup time.
#[derive(Default)]
pub struct Hooks {
    chains: HashMap<HookPoint, Vec<HookFn>>,
}

impl Hooks {
    pub fn new() -> Hooks {
        Hooks::default()
    }

    pub fn register<F>(&mut self, point: HookPoint, hook: F)
    where
        F: FnMut(HookPoint) + Send + 'static,
    {
        self.chains.entry(point).or_default().push(Box::new(hook));
    }

    /// Run the chain for `point`, in registration order. Returns how
    /// many callables ran.
    pub fn run(&mut self, point: HookPoint) -> usize {
        match self.chains.get_mut(&point) {
            Some(chain) => {
                for hook in chain.iter_mut() {
                    hook(point);
                }
                chain.len()
            }
            None => 0,
        }
    }
}
