use crate::sup::Event;
use log::{debug, warn};
use nix::unistd::Pid;
use notify::{recommended_watcher, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;

/// What happened to a watched pid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidChange {
    /// Created or rewritten; the content decides what it means
    Created,
    Removed,
}

/// Watches daemon pid files and reports changes as events. One watch
/// per service; dropping a watch stops it.
pub trait PidWatch: Send {
    fn watch(&mut self, ident: &str, path: &Path);
    fn unwatch(&mut self, ident: &str);
}

/// Inotify-backed watcher. The pid file's parent directory is watched
/// non-recursively and events are filtered down to the file itself
/// before being forwarded to the supervisor loop.
pub struct NotifyWatch {
    tx: UnboundedSender<Event>,
    watchers: HashMap<String, RecommendedWatcher>,
}

impl NotifyWatch {
    pub fn new(tx: UnboundedSender<Event>) -> NotifyWatch {
        NotifyWatch {
            tx,
            watchers: HashMap::new(),
        }
    }
}

impl PidWatch for NotifyWatch {
    fn watch(&mut self, ident: &str, path: &Path) {
        self.unwatch(ident);

        let Some(dir) = path.parent().map(Path::to_path_buf) else {
            warn!("pid file {} has no parent directory", path.display());
            return;
        };

        let tx = self.tx.clone();
        let owner = ident.to_string();
        let target = path.to_path_buf();
        let watcher = recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!("pid file watcher error: {}", err);
                    return;
                }
            };
            if !event.paths.iter().any(|p| p == &target) {
                return;
            }
            let change = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => PidChange::Created,
                EventKind::Remove(_) => PidChange::Removed,
                _ => return,
            };
            let _ = tx.send(Event::PidFile {
                ident: owner.clone(),
                change,
            });
        });

        match watcher {
            Ok(mut watcher) => {
                if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
                    warn!("failed watching {}: {}", dir.display(), err);
                    return;
                }
                debug!("watching pid file {} for {}", path.display(), ident);
                self.watchers.insert(ident.to_string(), watcher);
            }
            Err(err) => warn!("failed creating pid file watcher: {}", err),
        }
    }

    fn unwatch(&mut self, ident: &str) {
        self.watchers.remove(ident);
    }
}

/// Read and validate a pid file: a single decimal pid greater than one.
pub fn read_pid(path: &Path) -> Option<Pid> {
    let text = fs::read_to_string(path).ok()?;
    let pid: i32 = text.trim().parse().ok()?;
    if pid > 1 {
        Some(Pid::from_raw(pid))
    } else {
        None
    }
}

/// Write the supervisor's view of the daemon's pid, atomically. Also
/// used to "touch" the file after SIGHUP so the daemon's re-assertion
/// is observed.
pub fn write_pid(path: &Path, pid: Pid) -> io::Result<()> {
    let tmp = tmp_name(path);
    fs::write(&tmp, format!("{}\n", pid.as_raw()))?;
    fs::rename(&tmp, path)
}

/// Remove a pid file the daemon left behind. Missing is fine.
pub fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn tmp_name(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
