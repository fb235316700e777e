pub mod api;
pub mod client;
pub mod proto;

use crate::manager::{self, NixProc, PowerMode};
use crate::sup::cond::CondStore;
use crate::sup::inetd::TokioListeners;
use crate::sup::pidfile::NotifyWatch;
use crate::sup::timer::TokioTimers;
use crate::sup::{config, Event, Settings, Sup};
use anyhow::{Context, Result};
use log::{debug, error, info};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Wire up logging: tagged single-line records to stdout, mirrored to
/// the kernel ring buffer when `/dev/kmsg` is writable. As pid 1 there
/// may be nothing else collecting our output yet.
fn logger(tag: &'static str, level: log::LevelFilter) -> Result<()> {
    let mut dispatch = fern::Dispatch::new()
        .level(level)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} ({}) {}: {}",
                tag,
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(std::io::stdout());

    if let Ok(kmsg) = std::fs::OpenOptions::new().write(true).open("/dev/kmsg") {
        dispatch = dispatch.chain(kmsg);
    }

    dispatch.apply().map_err(Into::into)
}

fn absolute<P: AsRef<Path>>(p: P) -> Result<PathBuf> {
    // join() leaves already-absolute paths untouched
    Ok(std::env::current_dir()?.join(p.as_ref()))
}

/// Options for running as the supervisor.
pub struct InitOpts {
    pub config: String,
    pub socket: String,
    pub runlevel: u8,
    pub container: bool,
    pub debug: bool,
}

/// Run as the supervisor: load definitions, open the control socket,
/// supervise until told to go down.
pub async fn init(opts: InitOpts) -> Result<()> {
    let level = if opts.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    if let Err(err) = logger("rinit", level) {
        eprintln!("failed to setup logging: {}", err);
    }

    let conf_dir = absolute(&opts.config).context("failed to resolve config dir")?;
    let socket = absolute(&opts.socket).context("failed to resolve socket path")?;

    let settings = Settings {
        conf_dir: conf_dir.clone(),
        run_dir: PathBuf::from("/run/rinit"),
        pid_dir: PathBuf::from("/run"),
        default_runlevel: opts.runlevel,
        container: opts.container,
    };

    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {:?}", dir))?;
    }

    // the condition directory and the control socket are critical
    // plumbing; failing to set them up means we cannot supervise
    let conds = CondStore::with_base(settings.run_dir.join("cond"))
        .context("failed to set up condition directory")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sup = Sup::new(
        settings,
        conds,
        Box::new(NixProc::new()),
        Box::new(TokioTimers::new(tx.clone())),
        Box::new(NotifyWatch::new(tx.clone())),
        Box::new(TokioListeners::new(tx.clone())),
        tx.clone(),
    );

    let defs = config::load_dir(&conf_dir)?;
    info!("loaded {} service definitions from {}", defs.len(), conf_dir.display());
    for def in defs {
        sup.register(def);
    }

    tokio::spawn(manager::reap(tx.clone()));
    tokio::spawn(signals(tx.clone()));

    let api = api::Api::new(&socket, tx.clone());
    tokio::spawn(async move {
        if let Err(err) = api.serve().await {
            error!("control socket failed: {:#}", err);
        }
    });

    sup.bootstrap();
    while let Some(event) = rx.recv().await {
        sup.handle_event(event);
        if sup.finished() {
            break;
        }
    }
    Ok(())
}

/// Translate process signals into supervisor events. SIGCHLD is owned
/// by the reaper; everything else lands here.
async fn signals(tx: mpsc::UnboundedSender<Event>) {
    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(err) => {
            error!("failed to bind signals: {}", err);
            return;
        }
    };
    // the rest share the error path
    let sig = |kind: SignalKind| signal(kind).expect("failed to bind signal");
    let mut int = sig(SignalKind::interrupt());
    let mut quit = sig(SignalKind::quit());
    let mut term = sig(SignalKind::terminate());
    let mut usr1 = sig(SignalKind::user_defined1());
    let mut usr2 = sig(SignalKind::user_defined2());
    let mut alrm = sig(SignalKind::alarm());
    let mut pwr = sig(SignalKind::from_raw(nix::libc::SIGPWR));
    let mut tstp = sig(SignalKind::from_raw(nix::libc::SIGTSTP));
    let mut cont = sig(SignalKind::from_raw(nix::libc::SIGCONT));

    loop {
        let event = tokio::select! {
            _ = hup.recv() => Event::Reload,
            _ = int.recv() => Event::Shutdown(PowerMode::Reboot),
            _ = quit.recv() => Event::Shutdown(PowerMode::Halt),
            _ = term.recv() => Event::Shutdown(PowerMode::Halt),
            _ = usr1.recv() => Event::Shutdown(PowerMode::Halt),
            _ = usr2.recv() => Event::Shutdown(PowerMode::Reboot),
            _ = pwr.recv() => Event::Shutdown(PowerMode::Poweroff),
            _ = tstp.recv() => Event::NoRespawn(true),
            _ = cont.recv() => Event::NoRespawn(false),
            _ = alrm.recv() => Event::Work,
        };
        debug!("signal -> {:?}", event);
        if tx.send(event).is_err() {
            return;
        }
    }
}
