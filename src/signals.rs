//! Signal handling (spec.md §5, §7): `SIGINT`/`SIGTERM`/`SIGQUIT` initiate
//! a cooperative shutdown; `SIGSEGV` is caught only to attempt a
//! best-effort backup before the process re-raises/exits; `SIGPIPE` is
//! ignored entirely.
//!
//! `SIGSEGV`'s handler in spec.md §5 "must do no more than set flags" —
//! here it sets an [`AtomicBool`] exactly as the other signals do. A
//! dedicated low-frequency poll task (not the signal handler itself)
//! performs the actual backup write, since XML serialization and file I/O
//! are not async-signal-safe; this trades a small window of missed
//! coverage (a second crash before the poll observes the flag) for never
//! doing unsafe work inside the handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{signal, SigHandler, Signal};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::runtime::SharedRuntime;

static SIGSEGV_CAUGHT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigsegv(_: i32) {
    SIGSEGV_CAUGHT.store(true, Ordering::SeqCst);
}

/// Install the `SIGSEGV` handler and ignore `SIGPIPE`, matching
/// `original_source/supervisor.c`'s `signal(SIGPIPE, SIG_IGN)`.
pub fn install() -> Result<(), nix::Error> {
    unsafe {
        signal(Signal::SIGSEGV, SigHandler::Handler(on_sigsegv))?;
        signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}

/// Wait for `SIGINT`, `SIGTERM`, or `SIGQUIT` (spec.md §5), whichever
/// comes first.
pub async fn wait_for_termination() -> &'static str {
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("failed to install SIGINT handler");
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    let mut sigquit = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())
        .expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    }
}

/// Poll for a caught `SIGSEGV` and, if seen, write a best-effort backup and
/// exit with code `1` (spec.md §6 "Exit codes").
pub async fn watch_sigsegv(shared: SharedRuntime, shutdown_tx: watch::Sender<bool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(200));
    loop {
        interval.tick().await;
        if !SIGSEGV_CAUGHT.load(Ordering::SeqCst) {
            continue;
        }

        error!("caught SIGSEGV, attempting best-effort backup before exit");
        let guard = shared.lock().await;
        match crate::backup::write_backup(&guard.config_path, &guard.config, &guard.table, guard.started_at) {
            Ok(path) => info!("backup written to {}", path.display()),
            Err(e) => warn!("backup write failed after SIGSEGV: {e}"),
        }
        drop(guard);
        let _ = shutdown_tx.send(true);
        std::process::exit(1);
    }
}
