use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use trapsupd::cli::Cli;
use trapsupd::runtime::{Shared, SharedRuntime};
use trapsupd::state::ModuleStatus;
use trapsupd::{backup, config, control, logging, reconcile, scheduler, signals};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_validated()?;
    let (logs_dir, _log_guards) = logging::init(&cli.logs_path, cli.verbose)?;
    signals::install()?;

    let abs_config_path =
        std::fs::canonicalize(&cli.config_template).unwrap_or_else(|_| cli.config_template.clone());

    let (mut loaded_config, adopted) = match backup::load_backup_if_present(&abs_config_path) {
        Ok(Some((config, adopted))) => {
            info!("preferring backup file over template for startup configuration");
            (config, adopted)
        }
        Ok(None) => (config::load_template(&cli.config_template)?, Vec::new()),
        Err(e) => {
            warn!("could not read backup file, falling back to template: {e}");
            (config::load_template(&cli.config_template)?, Vec::new())
        }
    };
    if loaded_config.supervisor.logs_directory.is_none() {
        loaded_config.supervisor.logs_directory = Some(logs_dir.display().to_string());
    }

    match backup::write_generated_config(&cli.configs_path, &loaded_config) {
        Ok(path) => info!("generated config written to {}", path.display()),
        Err(e) => warn!("could not write generated config: {e}"),
    }

    let started_at = Utc::now();
    let shared: SharedRuntime = Arc::new(Mutex::new(Shared::new(
        loaded_config.clone(),
        abs_config_path.clone(),
        started_at,
    )));

    {
        let mut guard = shared.lock().await;
        reconcile::reconcile(&mut guard.table, &loaded_config);
        for module in adopted {
            let Some(idx) = guard.table.find_by_name(&module.name) else {
                continue;
            };
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(module.pid as i32), None).is_ok();
            if !alive {
                continue;
            }
            if let Some(m) = guard.table.get_mut(idx) {
                m.pid = module.pid;
                m.is_my_child = false;
                m.status = ModuleStatus::Up;
                m.enabled = true;
                info!("re-adopted module {} at pid {}", m.name, m.pid);
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_handle = tokio::spawn(scheduler::Scheduler::new(shared.clone(), shutdown_rx.clone()).run());
    let control_handle = tokio::spawn(control::run(
        cli.daemon_socket.clone(),
        cli.logs_path.clone(),
        shared.clone(),
        shutdown_tx.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(signals::watch_sigsegv(shared.clone(), shutdown_tx.clone()));

    let mut operator_shutdown = shutdown_rx.clone();
    tokio::select! {
        sig = signals::wait_for_termination() => {
            info!("caught {sig}, shutting down");
            let _ = shutdown_tx.send(true);
        }
        _ = operator_shutdown.wait_for(|requested| *requested) => {
            info!("operator requested shutdown via config mode");
        }
    }

    let _ = scheduler_handle.await;

    {
        let guard = shared.lock().await;
        match backup::write_backup(&guard.config_path, &guard.config, &guard.table, guard.started_at) {
            Ok(path) => info!("backup written to {}", path.display()),
            Err(e) => warn!("backup write failed: {e}"),
        }
    }

    control_handle.abort();
    Ok(())
}
