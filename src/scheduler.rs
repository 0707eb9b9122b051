//! Lifecycle scheduler (C7): the ordered per-period pass that drives every
//! module through loaded → running → graceful-stop → force-kill, enforces
//! the restart budget, and maintains service-channel connections
//! (spec.md §4.6).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::sync::watch;
use tracing::warn;

use crate::config::IfcType;
use crate::events;
use crate::process::{launcher, resource_usage, service_channel, ServiceChannel};
use crate::runtime::SharedRuntime;
use crate::state::{ModuleStatus, RuntimeTable, ServiceConn};

const TICK_PERIOD: Duration = Duration::from_millis(1500);
const GRACE_PERIOD: Duration = Duration::from_millis(500);
/// Tumbling window for both restart-rate and service-failure enforcement
/// (spec.md §4.4, §4.6): "~45 s" at the 1.5 s tick period.
const WINDOW_PERIODS: u64 = 30;
const MAX_CONNECT_ATTEMPTS: u32 = 3;
const MAX_SERVICE_FAILURES: u32 = 3;
const STATS_EVERY_N_PERIODS: u64 = 30;

pub struct Scheduler {
    shared: SharedRuntime,
    shutdown: watch::Receiver<bool>,
    channels: HashMap<usize, ServiceChannel>,
    period: u64,
}

impl Scheduler {
    pub fn new(shared: SharedRuntime, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shared,
            shutdown,
            channels: HashMap::new(),
            period: 0,
        }
    }

    /// Run the scheduler loop until a shutdown has been requested and no
    /// module remains `up` (spec.md §4.6 step 2).
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(TICK_PERIOD);
        loop {
            interval.tick().await;
            if !self.tick().await {
                break;
            }
        }
    }

    async fn tick(&mut self) -> bool {
        self.period += 1;
        let mut guard = self.shared.lock().await;

        probe_liveness(&mut guard.table);

        let shutting_down = *self.shutdown.borrow();
        if shutting_down {
            // Stop-all: force every module's effective-enabled to false so
            // the graceful-stop -> force-kill cascade below drains every
            // running module instead of looping forever waiting for an
            // `enabled` flag nothing ever clears (original's
            // supervisor_termination / interactive_stop_configuration
            // stop-all path).
            force_disable_all(&mut guard.table);
        }

        if shutting_down && !any_up(&guard.table) {
            return false;
        }

        let supervisor_default = guard.config.supervisor.module_restarts;
        let logs_dir = guard
            .config
            .supervisor
            .logs_directory
            .clone()
            .unwrap_or_else(|| "/var/log/trapsupd".to_string());
        self.apply_reconciliation_effects(&mut guard.table, supervisor_default, Path::new(&logs_dir));
        graceful_stop_phase(&mut guard.table);

        tokio::time::sleep(GRACE_PERIOD).await;

        self.reap_exited(&mut guard.table);
        self.force_stop_phase(&mut guard.table);
        self.connect_service_channels(&mut guard.table).await;
        self.scrape(&mut guard.table).await;
        sample_resource_usage(&mut guard.table);

        if self.period % STATS_EVERY_N_PERIODS == 0 {
            for (_, m) in guard.table.iter() {
                events::log_module_statistics(m);
            }
        }

        true
    }

    /// Step 3: free removed rows, flip re-initialised rows back on,
    /// and start every module that is enabled, down, and under its cap.
    fn apply_reconciliation_effects(&mut self, table: &mut RuntimeTable, supervisor_default: u32, logs_dir: &Path) {
        let to_free: Vec<usize> = table
            .iter()
            .filter(|(_, m)| m.remove && m.status == ModuleStatus::Down)
            .map(|(i, _)| i)
            .collect();
        for idx in to_free {
            self.channels.remove(&idx);
            table.free(idx);
        }

        for (_, m) in table.iter_mut() {
            if m.init && m.status == ModuleStatus::Down {
                m.enabled = true;
                m.restart_counter = -1;
                m.init = false;
            }
        }

        let mut to_disable = Vec::new();
        for (idx, m) in table.iter_mut() {
            if !(m.enabled && m.status == ModuleStatus::Down) {
                continue;
            }

            if m.restart_counter >= 0 && self.period.saturating_sub(m.restart_window_start) >= WINDOW_PERIODS {
                m.restart_counter = 0;
                m.restart_window_start = self.period;
            }

            let cap = m.effective_restart_cap(supervisor_default) as i64;
            if m.restart_counter >= cap {
                continue;
            }

            if m.restart_counter < 0 {
                m.restart_window_start = self.period;
            }

            match launcher::spawn(m, logs_dir) {
                Ok(pid) => {
                    m.pid = pid;
                    m.is_my_child = true;
                    m.status = ModuleStatus::Up;
                    m.service_conn = ServiceConn::Disconnected;
                    m.service_attempts = 0;
                    m.service_failures = 0;
                    m.sigint_sent = false;
                    m.restart_counter += 1;
                    // A new PID starts its own cumulative /proc counters;
                    // the next resource sample must re-establish a
                    // baseline rather than diff against the old child's
                    // (or, for the very first start, a zeroed) counters.
                    m.cpu_baseline_set = false;
                    events::module_started(&m.name);
                    if m.restart_counter >= cap {
                        to_disable.push(idx);
                    }
                }
                Err(e) => {
                    warn!("failed to start module {}: {e}", m.name);
                    m.enabled = false;
                    m.restart_counter += 1;
                }
            }
        }

        for idx in to_disable {
            if let Some(m) = table.get_mut(idx) {
                m.enabled = false;
                events::module_auto_disabled(&m.name);
            }
        }
    }

    fn reap_exited(&mut self, table: &mut RuntimeTable) {
        for (idx, m) in table.iter_mut() {
            if !(m.is_my_child && m.pid > 0) {
                continue;
            }
            match waitpid(Pid::from_raw(m.pid as i32), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    m.status = ModuleStatus::Down;
                    m.pid = 0;
                    m.service_conn = ServiceConn::Disconnected;
                    self.channels.remove(&idx);
                }
                _ => {}
            }
        }
    }

    /// Step 7: for any module still `up` with `sigint_sent`, send
    /// `SIGKILL` and unlink its on-disk socket files.
    fn force_stop_phase(&mut self, table: &mut RuntimeTable) {
        for (idx, m) in table.iter_mut() {
            if m.status != ModuleStatus::Up || !m.sigint_sent {
                continue;
            }
            let _ = kill(Pid::from_raw(m.pid as i32), Signal::SIGKILL);
            events::module_force_killed(&m.name);
            for ifc in &m.interfaces {
                if ifc.direction == crate::config::Direction::Out
                    && ifc.ty == IfcType::UnixSocket
                    && !ifc.params.is_empty()
                {
                    let _ = std::fs::remove_file(&ifc.params);
                }
            }
            let _ = std::fs::remove_file(service_channel::socket_path(m.pid));
            self.channels.remove(&idx);
        }
    }

    /// Step 8: attempt a C5 connect for every `up`, disconnected,
    /// unblocked module (spec.md §4.4 connection policy).
    async fn connect_service_channels(&mut self, table: &mut RuntimeTable) {
        let candidates: Vec<usize> = table
            .iter()
            .filter(|(_, m)| m.status == ModuleStatus::Up && m.service_conn == ServiceConn::Disconnected)
            .map(|(i, _)| i)
            .collect();

        for idx in candidates {
            let pid = match table.get(idx) {
                Some(m) => m.pid,
                None => continue,
            };
            match ServiceChannel::connect(pid).await {
                Ok(channel) => {
                    self.channels.insert(idx, channel);
                    if let Some(m) = table.get_mut(idx) {
                        m.service_conn = ServiceConn::Connected;
                    }
                }
                Err(_) => {
                    if let Some(m) = table.get_mut(idx) {
                        m.service_attempts += 1;
                        if m.service_attempts >= MAX_CONNECT_ATTEMPTS {
                            m.service_conn = ServiceConn::Blocked;
                        }
                    }
                }
            }
        }
    }

    /// Step 9: scrape counters from every connected module.
    async fn scrape(&mut self, table: &mut RuntimeTable) {
        let connected: Vec<usize> = self.channels.keys().copied().collect();
        for idx in connected {
            let Some(channel) = self.channels.get_mut(&idx) else {
                continue;
            };
            let reply = channel.get_counters().await;

            let Some(m) = table.get_mut(idx) else {
                self.channels.remove(&idx);
                continue;
            };

            match reply {
                Ok(payload) => {
                    let n_in = m.in_interfaces().count();
                    let n_out = m.out_interfaces().count();
                    match crate::process::decode_counters(&payload, n_in, n_out) {
                        Ok(decoded) => apply_decoded_counters(m, decoded),
                        Err(e) => {
                            warn!("malformed counter reply from {}: {e}", m.name);
                            record_service_failure(m, self.period);
                            self.channels.remove(&idx);
                        }
                    }
                }
                Err(e) => {
                    warn!("service channel error for {}: {e}", m.name);
                    record_service_failure(m, self.period);
                    self.channels.remove(&idx);
                }
            }
        }
    }
}

fn apply_decoded_counters(m: &mut crate::state::RuntimeModule, decoded: crate::process::DecodedCounters) {
    let mut in_iter = decoded.input.into_iter();
    let mut out_iter = decoded.output.into_iter();
    for ifc in &mut m.interfaces {
        match ifc.direction {
            crate::config::Direction::In => {
                if let Some(Some(stats)) = in_iter.next() {
                    ifc.input_stats = Some(stats);
                }
            }
            crate::config::Direction::Out => {
                if let Some(Some(stats)) = out_iter.next() {
                    ifc.output_stats = Some(stats);
                }
            }
            crate::config::Direction::Service => {}
        }
    }
}

fn record_service_failure(m: &mut crate::state::RuntimeModule, period: u64) {
    if period.saturating_sub(m.service_fail_window_start) >= WINDOW_PERIODS {
        m.service_failures = 0;
        m.service_fail_window_start = period;
    }
    m.service_failures += 1;
    m.service_conn = ServiceConn::Disconnected;
    if m.service_failures >= MAX_SERVICE_FAILURES {
        m.service_conn = ServiceConn::Blocked;
    }
}

/// Step 1: for each module with `pid > 0`, send a null signal; transition
/// to `down` on `ESRCH`.
fn probe_liveness(table: &mut RuntimeTable) {
    for (_, m) in table.iter_mut() {
        if m.pid == 0 {
            continue;
        }
        if kill(Pid::from_raw(m.pid as i32), None).is_err() {
            m.status = ModuleStatus::Down;
            m.service_conn = ServiceConn::Disconnected;
            m.pid = 0;
        }
    }
}

/// CPU/memory scraping (spec.md §1/§2 C7: "scraping liveness, CPU/memory
/// and interface-level counters"), grounded on
/// `original_source/supervisor.c`'s per-tick `update_module_cpu_usage`/
/// `update_module_mem_usage`. `/proc/<pid>/stat`'s `utime`/`stime` are
/// cumulative since the process started, so CPU percentage is the delta
/// against the previous sample divided by the elapsed tick period; the
/// first sample after a (re)start only establishes that baseline.
fn sample_resource_usage(table: &mut RuntimeTable) {
    let clk_tck = resource_usage::clock_ticks_per_sec();
    let elapsed_secs = TICK_PERIOD.as_secs_f64();

    for (_, m) in table.iter_mut() {
        if m.status != ModuleStatus::Up || m.pid == 0 {
            continue;
        }
        let usage = match resource_usage::sample(m.pid) {
            Ok(usage) => usage,
            Err(_) => continue,
        };

        if m.cpu_baseline_set {
            let delta_user = (usage.utime_ticks as f64 - m.last_cpu_user).max(0.0);
            let delta_kernel = (usage.stime_ticks as f64 - m.last_cpu_kernel).max(0.0);
            m.last_pct_cpu_user = delta_user / clk_tck / elapsed_secs * 100.0;
            m.last_pct_cpu_kernel = delta_kernel / clk_tck / elapsed_secs * 100.0;
        } else {
            m.last_pct_cpu_user = 0.0;
            m.last_pct_cpu_kernel = 0.0;
            m.cpu_baseline_set = true;
        }
        m.last_cpu_user = usage.utime_ticks as f64;
        m.last_cpu_kernel = usage.stime_ticks as f64;
        m.vmsize_kib = usage.vmsize_kib;
    }
}

fn any_up(table: &RuntimeTable) -> bool {
    table.iter().any(|(_, m)| m.status == ModuleStatus::Up)
}

/// Force every module's effective-enabled flag false (spec.md §5
/// "Cancellation"). Called every tick once a shutdown has been requested,
/// so `graceful_stop_phase` below has something to act on even for
/// modules the reconciler would otherwise keep enabled.
fn force_disable_all(table: &mut RuntimeTable) {
    for (_, m) in table.iter_mut() {
        m.enabled = false;
    }
}

/// Step 4: send `SIGINT` to every `up` module whose effective-enabled just
/// went false and has not yet been signalled.
fn graceful_stop_phase(table: &mut RuntimeTable) {
    for (_, m) in table.iter_mut() {
        if m.status == ModuleStatus::Up && !m.enabled && !m.sigint_sent {
            let _ = kill(Pid::from_raw(m.pid as i32), Signal::SIGINT);
            m.sigint_sent = true;
            events::module_stopping_sigint(&m.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Module as DeclModule;
    use crate::state::RuntimeModule;

    fn decl(name: &str) -> DeclModule {
        DeclModule {
            name: name.to_string(),
            path: "/bin/true".to_string(),
            enabled: true,
            restart_cap: None,
            params: None,
            interfaces: vec![],
        }
    }

    #[test]
    fn graceful_stop_signals_only_once() {
        let mut table = RuntimeTable::new();
        let idx = table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        let m = table.get_mut(idx).unwrap();
        m.status = ModuleStatus::Up;
        m.enabled = false;
        m.pid = std::process::id();

        graceful_stop_phase(&mut table);
        assert!(table.get(idx).unwrap().sigint_sent);
    }

    #[test]
    fn force_disable_all_clears_enabled_so_shutdown_can_drain() {
        let mut table = RuntimeTable::new();
        let idx = table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        let m = table.get_mut(idx).unwrap();
        m.status = ModuleStatus::Up;
        m.enabled = true;
        m.pid = std::process::id();

        force_disable_all(&mut table);
        assert!(!table.get(idx).unwrap().enabled);

        graceful_stop_phase(&mut table);
        assert!(table.get(idx).unwrap().sigint_sent, "stop-all must signal every up module once disabled");
    }

    #[test]
    fn record_service_failure_blocks_after_max_failures() {
        let mut table = RuntimeTable::new();
        let idx = table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        let m = table.get_mut(idx).unwrap();
        for period in 1..=MAX_SERVICE_FAILURES as u64 {
            record_service_failure(m, period);
        }
        assert_eq!(m.service_conn, ServiceConn::Blocked);
    }

    #[test]
    fn sample_resource_usage_first_sample_is_baseline_only() {
        let mut table = RuntimeTable::new();
        let idx = table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        let m = table.get_mut(idx).unwrap();
        m.status = ModuleStatus::Up;
        m.pid = std::process::id();

        sample_resource_usage(&mut table);
        let m = table.get(idx).unwrap();
        assert!(m.cpu_baseline_set);
        assert_eq!(m.last_pct_cpu_user, 0.0);
        assert_eq!(m.last_pct_cpu_kernel, 0.0);
        assert!(m.vmsize_kib > 0, "vmsize should be populated from /proc on the first sample");
    }

    #[test]
    fn sample_resource_usage_skips_modules_that_are_not_up() {
        let mut table = RuntimeTable::new();
        let idx = table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        table.get_mut(idx).unwrap().pid = std::process::id();

        sample_resource_usage(&mut table);
        assert!(!table.get(idx).unwrap().cpu_baseline_set);
    }
}
