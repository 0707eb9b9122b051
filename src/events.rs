//! Module lifecycle events and statistics-log line formatting (spec.md §6,
//! scenario 1's `[START]`/`[STOP]` log lines, and the per-tick
//! `AutoDisabled` event from spec.md §4.6 step 3 / invariant I-7).

use tracing::info;

use crate::config::Direction;
use crate::logging::{MODULE_EVENT_TARGET, STATS_TARGET};
use crate::state::RuntimeModule;

pub fn module_started(name: &str) {
    info!(target: MODULE_EVENT_TARGET, "[START] Starting module {name}");
}

pub fn module_stopping_sigint(name: &str) {
    info!(target: MODULE_EVENT_TARGET, "[STOP] Stopping module {name}... sending SIGINT");
}

pub fn module_force_killed(name: &str) {
    info!(target: MODULE_EVENT_TARGET, "[STOP] Module {name} did not exit in time, sending SIGKILL");
}

pub fn module_auto_disabled(name: &str) {
    info!(target: MODULE_EVENT_TARGET, "AutoDisabled module {name}: restart cap reached within window");
}

/// Render the four statistics-log line formats for one module (spec.md
/// §6), without emitting them anywhere. Shared by the periodic statistics
/// log (`log_module_statistics`) and the operator stats-mode snapshot
/// (`control::commands::statistics_snapshot_lines`), so both present
/// exactly the same per-module numbers.
pub fn format_module_statistics(m: &RuntimeModule) -> Vec<String> {
    let mut lines = Vec::new();
    let mut in_idx = 0usize;
    let mut out_idx = 0usize;
    for ifc in &m.interfaces {
        match ifc.direction {
            Direction::In => {
                if let Some(stats) = ifc.input_stats {
                    lines.push(format!(
                        "{},in,{},{},{}",
                        m.name, in_idx, stats.recv_msg, stats.recv_buffer
                    ));
                }
                in_idx += 1;
            }
            Direction::Out => {
                if let Some(stats) = ifc.output_stats {
                    lines.push(format!(
                        "{},out,{},{},{},{},{}",
                        m.name, out_idx, stats.sent_msg, stats.dropped_msg, stats.sent_buffer, stats.autoflush
                    ));
                }
                out_idx += 1;
            }
            Direction::Service => {}
        }
    }

    lines.push(format!(
        "{},cpu,{},{}",
        m.name, m.last_pct_cpu_kernel, m.last_pct_cpu_user
    ));
    lines.push(format!("{},mem,{}", m.name, m.vmsize_kib));
    lines
}

/// Emit the four statistics-log line formats for one module (spec.md §6).
pub fn log_module_statistics(m: &RuntimeModule) {
    for line in format_module_statistics(m) {
        info!(target: STATS_TARGET, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Module as DeclModule;

    #[test]
    fn statistics_logging_does_not_panic_on_a_module_with_no_interfaces() {
        let decl = DeclModule {
            name: "a".to_string(),
            path: "/bin/true".to_string(),
            enabled: true,
            restart_cap: None,
            params: None,
            interfaces: vec![],
        };
        let m = RuntimeModule::new_from_declared(&decl, None, 0);
        log_module_statistics(&m);
    }

    #[test]
    fn format_module_statistics_emits_cpu_and_mem_lines_with_no_interfaces() {
        let decl = DeclModule {
            name: "a".to_string(),
            path: "/bin/true".to_string(),
            enabled: true,
            restart_cap: None,
            params: None,
            interfaces: vec![],
        };
        let m = RuntimeModule::new_from_declared(&decl, None, 0);
        let lines = format_module_statistics(&m);
        assert_eq!(lines, vec!["a,cpu,0,0".to_string(), "a,mem,0".to_string()]);
    }
}
