//! Config-mode menu actions (spec.md §4.7 step 3): enable/disable,
//! status, full listing, info, and the show-logs sidecar.

use std::path::Path;

use crate::state::{ModuleStatus, RuntimeTable, ServiceConn};

const SHOW_LOGS_SIDECAR: &str = "/tmp/tmp_sup_cli_file";

fn set_module_enabled(table: &mut RuntimeTable, idx: usize, enabled: bool) {
    if let Some(m) = table.get_mut(idx) {
        let was_enabled = m.enabled;
        m.enabled = enabled;
        if enabled && !was_enabled {
            m.restart_counter = -1;
        }
    }
}

pub fn enable_all(table: &mut RuntimeTable) {
    let idxs: Vec<usize> = table.iter().map(|(i, _)| i).collect();
    for idx in idxs {
        set_module_enabled(table, idx, true);
    }
}

pub fn disable_all(table: &mut RuntimeTable) {
    let idxs: Vec<usize> = table.iter().map(|(i, _)| i).collect();
    for idx in idxs {
        set_module_enabled(table, idx, false);
    }
}

/// `selection` indexes into `[0, loaded_modules) ∪ [loaded_modules,
/// loaded_modules+loaded_profiles)` (spec.md §4.7 step 4): the first range
/// addresses modules in declared order, the second addresses profiles.
pub fn apply_selection(table: &mut RuntimeTable, selection: &[usize], enabled: bool) {
    let declared = table.in_declared_order();
    let n_modules = declared.len();

    for &i in selection {
        if i < n_modules {
            set_module_enabled(table, declared[i], enabled);
        } else {
            let profile_idx = i - n_modules;
            if profile_idx >= table.profiles.len() {
                continue;
            }
            let member_idxs: Vec<usize> = table
                .iter()
                .filter(|(_, m)| m.profile == Some(profile_idx))
                .map(|(idx, _)| idx)
                .collect();
            for idx in member_idxs {
                set_module_enabled(table, idx, enabled);
            }
        }
    }
}

pub fn selection_space_size(table: &RuntimeTable) -> usize {
    table.len() + table.profiles.len()
}

pub fn status_lines(table: &RuntimeTable) -> Vec<String> {
    table
        .in_declared_order()
        .into_iter()
        .filter_map(|idx| table.get(idx))
        .map(|m| {
            format!(
                "{} {} pid={} enabled={}",
                m.name,
                if m.status == ModuleStatus::Up { "up" } else { "down" },
                m.pid,
                m.enabled
            )
        })
        .collect()
}

pub fn full_listing_lines(table: &RuntimeTable) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, idx) in table.in_declared_order().into_iter().enumerate() {
        let Some(m) = table.get(idx) else { continue };
        let conn = match m.service_conn {
            ServiceConn::Disconnected => "disconnected",
            ServiceConn::Connected => "connected",
            ServiceConn::Blocked => "blocked",
        };
        lines.push(format!(
            "{i} | {} | status={:?} enabled={} pid={} service={conn} interfaces={}",
            m.name,
            m.status,
            m.enabled,
            m.pid,
            m.interfaces.len()
        ));
    }
    for (i, profile) in table.profiles.iter().enumerate() {
        lines.push(format!(
            "{} | <profile {}> | enabled={}",
            table.len() + i,
            profile.name,
            profile.enabled
        ));
    }
    lines
}

/// Stats-mode snapshot (spec.md §4.7 step 1, mode `3`): one
/// `events::format_module_statistics` block per module in declared order,
/// the same interface/cpu/mem lines the periodic statistics log emits.
pub fn statistics_snapshot_lines(table: &RuntimeTable) -> Vec<String> {
    table
        .in_declared_order()
        .into_iter()
        .filter_map(|idx| table.get(idx))
        .flat_map(crate::events::format_module_statistics)
        .collect()
}

pub fn info_lines(table: &RuntimeTable, started_at: chrono::DateTime<chrono::Utc>) -> Vec<String> {
    let running = table.iter().filter(|(_, m)| m.status == ModuleStatus::Up).count();
    vec![
        format!("started_at={started_at}"),
        format!("loaded_modules={}", table.len()),
        format!("loaded_profiles={}", table.profiles.len()),
        format!("running_modules={running}"),
    ]
}

/// Write the absolute log path to the well-known sidecar file rather than
/// streaming the log contents (spec.md §4.7 step 5).
pub fn write_show_logs_sidecar(log_path: &Path) -> std::io::Result<()> {
    std::fs::write(SHOW_LOGS_SIDECAR, log_path.display().to_string())
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
    fn disable_all_then_enable_all_round_trips() {
        let mut table = RuntimeTable::new();
        table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        table.insert(RuntimeModule::new_from_declared(&decl("b"), None, 1));

        disable_all(&mut table);
        assert!(table.iter().all(|(_, m)| !m.enabled));

        enable_all(&mut table);
        assert!(table.iter().all(|(_, m)| m.enabled));
    }

    #[test]
    fn statistics_snapshot_lines_covers_every_module_in_declared_order() {
        let mut table = RuntimeTable::new();
        table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        table.insert(RuntimeModule::new_from_declared(&decl("b"), None, 1));

        let lines = statistics_snapshot_lines(&table);
        assert_eq!(
            lines,
            vec![
                "a,cpu,0,0".to_string(),
                "a,mem,0".to_string(),
                "b,cpu,0,0".to_string(),
                "b,mem,0".to_string(),
            ]
        );
    }

    #[test]
    fn apply_selection_targets_declared_order_not_slot_index() {
        let mut table = RuntimeTable::new();
        let a = table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        let b = table.insert(RuntimeModule::new_from_declared(&decl("b"), None, 1));
        table.free(a);
        let c = table.insert(RuntimeModule::new_from_declared(&decl("c"), None, 2));

        apply_selection(&mut table, &[0], false);
        assert!(!table.get(b).unwrap().enabled, "declared index 0 is b, not the freed slot");
        assert!(table.get(c).unwrap().enabled);
    }
}
