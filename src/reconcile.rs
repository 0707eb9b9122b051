//! The reconciliation engine (C3): diffs `old_state` against a freshly
//! validated `new_config` and produces a minimal set of mutations over the
//! live runtime table, per spec.md §4.2.
//!
//! This is the single largest component by design (spec.md §2 assigns it
//! 25% of the implementation budget) precisely because it is the one place
//! where "minimal disruption" is a correctness property, not a style
//! preference: P2/P3 in spec.md §8 both pin down its exact output shape.

use tracing::info;

use crate::config::ValidatedConfig;
use crate::state::{RuntimeModule, RuntimeProfile, RuntimeTable};

/// One-line summary emitted after every reconciliation pass (spec.md §4.2
/// step 7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub inserted: u32,
    pub removed: u32,
    pub modified: u32,
    pub unchanged: u32,
}

impl std::fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reconcile: inserted={} removed={} modified={} unchanged={}",
            self.inserted, self.removed, self.modified, self.unchanged
        )
    }
}

/// Run one reconciliation pass. Must be called with the configuration
/// mutex held (spec.md §5) so the scheduler never observes a half-applied
/// reload.
pub fn reconcile(table: &mut RuntimeTable, new_config: &ValidatedConfig) -> ReconcileSummary {
    // Step 1: clear transient flags on every live module.
    for (_, m) in table.iter_mut() {
        m.seen = false;
        m.modified = false;
        m.inserted = false;
        m.remove = false;
    }

    let supervisor_default = new_config.supervisor.module_restarts;
    let mut new_profiles: Vec<RuntimeProfile> = Vec::new();
    let mut summary = ReconcileSummary::default();
    let mut declared_seq: u32 = 0;

    // Step 2/3: walk the new configuration.
    for group in &new_config.groups {
        let profile_idx = group.profile.as_ref().map(|p| {
            new_profiles.push(RuntimeProfile {
                name: p.name.clone(),
                enabled: p.enabled,
            });
            new_profiles.len() - 1
        });
        let profile_enabled = group.profile.as_ref().map(|p| p.enabled).unwrap_or(true);

        for decl_module in &group.modules {
            declared_seq += 1;
            apply_declared_module(
                table,
                decl_module,
                profile_idx,
                profile_enabled,
                declared_seq,
                &mut summary,
            );
        }
    }

    // Step 5: sweep modules that were not seen in the new config.
    for (_, m) in table.iter_mut() {
        if !m.seen {
            m.remove = true;
            m.enabled = false;
            summary.removed += 1;
        }
    }

    // Step 6: modules whose declared attributes changed while running are
    // stopped and marked for reinitialisation by the scheduler.
    for (_, m) in table.iter_mut() {
        if m.modified && m.status == crate::state::ModuleStatus::Up {
            m.enabled = false;
            m.init = true;
        }
    }

    // Step 7: publish the fresh profile list and log the summary.
    table.profiles = new_profiles;
    info!("{}", summary);
    summary
}

fn apply_declared_module(
    table: &mut RuntimeTable,
    decl: &crate::config::Module,
    profile_idx: Option<usize>,
    profile_enabled: bool,
    declared_seq: u32,
    summary: &mut ReconcileSummary,
) {
    let effective_enabled = profile_enabled && decl.enabled;

    match table.find_by_name(&decl.name) {
        None => {
            let mut fresh = RuntimeModule::new_from_declared(decl, profile_idx, declared_seq);
            fresh.enabled = effective_enabled;
            table.insert(fresh);
            summary.inserted += 1;
        }
        Some(idx) => {
            let m = table.get_mut(idx).expect("index came from find_by_name");
            let attrs_changed = m.path != decl.path
                || m.params != decl.params
                || interfaces_differ(&m.interfaces, &decl.interfaces);

            m.seen = true;
            m.profile = profile_idx;
            m.declared_seq = declared_seq;
            m.path = decl.path.clone();
            m.params = decl.params.clone();
            m.restart_cap = decl.restart_cap;

            if attrs_changed {
                m.modified = true;
                summary.modified += 1;
                rebuild_interfaces(m, &decl.interfaces);
            } else {
                summary.unchanged += 1;
            }

            let was_enabled = m.enabled;
            m.enabled = effective_enabled;
            if effective_enabled && !was_enabled {
                // Fresh window: treat the next tick as the first attempt.
                m.restart_counter = -1;
            }
        }
    }
}

fn interfaces_differ(live: &[crate::state::RuntimeInterface], decl: &[crate::config::Interface]) -> bool {
    if live.len() != decl.len() {
        return true;
    }
    live.iter().zip(decl.iter()).any(|(l, d)| {
        l.direction != d.direction
            || l.ty != d.ty
            || l.note != d.note
            || l.params != d.params.clone().unwrap_or_default()
    })
}

/// Tear down and rebuild a module's interface set atomically (invariant
/// I-2: a modified interface set discards all existing state, including
/// counters, rather than trying to carry any of it forward).
fn rebuild_interfaces(m: &mut RuntimeModule, decl: &[crate::config::Interface]) {
    m.interfaces = decl
        .iter()
        .map(crate::state::RuntimeInterface::from_declared)
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Direction, IfcType, Interface, Module, ModuleGroup, Profile, SupervisorSettings};

    fn cfg(groups: Vec<ModuleGroup>) -> ValidatedConfig {
        ValidatedConfig {
            supervisor: SupervisorSettings {
                module_restarts: 3,
                logs_directory: None,
            },
            groups,
        }
    }

    fn module(name: &str, params: Option<&str>, ifcs: Vec<Interface>) -> Module {
        Module {
            name: name.to_string(),
            path: "/usr/bin/mod".to_string(),
            enabled: true,
            restart_cap: None,
            params: params.map(|s| s.to_string()),
            interfaces: ifcs,
        }
    }

    fn in_tcp(params: &str) -> Interface {
        Interface {
            direction: Direction::In,
            ty: IfcType::Tcp,
            params: Some(params.to_string()),
            note: None,
        }
    }

    #[test]
    fn fresh_module_is_inserted() {
        let mut table = RuntimeTable::new();
        let config = cfg(vec![ModuleGroup {
            profile: None,
            modules: vec![module("a", None, vec![])],
        }]);
        let summary = reconcile(&mut table, &config);
        assert_eq!(summary.inserted, 1);
        assert_eq!(table.len(), 1);
        assert!(table.get(table.find_by_name("a").unwrap()).unwrap().enabled);
    }

    #[test]
    fn reloading_identical_config_is_idempotent() {
        let mut table = RuntimeTable::new();
        let config = cfg(vec![ModuleGroup {
            profile: Some(Profile {
                name: "p".to_string(),
                enabled: true,
            }),
            modules: vec![module("a", Some("x"), vec![in_tcp("p1")])],
        }]);
        reconcile(&mut table, &config);
        let summary = reconcile(&mut table, &config);
        assert_eq!(summary, ReconcileSummary { inserted: 0, removed: 0, modified: 0, unchanged: 1 });
    }

    #[test]
    fn changed_interface_params_marks_modified_and_rebuilds() {
        let mut table = RuntimeTable::new();
        let v1 = cfg(vec![ModuleGroup {
            profile: None,
            modules: vec![module("a", None, vec![in_tcp("p1")])],
        }]);
        reconcile(&mut table, &v1);
        let idx = table.find_by_name("a").unwrap();
        table.get_mut(idx).unwrap().status = crate::state::ModuleStatus::Up;

        let v2 = cfg(vec![ModuleGroup {
            profile: None,
            modules: vec![module("a", None, vec![in_tcp("p2")])],
        }]);
        let summary = reconcile(&mut table, &v2);
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.removed, 0);
        let m = table.get(idx).unwrap();
        assert!(m.init);
        assert!(!m.enabled);
        assert_eq!(m.interfaces[0].params, "p2");
    }

    #[test]
    fn missing_module_is_marked_for_removal() {
        let mut table = RuntimeTable::new();
        let v1 = cfg(vec![ModuleGroup {
            profile: None,
            modules: vec![module("a", None, vec![])],
        }]);
        reconcile(&mut table, &v1);

        let v2 = cfg(vec![]);
        let summary = reconcile(&mut table, &v2);
        assert_eq!(summary.removed, 1);
        let idx = table.find_by_name("a").unwrap();
        let m = table.get(idx).unwrap();
        assert!(m.remove);
        assert!(!m.enabled);
    }

    #[test]
    fn dropped_trapinterfaces_tears_down_existing_interfaces() {
        let mut table = RuntimeTable::new();
        let v1 = cfg(vec![ModuleGroup {
            profile: None,
            modules: vec![module("a", None, vec![in_tcp("p1")])],
        }]);
        reconcile(&mut table, &v1);

        let v2 = cfg(vec![ModuleGroup {
            profile: None,
            modules: vec![module("a", None, vec![])],
        }]);
        reconcile(&mut table, &v2);
        let idx = table.find_by_name("a").unwrap();
        assert!(table.get(idx).unwrap().interfaces.is_empty());
    }

    #[test]
    fn reenabling_a_module_resets_restart_counter() {
        let mut table = RuntimeTable::new();
        let v1 = cfg(vec![ModuleGroup {
            profile: None,
            modules: vec![module("a", None, vec![])],
        }]);
        reconcile(&mut table, &v1);
        let idx = table.find_by_name("a").unwrap();
        table.get_mut(idx).unwrap().restart_counter = 7;
        table.get_mut(idx).unwrap().enabled = false;

        let mut decl = module("a", None, vec![]);
        decl.enabled = true;
        let v2 = cfg(vec![ModuleGroup {
            profile: None,
            modules: vec![decl],
        }]);
        reconcile(&mut table, &v2);
        assert_eq!(table.get(idx).unwrap().restart_counter, -1);
    }
}
