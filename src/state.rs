//! Runtime state: the live module table the reconciler, scheduler, and
//! control-plane server all operate on.
//!
//! The profile/module back-pointer shape described in spec.md §3 is a
//! cyclic graph in the original; per the design note in spec.md §9 this is
//! flattened into an arena (`Vec<Option<RuntimeModule>>`, reused slots) plus
//! a plain `Vec<Profile>` that is discarded and rebuilt whole on every
//! reconciliation pass — profiles carry no runtime state worth preserving
//! across a reload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{Direction, IfcType};

/// Liveness as last refreshed by the scheduler's probe step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleStatus {
    Down,
    Up,
}

/// State of this process's client connection to the module's service
/// socket (spec.md §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceConn {
    Disconnected,
    Connected,
    /// Terminal for this boot of the module; cleared only when the module
    /// restarts under a new PID.
    Blocked,
}

/// Scraped per-interface counters (spec.md §3, §4.5).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputStats {
    pub recv_msg: u64,
    pub recv_buffer: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputStats {
    pub sent_msg: u64,
    pub sent_buffer: u64,
    pub dropped_msg: u64,
    pub autoflush: u64,
}

/// Runtime view of a declared interface: its static shape plus whichever
/// side's counters apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInterface {
    pub direction: Direction,
    pub ty: IfcType,
    pub params: String,
    pub note: Option<String>,
    pub input_stats: Option<InputStats>,
    pub output_stats: Option<OutputStats>,
}

impl RuntimeInterface {
    pub fn from_declared(ifc: &crate::config::Interface) -> Self {
        let (input_stats, output_stats) = match ifc.direction {
            Direction::In => (Some(InputStats::default()), None),
            Direction::Out => (None, Some(OutputStats::default())),
            Direction::Service => (None, None),
        };
        Self {
            direction: ifc.direction,
            ty: ifc.ty,
            params: ifc.params.clone().unwrap_or_default(),
            note: ifc.note.clone(),
            input_stats,
            output_stats,
        }
    }
}

/// A live profile row. Recreated wholesale on every reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeProfile {
    pub name: String,
    pub enabled: bool,
}

/// The live runtime row for one module (spec.md §3 "Runtime state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeModule {
    pub name: String,
    pub path: String,
    pub params: Option<String>,
    pub restart_cap: Option<u32>,
    pub profile: Option<usize>,
    pub interfaces: Vec<RuntimeInterface>,

    /// Effective enabled gate the scheduler acts on
    /// (`profile.enabled AND module.enabled`, recomputed each reconcile).
    pub enabled: bool,

    pub pid: u32,
    pub is_my_child: bool,
    pub status: ModuleStatus,
    pub service_conn: ServiceConn,

    pub restart_counter: i64,
    pub restart_window_start: u64,

    pub sigint_sent: bool,

    pub service_attempts: u32,
    pub service_failures: u32,
    pub service_fail_window_start: u64,

    pub last_cpu_user: f64,
    pub last_cpu_kernel: f64,
    pub last_pct_cpu_user: f64,
    pub last_pct_cpu_kernel: f64,
    pub vmsize_kib: u64,
    /// Whether `last_cpu_user`/`last_cpu_kernel` hold a real baseline yet.
    /// The first `/proc` sample after a (re)start only establishes the
    /// baseline rather than computing a delta against a fresh process's
    /// unrelated predecessor (or, for an adopted module, against zero).
    pub cpu_baseline_set: bool,

    /// Transient reconciliation flags, meaningful only during a reload
    /// pass (spec.md §3).
    pub seen: bool,
    pub modified: bool,
    pub inserted: bool,
    pub remove: bool,
    /// Set by the reconciler on a `modified` row that was `up`; cleared by
    /// the scheduler once it has re-enabled the module under its new
    /// definition (spec.md §4.2 step 6, §4.6 step 3).
    pub init: bool,

    /// Position in the declared configuration, used only to render modules
    /// in declaration order (spec.md §8 P2); never read for behavior.
    pub declared_seq: u32,
}

impl RuntimeModule {
    pub fn new_from_declared(
        decl: &crate::config::Module,
        profile: Option<usize>,
        declared_seq: u32,
    ) -> Self {
        Self {
            name: decl.name.clone(),
            path: decl.path.clone(),
            params: decl.params.clone(),
            restart_cap: decl.restart_cap,
            profile,
            interfaces: decl.interfaces.iter().map(RuntimeInterface::from_declared).collect(),
            enabled: false,
            pid: 0,
            is_my_child: false,
            status: ModuleStatus::Down,
            service_conn: ServiceConn::Disconnected,
            restart_counter: -1,
            restart_window_start: 0,
            sigint_sent: false,
            service_attempts: 0,
            service_failures: 0,
            service_fail_window_start: 0,
            last_cpu_user: 0.0,
            last_cpu_kernel: 0.0,
            last_pct_cpu_user: 0.0,
            last_pct_cpu_kernel: 0.0,
            vmsize_kib: 0,
            cpu_baseline_set: false,
            seen: true,
            modified: false,
            inserted: true,
            remove: false,
            init: false,
            declared_seq,
        }
    }

    /// Effective restart cap: per-module override, else the supervisor
    /// default in effect at the time of the call (spec.md §9 open
    /// question: re-read on every tick, so a mid-window change to the
    /// configured default takes effect immediately).
    pub fn effective_restart_cap(&self, supervisor_default: u32) -> u32 {
        self.restart_cap.unwrap_or(supervisor_default)
    }

    pub fn in_interfaces(&self) -> impl Iterator<Item = &RuntimeInterface> {
        self.interfaces.iter().filter(|i| i.direction == Direction::In)
    }

    pub fn out_interfaces(&self) -> impl Iterator<Item = &RuntimeInterface> {
        self.interfaces.iter().filter(|i| i.direction == Direction::Out)
    }
}

/// The live runtime table, guarded by the single configuration mutex
/// (spec.md §5). An arena of module slots plus a name index for O(1)
/// lookup during reconciliation.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RuntimeTable {
    slots: Vec<Option<RuntimeModule>>,
    name_index: HashMap<String, usize>,
    pub profiles: Vec<RuntimeProfile>,
}

impl RuntimeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    pub fn get(&self, idx: usize) -> Option<&RuntimeModule> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut RuntimeModule> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }

    /// Allocate a new row at the first free slot (spec.md §4.2 step 3).
    pub fn insert(&mut self, module: RuntimeModule) -> usize {
        let name = module.name.clone();
        let idx = match self.slots.iter().position(|s| s.is_none()) {
            Some(idx) => {
                self.slots[idx] = Some(module);
                idx
            }
            None => {
                self.slots.push(Some(module));
                self.slots.len() - 1
            }
        };
        self.name_index.insert(name, idx);
        idx
    }

    /// Free a slot, making it eligible for reuse (spec.md §4.6 step 3:
    /// "free and compact the table").
    pub fn free(&mut self, idx: usize) {
        if let Some(m) = self.slots.get_mut(idx).and_then(|s| s.take()) {
            self.name_index.remove(&m.name);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &RuntimeModule)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|m| (i, m)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut RuntimeModule)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|m| (i, m)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Modules in declaration order (spec.md §8 P2), used by listing
    /// endpoints and operator selection-index numbering.
    pub fn in_declared_order(&self) -> Vec<usize> {
        let mut idxs: Vec<usize> = self.iter().map(|(i, _)| i).collect();
        idxs.sort_by_key(|&i| self.get(i).map(|m| m.declared_seq).unwrap_or(u32::MAX));
        idxs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Module as DeclModule;

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
    fn insert_reuses_freed_slots() {
        let mut table = RuntimeTable::new();
        let a = table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        let _b = table.insert(RuntimeModule::new_from_declared(&decl("b"), None, 1));
        table.free(a);
        let c = table.insert(RuntimeModule::new_from_declared(&decl("c"), None, 2));
        assert_eq!(c, a, "freed slot should be reused before growing the arena");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn name_index_tracks_insert_and_free() {
        let mut table = RuntimeTable::new();
        let a = table.insert(RuntimeModule::new_from_declared(&decl("a"), None, 0));
        assert_eq!(table.find_by_name("a"), Some(a));
        table.free(a);
        assert_eq!(table.find_by_name("a"), None);
    }
}
