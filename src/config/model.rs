//! In-memory representation of a validated configuration (C1).
//!
//! Types here are produced exclusively by [`super::validator::validate`] —
//! nothing downstream should need to re-check shape invariants the
//! validator already enforces (spec.md §4.1: "validation is total").

use serde::{Deserialize, Serialize};

/// Interface direction as declared in configuration.
///
/// `Service` is never produced by the validator (the grammar only accepts
/// `IN`/`OUT`, spec.md §4.1); it exists so the scheduler and service
/// channel can label the implicit per-module service endpoint using the
/// same enum as the declared interfaces (spec.md §3: interface attributes
/// include `direction ∈ {IN, OUT, SERVICE}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    Service,
}

/// Interface wire type, and the `typechar` used when building the `-i`
/// specifier (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IfcType {
    Tcp,
    UnixSocket,
    File,
    Blackhole,
}

impl IfcType {
    pub fn typechar(self) -> char {
        match self {
            IfcType::Tcp => 't',
            IfcType::UnixSocket => 'u',
            IfcType::File => 'f',
            IfcType::Blackhole => 'b',
        }
    }
}

/// A single declared interface on a module.
///
/// `stats` is deliberately absent here: this type is the *declared* shape
/// (what configuration says should exist); counters live in the runtime
/// table (`crate::state::InterfaceStats`) because they are scraped, not
/// configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub direction: Direction,
    pub ty: IfcType,
    pub params: Option<String>,
    pub note: Option<String>,
}

/// A declared module (spec.md §3 "Module").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub path: String,
    pub enabled: bool,
    /// Per-module restart cap override; `None` means "use the supervisor
    /// default" (spec.md §4.1).
    pub restart_cap: Option<u32>,
    pub params: Option<String>,
    /// Declared order, IN entries first then OUT (invariant I-2). The
    /// validator is responsible for this ordering, not callers.
    pub interfaces: Vec<Interface>,
}

/// A `modules` container that successfully parsed as a profile header
/// (has exactly one valid `name` and one valid `enabled`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub enabled: bool,
}

/// One `modules` container from the configuration tree: either a profile
/// (with its own enable gate) grouping some modules, or an unscoped group
/// whose modules have no profile (spec.md §4.2 step 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleGroup {
    pub profile: Option<Profile>,
    pub modules: Vec<Module>,
}

/// Supervisor-wide settings (spec.md §4.1 `supervisor` element).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    pub module_restarts: u32,
    pub logs_directory: Option<String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            module_restarts: super::DEFAULT_MODULE_RESTARTS,
            logs_directory: None,
        }
    }
}

/// A fully validated configuration tree, ready for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedConfig {
    pub supervisor: SupervisorSettings,
    pub groups: Vec<ModuleGroup>,
}

impl ValidatedConfig {
    /// Iterate every declared module together with the effective enabled
    /// state contributed by its group (`profile.enabled AND module.enabled`,
    /// or just `module.enabled` when unscoped).
    pub fn iter_modules(&self) -> impl Iterator<Item = (&Module, bool, Option<&str>)> {
        self.groups.iter().flat_map(|g| {
            let profile_enabled = g.profile.as_ref().map(|p| p.enabled).unwrap_or(true);
            let profile_name = g.profile.as_ref().map(|p| p.name.as_str());
            g.modules
                .iter()
                .map(move |m| (m, profile_enabled && m.enabled, profile_name))
        })
    }
}
