//! Configuration model, include-preprocessing, and validation (C1 + C2).

pub mod include;
pub mod model;
pub mod validator;

pub use model::{
    Direction, IfcType, Interface, Module, ModuleGroup, Profile, SupervisorSettings,
    ValidatedConfig,
};
pub use validator::validate;

/// Default restart cap per scheduler window when neither the supervisor
/// nor the module overrides it (spec.md §4.1).
pub const DEFAULT_MODULE_RESTARTS: u32 = 3;

/// Load and validate a configuration template from disk, performing the
/// include-preprocessing step first.
pub fn load_template(path: &std::path::Path) -> Result<ValidatedConfig, crate::error::ConfigError> {
    let expanded = include::expand_includes(path).map_err(|e| {
        crate::error::ConfigError::new(path.display().to_string(), format!("I/O error: {e}"))
    })?;
    validator::validate(&expanded)
}
