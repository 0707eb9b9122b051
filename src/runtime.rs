//! The single piece of shared state guarded by the configuration mutex
//! (spec.md §5): the live module table plus the configuration it was
//! reconciled from. The scheduler holds this lock for an entire tick;
//! operator handlers acquire it only for the duration of a mutation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::ValidatedConfig;
use crate::error::ConfigError;
use crate::reconcile::{self, ReconcileSummary};
use crate::state::RuntimeTable;

pub struct Shared {
    pub table: RuntimeTable,
    pub config: ValidatedConfig,
    pub config_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

pub type SharedRuntime = Arc<Mutex<Shared>>;

impl Shared {
    pub fn new(config: ValidatedConfig, config_path: PathBuf, started_at: DateTime<Utc>) -> Self {
        Self {
            table: RuntimeTable::new(),
            config,
            config_path,
            started_at,
        }
    }
}

/// Re-read the configuration template from disk and reconcile the live
/// table against it (spec.md §4.7 mode `2`, and config-mode menu item `7`).
/// A parse/validation failure leaves the previous state entirely intact
/// (spec.md §7: "a failed reload leaves the previous state intact").
pub async fn reload(shared: &SharedRuntime) -> Result<ReconcileSummary, ConfigError> {
    let template_path = {
        let guard = shared.lock().await;
        guard.config_path.clone()
    };
    let new_config = crate::config::load_template(&template_path)?;

    let mut guard = shared.lock().await;
    let summary = reconcile::reconcile(&mut guard.table, &new_config);
    guard.config = new_config;
    Ok(summary)
}
