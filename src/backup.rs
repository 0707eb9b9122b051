//! Backup store (C9): writes the live configuration, annotated with child
//! PIDs, to a deterministic path on shutdown; reads it back at startup to
//! re-adopt already-running children (spec.md §4.8).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Writer;
use tracing::warn;

use crate::config::{Direction, IfcType, Module, ModuleGroup, Profile, SupervisorSettings, ValidatedConfig};
use crate::error::BackupError;
use crate::state::RuntimeTable;

const BACKUP_ROOT: &str = "/tmp/sup_tmp_dir";
const BACKUP_SUFFIX: &str = "_sup_backup_file.xml";
const BACKUP_MODE: u32 = 0o666;

/// `Σ byte_i * (i+1)` over the absolute path's bytes (spec.md §4.8).
///
/// Kept exactly as the original computes it: this is a compatibility fact
/// (the checksum is part of the on-disk path format other tooling may
/// depend on), not a hash that needs to be cryptographically sound.
pub fn checksum(abs_path: &Path) -> u64 {
    abs_path
        .to_string_lossy()
        .bytes()
        .enumerate()
        .map(|(i, b)| b as u64 * (i as u64 + 1))
        .sum()
}

pub fn backup_path(abs_config_path: &Path) -> PathBuf {
    PathBuf::from(BACKUP_ROOT).join(format!("{}{}", checksum(abs_config_path), BACKUP_SUFFIX))
}

fn info_path(backup: &Path) -> PathBuf {
    PathBuf::from(format!("{}_info", backup.display()))
}

/// A module entry read back from a backup file, carrying the PID it should
/// be re-adopted under (spec.md §4.8 "Re-adoption").
#[derive(Debug, Clone)]
pub struct AdoptedModule {
    pub name: String,
    pub pid: u32,
}

fn write_interface(writer: &mut Writer<Vec<u8>>, ifc: &crate::config::Interface) -> Result<(), BackupError> {
    let mut start = BytesStart::new("interface");
    start.push_attribute((
        "direction",
        match ifc.direction {
            Direction::In => "IN",
            Direction::Out => "OUT",
            Direction::Service => "SERVICE",
        },
    ));
    start.push_attribute((
        "type",
        match ifc.ty {
            IfcType::Tcp => "TCP",
            IfcType::UnixSocket => "UNIXSOCKET",
            IfcType::File => "FILE",
            IfcType::Blackhole => "BLACKHOLE",
        },
    ));
    if let Some(params) = &ifc.params {
        start.push_attribute(("params", params.as_str()));
    }
    if let Some(note) = &ifc.note {
        start.push_attribute(("note", note.as_str()));
    }
    writer
        .write_event(Event::Empty(start))
        .map_err(|e| BackupError::Serialize(e.to_string()))?;
    Ok(())
}

fn write_module(
    writer: &mut Writer<Vec<u8>>,
    module: &Module,
    pid: Option<u32>,
) -> Result<(), BackupError> {
    let mut start = BytesStart::new("module");
    start.push_attribute(("name", module.name.as_str()));
    start.push_attribute(("path", module.path.as_str()));
    start.push_attribute(("enabled", if module.enabled { "true" } else { "false" }));
    if let Some(cap) = module.restart_cap {
        start.push_attribute(("module-restarts", cap.to_string().as_str()));
    }
    if let Some(params) = &module.params {
        start.push_attribute(("params", params.as_str()));
    }
    if let Some(pid) = pid {
        start.push_attribute(("module_pid", pid.to_string().as_str()));
    }
    writer
        .write_event(Event::Start(start))
        .map_err(|e| BackupError::Serialize(e.to_string()))?;

    if !module.interfaces.is_empty() {
        writer
            .write_event(Event::Start(BytesStart::new("trapinterfaces")))
            .map_err(|e| BackupError::Serialize(e.to_string()))?;
        for ifc in &module.interfaces {
            write_interface(writer, ifc)?;
        }
        writer
            .write_event(Event::End(quick_xml::events::BytesEnd::new("trapinterfaces")))
            .map_err(|e| BackupError::Serialize(e.to_string()))?;
    }

    writer
        .write_event(Event::End(quick_xml::events::BytesEnd::new("module")))
        .map_err(|e| BackupError::Serialize(e.to_string()))?;
    Ok(())
}

fn write_group(writer: &mut Writer<Vec<u8>>, group: &ModuleGroup, table: &RuntimeTable) -> Result<(), BackupError> {
    let mut start = BytesStart::new("modules");
    if let Some(profile) = &group.profile {
        start.push_attribute(("name", profile.name.as_str()));
        start.push_attribute(("enabled", if profile.enabled { "true" } else { "false" }));
    }
    writer
        .write_event(Event::Start(start))
        .map_err(|e| BackupError::Serialize(e.to_string()))?;

    for module in &group.modules {
        let pid = table
            .iter()
            .find(|(_, m)| m.name == module.name && m.pid > 0)
            .map(|(_, m)| m.pid);
        write_module(writer, module, pid)?;
    }

    writer
        .write_event(Event::End(quick_xml::events::BytesEnd::new("modules")))
        .map_err(|e| BackupError::Serialize(e.to_string()))?;
    Ok(())
}

/// Serialize the currently loaded configuration, annotated with each
/// module's live PID, as canonical XML.
pub fn serialize(config: &ValidatedConfig, table: &RuntimeTable) -> Result<String, BackupError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 3);

    writer
        .write_event(Event::Start(BytesStart::new("configuration")))
        .map_err(|e| BackupError::Serialize(e.to_string()))?;

    let mut supervisor = BytesStart::new("supervisor");
    supervisor.push_attribute((
        "module-restarts",
        config.supervisor.module_restarts.to_string().as_str(),
    ));
    writer
        .write_event(Event::Empty(supervisor))
        .map_err(|e| BackupError::Serialize(e.to_string()))?;

    for group in &config.groups {
        write_group(&mut writer, group, table)?;
    }

    writer
        .write_event(Event::End(quick_xml::events::BytesEnd::new("configuration")))
        .map_err(|e| BackupError::Serialize(e.to_string()))?;

    String::from_utf8(writer.into_inner()).map_err(|e| BackupError::Serialize(e.to_string()))
}

const GENERATED_CONFIG_NAME: &str = "gener_config_file.xml";

/// Write the canonical, include-expanded configuration (no PID annotations)
/// to `<configs_path>/gener_config_file.xml` (spec.md §6 "Persisted state").
/// Reuses the same XML writer as the backup file, against an empty table so
/// no `module_pid` attributes are emitted.
pub fn write_generated_config(configs_path: &Path, config: &ValidatedConfig) -> Result<PathBuf, BackupError> {
    std::fs::create_dir_all(configs_path).map_err(|source| BackupError::Io {
        path: configs_path.to_path_buf(),
        source,
    })?;
    let path = configs_path.join(GENERATED_CONFIG_NAME);
    let xml = serialize(config, &RuntimeTable::new())?;
    std::fs::write(&path, xml).map_err(|source| BackupError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Write the backup XML and its `_info` sidecar (spec.md §4.8). Failures
/// here are always non-fatal to the caller: a backup write never blocks
/// shutdown (spec.md §7).
pub fn write_backup(
    abs_config_path: &Path,
    config: &ValidatedConfig,
    table: &RuntimeTable,
    started_at: DateTime<Utc>,
) -> Result<PathBuf, BackupError> {
    let path = backup_path(abs_config_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| BackupError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let xml = serialize(config, table)?;
    std::fs::write(&path, xml).map_err(|source| BackupError::Io {
        path: path.clone(),
        source,
    })?;
    let _ = set_mode(&path, BACKUP_MODE);

    let running_count = table.iter().filter(|(_, m)| m.status == crate::state::ModuleStatus::Up).count();
    let loaded_count = table.len();
    let now = Utc::now();
    let info = format!(
        "start_time={started_at}\ncurrent_time={now}\nloaded_count={loaded_count}\nrunning_count={running_count}\n\
         Run supervisor with this configuration file to load generated backup file. It will connect to running modules.\n"
    );
    let info_file = info_path(&path);
    std::fs::write(&info_file, info).map_err(|source| BackupError::Io {
        path: info_file,
        source,
    })?;

    Ok(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// If a backup file exists for this configuration path, parse it and
/// return the reconstructed configuration plus the PIDs to re-adopt.
/// On successful parse the backup file is deleted (spec.md §4.8).
pub fn load_backup_if_present(
    abs_config_path: &Path,
) -> Result<Option<(ValidatedConfig, Vec<AdoptedModule>)>, BackupError> {
    let path = backup_path(abs_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let xml = std::fs::read_to_string(&path).map_err(|source| BackupError::Io {
        path: path.clone(),
        source,
    })?;
    let (config, adopted) = parse_backup(&xml)?;

    if let Err(e) = std::fs::remove_file(&path) {
        warn!("could not remove backup file {}: {e}", path.display());
    }
    let _ = std::fs::remove_file(info_path(&path));

    Ok(Some((config, adopted)))
}

fn parse_backup(xml: &str) -> Result<(ValidatedConfig, Vec<AdoptedModule>), BackupError> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| BackupError::Parse(e.to_string()))?;
    let root = doc.root_element();

    let supervisor_elem = root.children().find(|n| n.is_element() && n.tag_name().name() == "supervisor");
    let module_restarts = supervisor_elem
        .and_then(|n| n.attribute("module-restarts"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(crate::config::DEFAULT_MODULE_RESTARTS);

    let mut groups = Vec::new();
    let mut adopted = Vec::new();

    for modules_elem in root.children().filter(|n| n.is_element() && n.tag_name().name() == "modules") {
        let profile = match (modules_elem.attribute("name"), modules_elem.attribute("enabled")) {
            (Some(name), Some(enabled)) => Some(Profile {
                name: name.to_string(),
                enabled: enabled.trim() == "true",
            }),
            _ => None,
        };

        let mut modules = Vec::new();
        for module_elem in modules_elem.children().filter(|n| n.is_element() && n.tag_name().name() == "module") {
            let name = module_elem
                .attribute("name")
                .ok_or_else(|| BackupError::Parse("module missing name".to_string()))?
                .to_string();
            let path = module_elem
                .attribute("path")
                .ok_or_else(|| BackupError::Parse("module missing path".to_string()))?
                .to_string();
            let enabled = module_elem
                .attribute("enabled")
                .map(|v| v.trim() == "true")
                .unwrap_or(false);
            let restart_cap = module_elem.attribute("module-restarts").and_then(|v| v.parse().ok());
            let params = module_elem.attribute("params").map(|s| s.to_string());

            if let Some(pid) = module_elem.attribute("module_pid").and_then(|v| v.parse::<u32>().ok()) {
                adopted.push(AdoptedModule { name: name.clone(), pid });
            }

            let mut interfaces = Vec::new();
            if let Some(ifcs_elem) = module_elem
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "trapinterfaces")
            {
                for ifc_elem in ifcs_elem.children().filter(|n| n.is_element() && n.tag_name().name() == "interface") {
                    let direction = match ifc_elem.attribute("direction") {
                        Some("IN") => Direction::In,
                        Some("OUT") => Direction::Out,
                        _ => return Err(BackupError::Parse("invalid interface direction".to_string())),
                    };
                    let ty = match ifc_elem.attribute("type") {
                        Some("TCP") => IfcType::Tcp,
                        Some("UNIXSOCKET") => IfcType::UnixSocket,
                        Some("FILE") => IfcType::File,
                        Some("BLACKHOLE") => IfcType::Blackhole,
                        _ => return Err(BackupError::Parse("invalid interface type".to_string())),
                    };
                    interfaces.push(crate::config::Interface {
                        direction,
                        ty,
                        params: ifc_elem.attribute("params").map(|s| s.to_string()),
                        note: ifc_elem.attribute("note").map(|s| s.to_string()),
                    });
                }
            }

            modules.push(Module {
                name,
                path,
                enabled,
                restart_cap,
                params,
                interfaces,
            });
        }

        groups.push(ModuleGroup { profile, modules });
    }

    let config = ValidatedConfig {
        supervisor: SupervisorSettings {
            module_restarts,
            logs_directory: None,
        },
        groups,
    };

    Ok((config, adopted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_weighted_byte_sum() {
        let sum = checksum(Path::new("ab"));
        assert_eq!(sum, 'a' as u64 * 1 + 'b' as u64 * 2);
    }

    #[test]
    fn write_generated_config_has_no_pid_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let config = ValidatedConfig {
            supervisor: SupervisorSettings {
                module_restarts: 3,
                logs_directory: None,
            },
            groups: vec![ModuleGroup {
                profile: None,
                modules: vec![Module {
                    name: "m".to_string(),
                    path: "/bin/true".to_string(),
                    enabled: true,
                    restart_cap: None,
                    params: None,
                    interfaces: vec![],
                }],
            }],
        };
        let path = write_generated_config(dir.path(), &config).unwrap();
        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(path.ends_with("gener_config_file.xml"));
        assert!(!xml.contains("module_pid"));
        assert!(xml.contains("name=\"m\""));
    }

    #[test]
    fn serialize_then_parse_round_trips_module_pid() {
        let config = ValidatedConfig {
            supervisor: SupervisorSettings {
                module_restarts: 3,
                logs_directory: None,
            },
            groups: vec![ModuleGroup {
                profile: None,
                modules: vec![Module {
                    name: "m".to_string(),
                    path: "/bin/true".to_string(),
                    enabled: true,
                    restart_cap: None,
                    params: None,
                    interfaces: vec![],
                }],
            }],
        };
        let mut table = RuntimeTable::new();
        let idx = table.insert(crate::state::RuntimeModule::new_from_declared(
            &config.groups[0].modules[0],
            None,
            0,
        ));
        table.get_mut(idx).unwrap().pid = 4242;

        let xml = serialize(&config, &table).unwrap();
        let (parsed, adopted) = parse_backup(&xml).unwrap();
        assert_eq!(parsed.groups[0].modules[0].name, "m");
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].pid, 4242);
    }
}
