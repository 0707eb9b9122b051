//! Structural and semantic validation of a parsed configuration tree (C2).
//!
//! Validation is total: nothing here has a side effect, and a single pass
//! builds the two uniqueness sets (module names, profile names) spec.md
//! §4.1 calls for. The tree is read with `roxmltree`, which hands us a
//! generic borrowed DOM — exactly the "generic tree" framing the grammar
//! in spec.md §4.1 uses, so the same "allowed children of this container"
//! helper is reused for every container kind instead of one hand-written
//! check per element.

use std::collections::HashSet;

use roxmltree::{Document, Node};

use crate::error::ConfigError;

use super::model::{
    Direction, IfcType, Interface, Module, ModuleGroup, Profile, SupervisorSettings,
    ValidatedConfig,
};

const ROOT_TAG: &str = "configuration";
const SUPERVISOR_TAG: &str = "supervisor";
const MODULES_TAG: &str = "modules";
const MODULE_TAG: &str = "module";
const TRAPINTERFACES_TAG: &str = "trapinterfaces";
const INTERFACE_TAG: &str = "interface";

/// Parse `xml` (the canonical document, already include-expanded) and
/// return a fully validated configuration, or the first `ConfigError`
/// encountered.
pub fn validate(xml: &str) -> Result<ValidatedConfig, ConfigError> {
    let doc = Document::parse(xml)
        .map_err(|e| ConfigError::new("/", format!("XML parse error: {e}")))?;
    let root = doc.root_element();
    if root.tag_name().name() != ROOT_TAG {
        return Err(ConfigError::new(
            "/",
            format!("unexpected root element <{}>", root.tag_name().name()),
        ));
    }

    let children = child_elements(root);

    let supervisor = match require_at_most_one(&children, SUPERVISOR_TAG, "/")? {
        Some(node) => parse_supervisor(node)?,
        None => SupervisorSettings::default(),
    };

    let mut module_names: HashSet<String> = HashSet::new();
    let mut profile_names: HashSet<String> = HashSet::new();
    let mut groups = Vec::new();

    for (idx, modules_node) in children
        .iter()
        .filter(|n| n.tag_name().name() == MODULES_TAG)
        .enumerate()
    {
        let path = format!("/modules[{}]", idx + 1);
        let group = parse_modules_group(*modules_node, &path, &mut module_names, &mut profile_names)?;
        groups.push(group);
    }

    // Reject unknown top-level children outright (only <supervisor> and
    // <modules> — plus text/comment nodes, already filtered — are allowed).
    for node in &children {
        let name = node.tag_name().name();
        if name != SUPERVISOR_TAG && name != MODULES_TAG {
            return Err(ConfigError::new("/", format!("unknown element <{name}>")));
        }
    }

    Ok(ValidatedConfig { supervisor, groups })
}

fn parse_supervisor(node: Node) -> Result<SupervisorSettings, ConfigError> {
    let path = "/supervisor";
    let children = child_elements(node);
    allow_only(&children, &["module-restarts", "logs-directory"], path)?;

    let module_restarts = match require_at_most_one(&children, "module-restarts", path)? {
        Some(n) => parse_uint(&text_of(n), &format!("{path}/module-restarts"))?,
        None => super::DEFAULT_MODULE_RESTARTS,
    };
    let logs_directory = match require_at_most_one(&children, "logs-directory", path)? {
        Some(n) => Some(non_empty_text(n, &format!("{path}/logs-directory"))?),
        None => None,
    };

    Ok(SupervisorSettings {
        module_restarts,
        logs_directory,
    })
}

fn parse_modules_group(
    node: Node,
    path: &str,
    module_names: &mut HashSet<String>,
    profile_names: &mut HashSet<String>,
) -> Result<ModuleGroup, ConfigError> {
    let children = child_elements(node);
    allow_only(&children, &["name", "enabled", MODULE_TAG], path)?;

    let name_node = require_at_most_one(&children, "name", path)?;
    let enabled_node = require_at_most_one(&children, "enabled", path)?;

    // Only a container with exactly one valid `name` and one valid
    // `enabled` becomes a profile (spec.md §4.2 step 2); otherwise its
    // modules contribute with no profile attachment.
    let profile = match (name_node, enabled_node) {
        (Some(n), Some(e)) => {
            let name = non_empty_text(n, &format!("{path}/name"))?;
            if !profile_names.insert(name.clone()) {
                return Err(ConfigError::new(
                    format!("{path}/name"),
                    "duplicate profile name",
                ));
            }
            let enabled = parse_bool(&text_of(e), &format!("{path}/enabled"))?;
            Some(Profile { name, enabled })
        }
        _ => None,
    };

    let mut modules = Vec::new();
    for (idx, module_node) in children
        .iter()
        .filter(|n| n.tag_name().name() == MODULE_TAG)
        .enumerate()
    {
        let module_path = format!("{path}/module[{}]", idx + 1);
        let module = parse_module(*module_node, &module_path, module_names)?;
        modules.push(module);
    }

    Ok(ModuleGroup { profile, modules })
}

fn parse_module(
    node: Node,
    path: &str,
    module_names: &mut HashSet<String>,
) -> Result<Module, ConfigError> {
    let children = child_elements(node);
    allow_only(
        &children,
        &[
            "name",
            "path",
            "enabled",
            "module-restarts",
            "params",
            TRAPINTERFACES_TAG,
        ],
        path,
    )?;

    let name = non_empty_text(
        require_exactly_one(&children, "name", path)?,
        &format!("{path}/name"),
    )?;
    if !module_names.insert(name.clone()) {
        return Err(ConfigError::new(format!("{path}/name"), "duplicate"));
    }

    let module_path = non_empty_text(
        require_exactly_one(&children, "path", path)?,
        &format!("{path}/path"),
    )?;

    let enabled_node = require_exactly_one(&children, "enabled", path)?;
    let enabled = parse_bool(&text_of(enabled_node), &format!("{path}/enabled"))?;

    let restart_cap = match require_at_most_one(&children, "module-restarts", path)? {
        Some(n) => Some(parse_uint(&text_of(n), &format!("{path}/module-restarts"))?),
        None => None,
    };

    let params = match require_at_most_one(&children, "params", path)? {
        Some(n) => Some(non_empty_text(n, &format!("{path}/params"))?),
        None => None,
    };

    let interfaces = match require_at_most_one(&children, TRAPINTERFACES_TAG, path)? {
        Some(n) => parse_trapinterfaces(n, &format!("{path}/trapinterfaces"))?,
        None => Vec::new(),
    };

    Ok(Module {
        name,
        path: module_path,
        enabled,
        restart_cap,
        params,
        interfaces,
    })
}

fn parse_trapinterfaces(node: Node, path: &str) -> Result<Vec<Interface>, ConfigError> {
    let children = child_elements(node);
    allow_only(&children, &[INTERFACE_TAG], path)?;

    let mut ins = Vec::new();
    let mut outs = Vec::new();
    for (idx, ifc_node) in children
        .iter()
        .filter(|n| n.tag_name().name() == INTERFACE_TAG)
        .enumerate()
    {
        let ifc_path = format!("{path}/interface[{}]", idx + 1);
        let ifc = parse_interface(*ifc_node, &ifc_path)?;
        match ifc.direction {
            Direction::In => ins.push(ifc),
            Direction::Out => outs.push(ifc),
            Direction::Service => unreachable!("validator never produces Direction::Service"),
        }
    }

    // Invariant I-2: all IN interfaces precede all OUT interfaces, in
    // declared order within each direction.
    ins.extend(outs);
    Ok(ins)
}

fn parse_interface(node: Node, path: &str) -> Result<Interface, ConfigError> {
    let children = child_elements(node);
    allow_only(&children, &["note", "type", "direction", "params"], path)?;

    let note = match require_at_most_one(&children, "note", path)? {
        Some(n) => Some(non_empty_text(n, &format!("{path}/note"))?),
        None => None,
    };

    let ty_node = require_exactly_one(&children, "type", path)?;
    let ty = match text_of(ty_node).as_str() {
        "TCP" => IfcType::Tcp,
        "UNIXSOCKET" => IfcType::UnixSocket,
        "FILE" => IfcType::File,
        "BLACKHOLE" => IfcType::Blackhole,
        other => {
            return Err(ConfigError::new(
                format!("{path}/type"),
                format!("unrecognized interface type '{other}'"),
            ))
        }
    };

    let dir_node = require_exactly_one(&children, "direction", path)?;
    let direction = match text_of(dir_node).as_str() {
        "IN" => Direction::In,
        "OUT" => Direction::Out,
        other => {
            return Err(ConfigError::new(
                format!("{path}/direction"),
                format!("unrecognized interface direction '{other}'"),
            ))
        }
    };

    let params = match require_at_most_one(&children, "params", path)? {
        Some(n) => Some(non_empty_text(n, &format!("{path}/params"))?),
        None => None,
    };

    Ok(Interface {
        direction,
        ty,
        params,
        note,
    })
}

// --- generic tree helpers -------------------------------------------------

fn child_elements<'a, 'input>(node: Node<'a, 'input>) -> Vec<Node<'a, 'input>> {
    // Text and comment nodes are ignored per spec.md §4.1; only elements
    // are structurally meaningful.
    node.children().filter(|n| n.is_element()).collect()
}

fn allow_only(children: &[Node], allowed: &[&str], path: &str) -> Result<(), ConfigError> {
    for child in children {
        let name = child.tag_name().name();
        if !allowed.contains(&name) {
            return Err(ConfigError::new(path, format!("unknown element <{name}>")));
        }
    }
    Ok(())
}

fn require_at_most_one<'a, 'input>(
    children: &[Node<'a, 'input>],
    name: &str,
    path: &str,
) -> Result<Option<Node<'a, 'input>>, ConfigError> {
    let mut matches = children.iter().filter(|n| n.tag_name().name() == name);
    let first = matches.next().copied();
    if matches.next().is_some() {
        return Err(ConfigError::new(
            format!("{path}/{name}"),
            "duplicate element",
        ));
    }
    Ok(first)
}

fn require_exactly_one<'a, 'input>(
    children: &[Node<'a, 'input>],
    name: &str,
    path: &str,
) -> Result<Node<'a, 'input>, ConfigError> {
    require_at_most_one(children, name, path)?
        .ok_or_else(|| ConfigError::new(format!("{path}/{name}"), "missing required element"))
}

/// Concatenated, trimmed text content of `node` (spec.md §4.1: "whitespace
/// is trimmed").
fn text_of(node: Node) -> String {
    let mut s = String::new();
    for text_node in node.children().filter(|n| n.is_text()) {
        if let Some(t) = text_node.text() {
            s.push_str(t);
        }
    }
    s.trim().to_string()
}

/// Like [`text_of`], but an empty result is an error distinct from a
/// missing element (spec.md §4.1: "empty required elements fail
/// validation (distinct error from missing)").
fn non_empty_text(node: Node, path: &str) -> Result<String, ConfigError> {
    let text = text_of(node);
    if text.is_empty() {
        Err(ConfigError::new(path, "element is present but empty"))
    } else {
        Ok(text)
    }
}

fn parse_bool(raw: &str, path: &str) -> Result<bool, ConfigError> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigError::new(
            path,
            format!("expected 'true' or 'false', got '{other}'"),
        )),
    }
}

fn parse_uint(raw: &str, path: &str) -> Result<u32, ConfigError> {
    raw.parse::<u32>()
        .map_err(|_| ConfigError::new(path, format!("expected a non-negative integer, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_module(name: &str) -> String {
        format!(
            r#"<module>
                <name>{name}</name>
                <path>/usr/bin/{name}</path>
                <enabled>true</enabled>
            </module>"#
        )
    }

    #[test]
    fn minimal_config_defaults_restart_cap() {
        let xml = format!(
            r#"<configuration>
                <modules>
                    {}
                </modules>
            </configuration>"#,
            base_module("m1")
        );
        let cfg = validate(&xml).unwrap();
        assert_eq!(cfg.supervisor.module_restarts, super::super::DEFAULT_MODULE_RESTARTS);
        assert_eq!(cfg.groups.len(), 1);
        assert!(cfg.groups[0].profile.is_none());
        assert_eq!(cfg.groups[0].modules[0].name, "m1");
    }

    #[test]
    fn profile_requires_both_name_and_enabled() {
        let xml = r#"<configuration>
            <modules>
                <name>p1</name>
                <module>
                    <name>m1</name>
                    <path>/usr/bin/m1</path>
                    <enabled>true</enabled>
                </module>
            </modules>
        </configuration>"#;
        // name without enabled: container is not a profile.
        let cfg = validate(xml).unwrap();
        assert!(cfg.groups[0].profile.is_none());
    }

    #[test]
    fn duplicate_module_name_is_rejected() {
        let xml = format!(
            r#"<configuration>
                <modules>
                    {}
                    {}
                </modules>
            </configuration>"#,
            base_module("dup"),
            base_module("dup")
        );
        let err = validate(&xml).unwrap_err();
        assert!(err.reason.contains("duplicate"));
    }

    #[test]
    fn duplicate_profile_name_is_rejected() {
        let xml = r#"<configuration>
            <modules>
                <name>p1</name>
                <enabled>true</enabled>
                <module><name>a</name><path>/a</path><enabled>true</enabled></module>
            </modules>
            <modules>
                <name>p1</name>
                <enabled>false</enabled>
                <module><name>b</name><path>/b</path><enabled>true</enabled></module>
            </modules>
        </configuration>"#;
        let err = validate(xml).unwrap_err();
        assert!(err.reason.contains("duplicate"));
    }

    #[test]
    fn empty_params_is_a_distinct_error_from_missing() {
        let xml = r#"<configuration>
            <modules>
                <module>
                    <name>m1</name>
                    <path>/usr/bin/m1</path>
                    <enabled>true</enabled>
                    <params></params>
                </module>
            </modules>
        </configuration>"#;
        let err = validate(xml).unwrap_err();
        assert!(err.reason.contains("empty"));
    }

    #[test]
    fn unknown_child_element_is_rejected() {
        let xml = r#"<configuration>
            <modules>
                <module>
                    <name>m1</name>
                    <path>/usr/bin/m1</path>
                    <enabled>true</enabled>
                    <bogus>x</bogus>
                </module>
            </modules>
        </configuration>"#;
        let err = validate(xml).unwrap_err();
        assert!(err.reason.contains("unknown element"));
    }

    #[test]
    fn interfaces_are_reordered_in_then_out() {
        let xml = r#"<configuration>
            <modules>
                <module>
                    <name>m1</name>
                    <path>/usr/bin/m1</path>
                    <enabled>true</enabled>
                    <trapinterfaces>
                        <interface><type>TCP</type><direction>OUT</direction></interface>
                        <interface><type>FILE</type><direction>IN</direction></interface>
                    </trapinterfaces>
                </module>
            </modules>
        </configuration>"#;
        let cfg = validate(xml).unwrap();
        let ifcs = &cfg.groups[0].modules[0].interfaces;
        assert_eq!(ifcs[0].direction, Direction::In);
        assert_eq!(ifcs[1].direction, Direction::Out);
    }

    #[test]
    fn whitespace_around_enum_values_is_trimmed() {
        let xml = r#"<configuration>
            <modules>
                <module>
                    <name>m1</name>
                    <path>/usr/bin/m1</path>
                    <enabled>  true  </enabled>
                </module>
            </modules>
        </configuration>"#;
        let cfg = validate(xml).unwrap();
        assert!(cfg.groups[0].modules[0].enabled);
    }
}
