//! Process launcher (C4): builds the child argument vector, forks and
//! execs each module, and redirects its stdio to per-module log files.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::info;

use crate::error::LaunchError;
use crate::state::RuntimeModule;

const LOG_FILE_MODE: u32 = 0o664;

/// Tokenise a module's `params` string the way the shell would: single-
/// and double-quoted segments, spaces as separators outside quotes.
///
/// Rejects (spec.md §4.3):
/// - an opening quote in the middle of a token
/// - an empty quoted region (`""` / `''`)
/// - an unterminated quote
/// - a literal `'` inside a double-quoted segment
pub fn tokenize(params: &str) -> Result<Vec<String>, String> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut tokens = Vec::new();
    let mut buf = String::new();
    let mut quote = Quote::None;
    let mut buf_started_in_quote = false;

    for c in params.chars() {
        match quote {
            Quote::None => match c {
                ' ' | '\t' => {
                    if !buf.is_empty() {
                        tokens.push(std::mem::take(&mut buf));
                    }
                }
                '"' => {
                    if !buf.is_empty() {
                        return Err("opening quote mid-token".to_string());
                    }
                    quote = Quote::Double;
                    buf_started_in_quote = true;
                }
                '\'' => {
                    if !buf.is_empty() {
                        return Err("opening quote mid-token".to_string());
                    }
                    quote = Quote::Single;
                    buf_started_in_quote = true;
                }
                other => buf.push(other),
            },
            Quote::Double => match c {
                '"' => {
                    if buf.is_empty() && buf_started_in_quote {
                        return Err("empty quoted region".to_string());
                    }
                    tokens.push(std::mem::take(&mut buf));
                    quote = Quote::None;
                    buf_started_in_quote = false;
                }
                '\'' => return Err("single quote inside double-quoted segment".to_string()),
                other => buf.push(other),
            },
            Quote::Single => match c {
                '\'' => {
                    if buf.is_empty() && buf_started_in_quote {
                        return Err("empty quoted region".to_string());
                    }
                    tokens.push(std::mem::take(&mut buf));
                    quote = Quote::None;
                    buf_started_in_quote = false;
                }
                other => buf.push(other),
            },
        }
    }

    if quote != Quote::None {
        return Err("unterminated quote".to_string());
    }
    if !buf.is_empty() {
        tokens.push(buf);
    }

    Ok(tokens)
}

/// Rewrite a legacy `address,port` pair to `address:port` (spec.md §4.3).
fn rewrite_legacy_address_port(params: &str) -> String {
    if let Some((addr, port)) = params.split_once(',') {
        if !addr.contains(',') && !port.contains(',') && port.trim().parse::<u16>().is_ok() {
            return format!("{addr}:{port}");
        }
    }
    params.to_string()
}

/// Build the `-i <spec>` interface specifier: IN entries first, then OUT,
/// comma-separated, no trailing comma (spec.md §4.3, B3).
pub fn build_interface_specifier(module: &RuntimeModule) -> String {
    module
        .interfaces
        .iter()
        .map(|ifc| {
            let typechar = ifc.ty.typechar();
            let params = rewrite_legacy_address_port(&ifc.params);
            format!("{typechar}:{params}")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Build the full argument vector for a module (spec.md §4.3).
pub fn build_argv(module: &RuntimeModule) -> Result<Vec<String>, LaunchError> {
    let mut argv = vec![module.name.clone()];

    if let Some(params) = &module.params {
        let tokens = tokenize(params).map_err(|reason| LaunchError::ArgParse {
            module: module.name.clone(),
            reason,
        })?;
        argv.extend(tokens);
    }

    if !module.interfaces.is_empty() {
        argv.push("-i".to_string());
        argv.push(build_interface_specifier(module));
    }

    Ok(argv)
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(LOG_FILE_MODE)
        .open(path)
}

/// Fork and exec a module, redirecting its stdio to the per-module log
/// files under `logs_dir/modules_logs/`. Returns the child PID.
pub fn spawn(module: &RuntimeModule, logs_dir: &Path) -> Result<u32, LaunchError> {
    let argv = build_argv(module)?;

    let modules_logs = logs_dir.join("modules_logs");
    let stdout_path = modules_logs.join(format!("{}_stdout", module.name));
    let stderr_path = modules_logs.join(format!("{}_stderr", module.name));

    let stdout_file = open_log_file(&stdout_path).map_err(|source| LaunchError::LogFileOpen {
        path: stdout_path.clone(),
        source,
    })?;
    let stderr_file = open_log_file(&stderr_path).map_err(|source| LaunchError::LogFileOpen {
        path: stderr_path.clone(),
        source,
    })?;

    let mut cmd = Command::new(&module.path);
    cmd.arg0(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file));

    // SAFETY: setsid() is async-signal-safe and is the only syscall this
    // closure performs between fork and exec, as required by
    // CommandExt::pre_exec's contract.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }

    let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        module: module.name.clone(),
        source,
    })?;
    let pid = child.id();
    info!(module = %module.name, pid, "[START] Starting module {}", module.name);
    // The child is deliberately not waited on here: the scheduler reaps
    // exited children by raw PID during its periodic pass (C7 step 6),
    // independent of this `Child` handle's lifetime.
    std::mem::drop(child);
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Direction, IfcType};
    use crate::state::RuntimeInterface;

    #[test]
    fn tokenise_quoted_segments() {
        let tokens = tokenize("a 'b c' \"d\"").unwrap();
        assert_eq!(tokens, vec!["a", "b c", "d"]);
    }

    #[test]
    fn rejects_opening_quote_mid_token() {
        assert!(tokenize("ab\"cd\"").is_err());
    }

    #[test]
    fn rejects_empty_quoted_region() {
        assert!(tokenize("a \"\" b").is_err());
        assert!(tokenize("a '' b").is_err());
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert!(tokenize("a \"b").is_err());
    }

    #[test]
    fn rejects_single_quote_inside_double_quoted_segment() {
        assert!(tokenize("\"it's here\"").is_err());
    }

    fn ifc(direction: Direction, ty: IfcType, params: &str) -> RuntimeInterface {
        RuntimeInterface {
            direction,
            ty,
            params: params.to_string(),
            note: None,
            input_stats: None,
            output_stats: None,
        }
    }

    fn test_module(interfaces: Vec<RuntimeInterface>) -> RuntimeModule {
        let decl = crate::config::Module {
            name: "m".to_string(),
            path: "/bin/true".to_string(),
            enabled: true,
            restart_cap: None,
            params: None,
            interfaces: vec![],
        };
        let mut m = RuntimeModule::new_from_declared(&decl, None, 0);
        m.interfaces = interfaces;
        m
    }

    #[test]
    fn interface_specifier_orders_in_before_out_no_trailing_comma() {
        let module = test_module(vec![
            ifc(Direction::In, IfcType::Tcp, "1"),
            ifc(Direction::In, IfcType::File, "2"),
            ifc(Direction::In, IfcType::Blackhole, "3"),
            ifc(Direction::Out, IfcType::Tcp, "4"),
            ifc(Direction::Out, IfcType::UnixSocket, "5"),
        ]);
        let spec = build_interface_specifier(&module);
        assert_eq!(spec, "t:1,f:2,b:3,t:4,u:5");
    }

    #[test]
    fn legacy_address_port_pair_is_rewritten() {
        let module = test_module(vec![ifc(Direction::Out, IfcType::Tcp, "127.0.0.1,7000")]);
        let spec = build_interface_specifier(&module);
        assert_eq!(spec, "t:127.0.0.1:7000");
    }
}
