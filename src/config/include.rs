//! Template file-inclusion preprocessor.
//!
//! A pure text transform, run before any XML parsing: a line of exactly
//! the form `<!-- include PATH -->` is replaced by either the contents of
//! the single file `PATH`, or the concatenation (in name order, for
//! determinism) of every file under directory `PATH` whose name ends in
//! `.sup`. Recursion is not performed (spec.md §6).

use std::fs;
use std::path::Path;

const INCLUDE_PREFIX: &str = "<!-- include ";
const INCLUDE_SUFFIX: &str = " -->";

/// Expand `<!-- include PATH -->` directives in `template_path`, returning
/// the canonical document text that should be handed to the validator.
pub fn expand_includes(template_path: &Path) -> std::io::Result<String> {
    let raw = fs::read_to_string(template_path)?;
    let base = template_path.parent().unwrap_or_else(|| Path::new("."));
    expand_includes_str(&raw, base)
}

fn expand_includes_str(raw: &str, base: &Path) -> std::io::Result<String> {
    let mut out = String::with_capacity(raw.len());
    for line in raw.lines() {
        match parse_include_line(line) {
            Some(target) => {
                let path = resolve(base, target);
                out.push_str(&read_include_target(&path)?);
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    Ok(out)
}

fn parse_include_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix(INCLUDE_PREFIX)
        .and_then(|rest| rest.strip_suffix(INCLUDE_SUFFIX))
}

fn resolve(base: &Path, target: &str) -> std::path::PathBuf {
    let target_path = Path::new(target);
    if target_path.is_absolute() {
        target_path.to_path_buf()
    } else {
        base.join(target_path)
    }
}

fn read_include_target(path: &Path) -> std::io::Result<String> {
    let metadata = fs::metadata(path)?;
    if metadata.is_dir() {
        let mut names: Vec<_> = fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "sup").unwrap_or(false))
            .collect();
        names.sort();
        let mut combined = String::new();
        for file in names {
            combined.push_str(&fs::read_to_string(&file)?);
            if !combined.ends_with('\n') {
                combined.push('\n');
            }
        }
        Ok(combined)
    } else {
        let mut contents = fs::read_to_string(path)?;
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn passes_through_non_include_lines() {
        let dir = tempfile::tempdir().unwrap();
        let text = "<modules>\n  <module/>\n</modules>\n";
        let out = expand_includes_str(text, dir.path()).unwrap();
        assert_eq!(out, text);
    }

    #[test]
    fn expands_single_file_include() {
        let dir = tempfile::tempdir().unwrap();
        let inc = dir.path().join("part.xml");
        fs::write(&inc, "<module name=\"a\"/>\n").unwrap();
        let text = "<root>\n<!-- include part.xml -->\n</root>\n";
        let out = expand_includes_str(text, dir.path()).unwrap();
        assert_eq!(out, "<root>\n<module name=\"a\"/>\n</root>\n");
    }

    #[test]
    fn expands_directory_include_sorted_by_sup_extension() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("modules.d");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("b.sup"), "<module name=\"b\"/>\n").unwrap();
        fs::write(sub.join("a.sup"), "<module name=\"a\"/>\n").unwrap();
        let mut ignored = fs::File::create(sub.join("readme.txt")).unwrap();
        writeln!(ignored, "ignore me").unwrap();

        let text = "<!-- include modules.d -->\n";
        let out = expand_includes_str(text, dir.path()).unwrap();
        assert_eq!(out, "<module name=\"a\"/>\n<module name=\"b\"/>\n");
    }

    #[test]
    fn does_not_recurse_into_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("modules.d");
        let nested = sub.join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("deep.sup"), "<module name=\"deep\"/>\n").unwrap();
        fs::write(sub.join("top.sup"), "<module name=\"top\"/>\n").unwrap();

        let text = "<!-- include modules.d -->\n";
        let out = expand_includes_str(text, dir.path()).unwrap();
        assert_eq!(out, "<module name=\"top\"/>\n");
    }
}
