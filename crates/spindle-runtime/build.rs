//! Build script for spindle-runtime
//!
//! Produces `OUT_DIR/spindle_merged_config.rs`:
//! 1. Start from the library defaults below
//! 2. If `SPINDLE_CONFIG_RS` points at a file, read its `pub const` lines
//! 3. Known names in that file replace the defaults
//!
//! The user file only needs the values it changes.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

const USER_CONFIG_VAR: &str = "SPINDLE_CONFIG_RS";

/// (name, type, default)
const CONFIG_PARAMS: &[(&str, &str, &str)] = &[
    ("THREADS", "usize", "1"),
    ("STACK_SIZE", "usize", "128 * 1024"),
    ("MAX_EVENTS", "usize", "256"),
    ("MAX_TIMEOUT_MS", "u64", "3000"),
    ("TCP_CONNECT_TIMEOUT_MS", "u64", "5000"),
    ("FD_TABLE_SIZE", "usize", "64"),
    ("HOOK_ENABLE", "bool", "true"),
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest = Path::new(&out_dir).join("spindle_merged_config.rs");

    let mut values: BTreeMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|(name, _, default)| (*name, default.to_string()))
        .collect();

    println!("cargo:rerun-if-env-changed={}", USER_CONFIG_VAR);
    let user_path = env::var(USER_CONFIG_VAR).ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                for name in merge_overrides(&content, &mut values) {
                    println!("cargo:warning=Unknown spindle config parameter: {}", name);
                }
                println!("cargo:warning=Using custom spindle config: {}", path);
            }
            Err(e) => println!("cargo:warning=Failed to read {} ({}): {}", USER_CONFIG_VAR, path, e),
        }
    }

    fs::write(&dest, render(&values, user_path.is_some())).expect("failed to write merged config");
}

/// Apply `pub const NAME: T = VALUE;` lines onto `values`, returning the
/// names that are not known parameters
fn merge_overrides(content: &str, values: &mut BTreeMap<&str, String>) -> Vec<String> {
    let mut unknown = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.starts_with("//") {
            continue;
        }
        let Some((name, value)) = split_const(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|(known, _, _)| *known == name) {
            Some((known, _, _)) => {
                values.insert(known, value);
            }
            None => unknown.push(name),
        }
    }
    unknown
}

fn split_const(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?;
    let (name, rest) = rest.split_once(':')?;
    let (_, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    Some((name.trim().to_string(), value.to_string()))
}

fn render(values: &BTreeMap<&str, String>, has_user_file: bool) -> String {
    let mut out = String::from("// Generated by spindle-runtime/build.rs\n");
    if has_user_file {
        out.push_str("// Defaults merged with values from SPINDLE_CONFIG_RS\n");
    }
    out.push('\n');
    for (name, ty, _) in CONFIG_PARAMS {
        out.push_str(&format!("pub const {}: {} = {};\n", name, ty, values[name]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_const() {
        assert_eq!(
            split_const("pub const THREADS: usize = 8;"),
            Some(("THREADS".into(), "8".into()))
        );
        assert_eq!(
            split_const("pub const STACK_SIZE: usize = 256 * 1024;"),
            Some(("STACK_SIZE".into(), "256 * 1024".into()))
        );
        assert_eq!(split_const("const X: u8 = 1;"), None);
    }

    #[test]
    fn test_merge_overrides() {
        let mut values: BTreeMap<&str, String> =
            CONFIG_PARAMS.iter().map(|(n, _, d)| (*n, d.to_string())).collect();
        let unknown = merge_overrides(
            "// tuned for the echo bench\n\
             pub const MAX_EVENTS: usize = 1024;\n\
             pub const HOOK_ENABLE: bool = false;\n\
             pub const SLOTS: usize = 3;\n",
            &mut values,
        );
        assert_eq!(values["MAX_EVENTS"], "1024");
        assert_eq!(values["HOOK_ENABLE"], "false");
        assert_eq!(values["THREADS"], "1");
        assert_eq!(unknown, vec!["SLOTS".to_string()]);
    }
}
