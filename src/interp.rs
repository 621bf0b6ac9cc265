//! Script variable interpolation.
//!
//! Expands `@(name)` (required) and `@(name?)` (optional) embeds against a
//! stage-specific reserved table, then the user-supplied `-o` table. A pure
//! text transform: same tables and input always produce the same fresh
//! output string.

use anyhow::{bail, Result};

/// Reserved names the executor owns. `-o` definitions of these are refused.
pub const RESERVED_NAMES: &[&str] = &[
    "thread_count",
    "prefix",
    "sysroot_dir",
    "sources_dir",
    "cache_dir",
    "build_dir",
    "install_dir",
    "source_dir",
];

/// An ordered name/value table with case-insensitive lookup. Small enough
/// that a linear scan beats a map.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    entries: Vec<(String, String)>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Expand every embed in `input`. Reserved names win over user names.
pub fn interpolate(input: &str, reserved: &Vars, user: &Vars) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] == b'@' && bytes.get(pos + 1) == Some(&b'(') {
            let name_start = pos + 2;
            let Some(rel_end) = input[name_start..].find(')') else {
                bail!("unterminated embed `@(` in script");
            };
            let name_end = name_start + rel_end;
            let raw = &input[name_start..name_end];
            let (name, optional) = match raw.strip_suffix('?') {
                Some(stripped) => (stripped, true),
                None => (raw, false),
            };

            match reserved.get(name).or_else(|| user.get(name)) {
                Some(value) => out.push_str(value),
                None if optional => {}
                None => bail!("unknown embed `{name}`"),
            }
            pos = name_end + 1;
        } else {
            // Only `@(` opens a token; everything else passes through.
            let ch_len = input[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
            out.push_str(&input[pos..pos + ch_len]);
            pos += ch_len;
        }
    }
    Ok(out)
}
