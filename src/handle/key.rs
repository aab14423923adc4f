// src/handle/key.rs

//! Registry key name canonicalisation.
//!
//! The kernel names key objects by their native path
//! (`\REGISTRY\MACHINE\SOFTWARE\...`). Detection rules are written against
//! the familiar root key names, so the native prefix is split off and
//! replaced by its well-known root.

use std::fmt;

const HKLM_PREFIX: &str = r"\REGISTRY\MACHINE";
const HKCR_PREFIX: &str = r"\REGISTRY\MACHINE\SOFTWARE\CLASSES";
const HKU_PREFIX: &str = r"\REGISTRY\USER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKey {
    ClassesRoot,
    CurrentUser,
    LocalMachine,
    Users,
}

impl RootKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootKey::ClassesRoot => "HKEY_CLASSES_ROOT",
            RootKey::CurrentUser => "HKEY_CURRENT_USER",
            RootKey::LocalMachine => "HKEY_LOCAL_MACHINE",
            RootKey::Users => "HKEY_USERS",
        }
    }
}

impl fmt::Display for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits a native key path into its root and the path relative to it.
/// Returns `None` for names that are not native registry paths.
///
/// `current_user_sid` maps `\REGISTRY\USER\<sid>` to `HKEY_CURRENT_USER`.
pub fn split_key<'a>(key: &'a str, current_user_sid: Option<&str>) -> Option<(RootKey, &'a str)> {
    if let Some(rest) = strip_prefix_ci(key, HKCR_PREFIX) {
        return Some((RootKey::ClassesRoot, rest));
    }
    if let Some(rest) = strip_prefix_ci(key, HKLM_PREFIX) {
        return Some((RootKey::LocalMachine, rest));
    }
    if let Some(rest) = strip_prefix_ci(key, HKU_PREFIX) {
        if let Some(sid) = current_user_sid.filter(|s| !s.is_empty()) {
            if let Some(rest) = strip_prefix_ci(rest, sid) {
                return Some((RootKey::CurrentUser, rest));
            }
        }
        return Some((RootKey::Users, rest));
    }
    None
}

/// Rebuilds `key` as `ROOT\relative`. Non-registry names come back as-is.
pub fn format_key(key: &str, current_user_sid: Option<&str>) -> String {
    match split_key(key, current_user_sid) {
        Some((root, "")) => root.to_string(),
        Some((root, rest)) => format!("{root}\\{rest}"),
        None => key.to_owned(),
    }
}

/// Case-insensitive prefix strip that only matches on a path component
/// boundary. The separator after the prefix is consumed.
fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &s[prefix.len()..];
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('\\')
    }
}
