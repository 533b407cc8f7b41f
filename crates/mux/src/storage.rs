// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted session files: allowed-root path policy, discovery for
//! `list_stored_sessions`, and atomic writes.
//!
//! The multiplexer treats session files as opaque blobs; it only
//! lists them and hands validated paths to the backend.

use std::path::{Component, Path, PathBuf};

use crate::error::{CommandError, ErrorKind};
use crate::protocol::StoredSessionInfo;

/// The global stored-session root (`~/.pi/agent/sessions/`).
pub fn home_sessions_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home).join(".pi").join("agent").join("sessions")
    })
}

/// Roots scanned by `list_stored_sessions`: the home root plus the
/// working directory's project root.
pub fn session_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = home_sessions_dir() {
        roots.push(home);
    }
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd.join(".pi").join("sessions"));
    }
    roots
}

/// Whether `path` is a loadable session file: absolute, `.json` or
/// `.jsonl`, free of traversal sequences, and under an allowed root
/// (the home root or any `.pi/sessions/` directory).
pub fn check_session_path(path: &str) -> Result<PathBuf, CommandError> {
    if path.contains('\0') {
        return Err(CommandError::new(ErrorKind::InvalidField, "path contains a null byte"));
    }
    if path.starts_with('~') {
        return Err(CommandError::new(ErrorKind::InvalidField, "path must be absolute, not ~"));
    }

    let path = PathBuf::from(path);
    if !path.is_absolute() {
        return Err(CommandError::new(ErrorKind::InvalidField, "path must be absolute"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CommandError::new(ErrorKind::InvalidField, "path must not contain .."));
    }

    let suffix_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "json" || e == "jsonl");
    if !suffix_ok {
        return Err(CommandError::new(
            ErrorKind::InvalidField,
            "session files must end in .json or .jsonl",
        ));
    }

    if !under_allowed_root(&path) {
        return Err(CommandError::new(
            ErrorKind::InvalidField,
            "path is outside the allowed session roots",
        ));
    }

    Ok(path)
}

/// Whether `path` may receive an HTML export: same root policy as
/// session files, but with an `.html` suffix.
pub fn check_export_path(path: &str) -> Result<PathBuf, CommandError> {
    if path.contains('\0') || path.starts_with('~') {
        return Err(CommandError::new(ErrorKind::InvalidField, "invalid export path"));
    }
    let path = PathBuf::from(path);
    if !path.is_absolute() || path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CommandError::new(
            ErrorKind::InvalidField,
            "export path must be absolute with no ..",
        ));
    }
    if path.extension().and_then(|e| e.to_str()) != Some("html") {
        return Err(CommandError::new(ErrorKind::InvalidField, "export path must end in .html"));
    }
    if !under_allowed_root(&path) {
        return Err(CommandError::new(
            ErrorKind::InvalidField,
            "export path is outside the allowed session roots",
        ));
    }
    Ok(path)
}

fn under_allowed_root(path: &Path) -> bool {
    if let Some(home_root) = home_sessions_dir() {
        if path.starts_with(&home_root) {
            return true;
        }
    }
    // Any `.pi/sessions/` directory is a valid project-local root.
    let comps: Vec<&str> = path.components().filter_map(|c| c.as_os_str().to_str()).collect();
    comps.windows(2).any(|w| w == [".pi", "sessions"])
}

/// Enumerate session files under the allowed roots. Unreadable roots
/// are skipped, not errors.
pub fn list_stored_sessions() -> Vec<StoredSessionInfo> {
    let mut files = Vec::new();
    for root in session_roots() {
        let Ok(entries) = std::fs::read_dir(&root) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_session = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "json" || e == "jsonl");
            if !is_session {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            files.push(StoredSessionInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: path.to_string_lossy().into_owned(),
                size_bytes: meta.len(),
                modified_ms,
            });
        }
    }
    files.sort_by(|a, b| b.modified_ms.cmp(&a.modified_ms));
    files
}

/// Write a file atomically: `<path>.<pid>.<uuid8>.tmp`, then rename
/// onto the final name.
pub fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<u64> {
    let uuid8 = &uuid::Uuid::new_v4().simple().to_string()[..8];
    let tmp = PathBuf::from(format!(
        "{}.{}.{}.tmp",
        path.display(),
        std::process::id(),
        uuid8
    ));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp, contents)?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(contents.len() as u64),
        Err(e) => {
            // Leave no orphan temp file behind on a failed rename.
            let _ = std::fs::remove_file(&tmp);
            Err(e.into())
        }
    }
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
