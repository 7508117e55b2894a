//! Backend-relative path arithmetic and repository naming conventions.
//!
//! Paths handed to a [`Backend`](crate::storage::Backend) are `/`-separated
//! and relative to the backend root. References stored inside files (alias
//! targets, parent locators, metadata entries) are relative to the directory
//! of the referencing file and are resolved lexically.

/// Extension of every disk file, aliases included.
pub const DISK_EXT: &str = ".vhd";

/// Extension of alias files.
pub const ALIAS_EXT: &str = ".alias.vhd";

/// Extension of full-backup archives.
pub const ARCHIVE_EXT: &str = ".xva";

/// Extension of archive checksum sidecars.
pub const CHECKSUM_EXT: &str = ".xva.checksum";

/// Extension of backup metadata records.
pub const METADATA_EXT: &str = ".json";

/// Suffix of interrupted-merge markers (`.<disk>.merge.json`).
pub const MERGE_MARKER_SUFFIX: &str = ".merge.json";

/// Directory holding the per-job disk trees inside a VM backup directory.
pub const VDIS_DIR: &str = "vdis";

/// Directory holding alias targets inside a logical-disk directory.
pub const DATA_DIR: &str = "data";

pub fn is_disk_file(name: &str) -> bool {
    name.ends_with(DISK_EXT)
}

pub fn is_alias_file(name: &str) -> bool {
    name.ends_with(ALIAS_EXT)
}

pub fn is_archive_file(name: &str) -> bool {
    name.ends_with(ARCHIVE_EXT)
}

pub fn is_checksum_file(name: &str) -> bool {
    name.ends_with(CHECKSUM_EXT)
}

/// Metadata records are visible `.json` files directly in the VM directory.
pub fn is_metadata_file(name: &str) -> bool {
    name.ends_with(METADATA_EXT) && !name.starts_with('.')
}

/// Name of the disk covered by a marker file, if `name` is one.
pub fn marker_target(name: &str) -> Option<&str> {
    let inner = name.strip_prefix('.')?.strip_suffix(MERGE_MARKER_SUFFIX)?;
    if inner.is_empty() {
        None
    } else {
        Some(inner)
    }
}

/// Path of the interrupted-merge marker covering `disk_path`.
pub fn marker_path(disk_path: &str) -> String {
    join(
        dirname(disk_path),
        &format!(".{}{}", file_name(disk_path), MERGE_MARKER_SUFFIX),
    )
}

/// Archive covered by a checksum sidecar.
pub fn checksum_archive(checksum_path: &str) -> Option<&str> {
    checksum_path.strip_suffix(".checksum")
}

/// Last component of `path`.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Everything before the last component of `path` (empty for the root).
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Collapse `.`, `..` and repeated separators. Leading `..` components that
/// would climb above the backend root are dropped.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Resolve `reference` against `base_dir`. Absolute references (leading `/`)
/// are taken from the backend root.
pub fn resolve(base_dir: &str, reference: &str) -> String {
    if reference.starts_with('/') {
        normalize(reference)
    } else {
        normalize(&join(base_dir, reference))
    }
}

/// Reference to `path` from `base_dir`, the inverse of [`resolve`] for
/// relative references.
pub fn relative(base_dir: &str, path: &str) -> String {
    let base = normalize(base_dir);
    let target = normalize(path);
    let base_parts: Vec<&str> = base.split('/').filter(|part| !part.is_empty()).collect();
    let target_parts: Vec<&str> = target.split('/').filter(|part| !part.is_empty()).collect();

    let common = base_parts
        .iter()
        .zip(&target_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts = vec![".."; base_parts.len() - common];
    parts.extend(&target_parts[common..]);
    parts.join("/")
}
