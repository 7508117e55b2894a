//! Alias files: small text files naming the real location of a disk.
//!
//! Metadata records and parent locators point at the alias, the data lives
//! under the logical disk's `data/` directory. Deleting or renaming a disk
//! therefore has to treat the alias and its target as one unit.

use crate::paths;
use crate::storage::{unlink_if_exists, Backend};
use crate::utils::errors::{CleanerError, Result};
use tracing::{debug, warn};

/// Read an alias and return the backend path of its target.
pub async fn resolve_alias(backend: &dyn Backend, alias_path: &str) -> Result<String> {
    let content = backend.read_file(alias_path).await?;
    let target = std::str::from_utf8(&content).map_err(|_| CleanerError::InvalidAlias {
        path: alias_path.to_string(),
        reason: "content is not UTF-8".to_string(),
    })?;

    let target = target.trim();
    if target.is_empty() {
        return Err(CleanerError::InvalidAlias {
            path: alias_path.to_string(),
            reason: "alias is empty".to_string(),
        });
    }

    Ok(paths::resolve(paths::dirname(alias_path), target))
}

/// Delete a disk. For an alias the target goes first, so a crash in between
/// leaves an alias pointing nowhere (detected on the next scan) rather than
/// data nobody can find.
pub async fn unlink_disk(backend: &dyn Backend, path: &str) -> Result<()> {
    if paths::is_alias_file(paths::file_name(path)) {
        match resolve_alias(backend, path).await {
            Ok(target) => {
                debug!(alias = %path, target = %target, "Removing alias target");
                unlink_if_exists(backend, &target).await?;
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) if e.is_structural() => {}
            Err(e) => return Err(e),
        }
    }
    unlink_if_exists(backend, path).await?;
    Ok(())
}

/// Move disk `from` over disk `to`. When `to` is an alias, its old target
/// is removed once the alias has been swapped. A failed removal only leaves
/// an unaliased file in `data/`, which the next scan sweeps.
pub async fn rename_disk(backend: &dyn Backend, from: &str, to: &str) -> Result<()> {
    let from_alias = paths::is_alias_file(paths::file_name(from));
    let to_alias = paths::is_alias_file(paths::file_name(to));
    if from_alias != to_alias {
        return Err(CleanerError::Merge(format!(
            "cannot rename {} over {}: alias and plain disk mixed",
            from, to
        )));
    }
    if from_alias && paths::dirname(from) != paths::dirname(to) {
        return Err(CleanerError::Merge(format!(
            "cannot move alias {} to another directory ({})",
            from, to
        )));
    }

    let stale_target = if to_alias {
        match resolve_alias(backend, to).await {
            Ok(old_target) => {
                let new_target = resolve_alias(backend, from).await?;
                (old_target != new_target).then_some(old_target)
            }
            Err(e) if e.is_not_found() || e.is_structural() => None,
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    backend.rename(from, to).await?;

    if let Some(old_target) = stale_target {
        debug!(alias = %to, target = %old_target, "Removing replaced alias target");
        if let Err(e) = unlink_if_exists(backend, &old_target).await {
            warn!(
                alias = %to,
                target = %old_target,
                error = %e,
                "Failed to remove replaced alias target"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    const DIR: &str = "vm/vdis/job/disk";

    #[tokio::test]
    async fn test_resolve_alias_relative_to_alias_dir() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.put(&format!("{DIR}/a.alias.vhd"), "data/1111.vhd\n").await;

        let target = resolve_alias(&backend, &format!("{DIR}/a.alias.vhd")).await?;
        assert_eq!(target, format!("{DIR}/data/1111.vhd"));
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_empty_alias_is_structural() {
        let backend = MemoryBackend::new();
        backend.put(&format!("{DIR}/a.alias.vhd"), "  ").await;

        let err = resolve_alias(&backend, &format!("{DIR}/a.alias.vhd"))
            .await
            .unwrap_err();
        assert!(err.is_structural());
    }

    #[tokio::test]
    async fn test_unlink_alias_removes_target() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.put(&format!("{DIR}/a.alias.vhd"), "data/1111.vhd").await;
        backend.put(&format!("{DIR}/data/1111.vhd"), "disk").await;
        backend.put(&format!("{DIR}/data/2222.vhd"), "other").await;

        unlink_disk(&backend, &format!("{DIR}/a.alias.vhd")).await?;
        assert_eq!(backend.paths().await, vec![format!("{DIR}/data/2222.vhd")]);

        // Already gone is fine.
        unlink_disk(&backend, &format!("{DIR}/a.alias.vhd")).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_alias_over_alias() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.put(&format!("{DIR}/a.alias.vhd"), "data/1111.vhd").await;
        backend.put(&format!("{DIR}/data/1111.vhd"), "merged").await;
        backend.put(&format!("{DIR}/b.alias.vhd"), "data/2222.vhd").await;
        backend.put(&format!("{DIR}/data/2222.vhd"), "child").await;

        rename_disk(&backend, &format!("{DIR}/a.alias.vhd"), &format!("{DIR}/b.alias.vhd")).await?;

        assert_eq!(
            backend.paths().await,
            vec![format!("{DIR}/b.alias.vhd"), format!("{DIR}/data/1111.vhd")]
        );
        assert_eq!(
            resolve_alias(&backend, &format!("{DIR}/b.alias.vhd")).await?,
            format!("{DIR}/data/1111.vhd")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_refuses_mixed_kinds() {
        let backend = MemoryBackend::new();
        backend.put(&format!("{DIR}/a.alias.vhd"), "data/1111.vhd").await;
        backend.put(&format!("{DIR}/b.vhd"), "plain").await;

        let err = rename_disk(&backend, &format!("{DIR}/a.alias.vhd"), &format!("{DIR}/b.vhd"))
            .await
            .unwrap_err();
        assert!(matches!(err, CleanerError::Merge(_)));
        assert!(backend.exists(&format!("{DIR}/b.vhd")).await);
    }
}
