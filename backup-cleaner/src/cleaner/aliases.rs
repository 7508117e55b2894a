//! Alias validator.
//!
//! Every aliased disk needs exactly one working alias, and every file in a
//! logical disk's `data/` directory needs an alias pointing at it.

use super::CleanContext;
use crate::disk::{resolve_alias, OpenOptions};
use crate::paths;
use crate::storage::ListOptions;
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Outcome of checking one alias
#[derive(Debug, Clone, PartialEq, Eq)]
enum AliasCheck {
    /// Target exists and opens; holds the target path.
    Confirmed(String),
    /// Dangling or broken; the alias is not a usable disk.
    Invalid,
    /// Could not be decided (transient failure); nothing may be swept.
    Unknown,
}

/// Check all aliases, directory by directory. Returns the aliases that are
/// not usable disks so later stages can skip them. `interrupted` maps disks
/// with a pending merge to their marker.
pub(crate) async fn check_aliases(
    ctx: &CleanContext,
    aliases: &BTreeMap<String, Vec<String>>,
    interrupted: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    let per_dir = join_all(
        aliases
            .iter()
            .map(|(dir, dir_aliases)| check_disk_dir(ctx, dir, dir_aliases, interrupted)),
    )
    .await;

    per_dir.into_iter().flatten().collect()
}

async fn check_disk_dir(
    ctx: &CleanContext,
    dir: &str,
    aliases: &[String],
    interrupted: &BTreeMap<String, String>,
) -> Vec<String> {
    let checks = join_all(aliases.iter().map(|alias| {
        let options = OpenOptions {
            check_secondary_footer: !interrupted.contains_key(alias),
        };
        check_alias(ctx, alias, options)
    }))
    .await;

    let mut confirmed = HashSet::new();
    let mut invalid = Vec::new();
    let mut undecided = false;
    for (alias, check) in aliases.iter().zip(checks) {
        match check {
            AliasCheck::Confirmed(target) => {
                confirmed.insert(target);
            }
            AliasCheck::Invalid => invalid.push(alias.clone()),
            AliasCheck::Unknown => undecided = true,
        }
    }

    let data_dir = paths::join(dir, paths::DATA_DIR);
    let entries = match ctx.backend.list(&data_dir, ListOptions::tolerant()).await {
        Ok(entries) => entries,
        Err(e) => {
            ctx.warn(&format!("failed to list alias targets: {}", e), &data_dir);
            return invalid;
        }
    };

    let unaliased: Vec<&String> = entries
        .iter()
        .filter(|entry| !confirmed.contains(*entry))
        .collect();
    if unaliased.is_empty() {
        return invalid;
    }

    if undecided {
        ctx.warn(
            "some aliases could not be read, not removing unaliased disks",
            &data_dir,
        );
        return invalid;
    }

    join_all(unaliased.into_iter().map(|entry| async move {
        ctx.warn("no alias references disk", entry);
        ctx.remove_file(entry, "unaliased disk").await;
    }))
    .await;

    invalid
}

async fn check_alias(ctx: &CleanContext, alias: &str, options: OpenOptions) -> AliasCheck {
    let target = match resolve_alias(ctx.backend.as_ref(), alias).await {
        Ok(target) => target,
        Err(e) if e.is_structural() => {
            ctx.warn(&format!("alias is unreadable: {}", e), alias);
            ctx.remove_file(alias, "broken alias").await;
            return AliasCheck::Invalid;
        }
        Err(e) => {
            ctx.warn(&format!("failed to read alias: {}", e), alias);
            return AliasCheck::Unknown;
        }
    };

    if !paths::is_disk_file(paths::file_name(&target)) {
        ctx.warn(&format!("alias references non disk target {}", target), alias);
        ctx.remove_file(&target, "non disk alias target").await;
        ctx.remove_file(alias, "alias").await;
        return AliasCheck::Invalid;
    }

    // Opened only to prove the target is readable; the handle drops here.
    match ctx.codec.open(&ctx.backend, &target, options).await {
        Ok(_) => AliasCheck::Confirmed(target),
        Err(e) if e.is_not_found() || e.is_structural() => {
            ctx.warn(&format!("missing or broken alias target {}: {}", target, e), alias);
            ctx.remove_file(alias, "alias").await;
            AliasCheck::Invalid
        }
        Err(e) => {
            ctx.warn(&format!("failed to open alias target {}: {}", target, e), alias);
            AliasCheck::Unknown
        }
    }
}
