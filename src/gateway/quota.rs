//! Quota accounting, backing `get_quota`.
//!
//! `used` has no cheaper definition than "sum of file sizes reachable from
//! the jail root", so this walker follows the same recursive descent
//! `chroot::ChrootCapability::delete_recursive_beneath` already performs,
//! reused here instead of duplicated since `list_folder` needs the same
//! traversal shape for nested listings.

use crate::chroot::ChrootCapability;
use crate::error::GatewayResult;

/// The xattr key a per-resource quota override is read from. Falls back to
/// the configured default when absent.
pub const QUOTA_XATTR_KEY: &str = "user.quota.max_bytes";

/// Sum the sizes of every regular file reachable from `rel`, recursing into
/// subdirectories. Symlinks are counted by their own (not their target's)
/// size, matching `lstat` semantics.
pub fn directory_size(chroot: &ChrootCapability, rel: &str) -> GatewayResult<u64> {
    let meta = chroot.stat_beneath(rel)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0u64;
    for name in chroot.read_dir_beneath(rel)? {
        let child = if rel == "." {
            name
        } else {
            format!("{rel}/{name}")
        };
        total += directory_size(chroot, &child)?;
    }
    Ok(total)
}
