//! Path Coordinate Translator.
//!
//! Converts paths between the three coordinate systems a request passes
//! through (external → chroot-relative → cluster-volume) and enforces jail
//! bounds. Kept as pure string transforms, separate from any syscall, so the
//! translation logic is exhaustively unit-testable without a filesystem.

use smallvec::SmallVec;

use crate::error::{GatewayError, GatewayResult};

/// Context string attached to a [`GatewayError::SecurityViolation`] so the
/// caller can tell which validation step rejected the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationContext {
    /// Rejected while translating a caller-supplied external path.
    UserPath,
    /// Rejected while validating a path resolved by the Inode Resolver.
    InodeResolution,
}

impl std::fmt::Display for ValidationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationContext::UserPath => write!(f, "user path"),
            ValidationContext::InodeResolution => write!(f, "inode resolution"),
        }
    }
}

/// Translates between external, chroot-relative, and cluster-volume path
/// coordinates for one mount.
#[derive(Debug, Clone)]
pub struct Translator {
    chroot_dir: String,
    local_mount_point: String,
    cluster_volume_prefix: String,
}

impl Translator {
    /// Build a translator bound to the given chroot directory, local mount
    /// point, and cluster-volume prefix (all absolute paths).
    pub fn new(
        chroot_dir: impl Into<String>,
        local_mount_point: impl Into<String>,
        cluster_volume_prefix: impl Into<String>,
    ) -> Self {
        Translator {
            chroot_dir: normalize_abs(&chroot_dir.into()),
            local_mount_point: normalize_abs(&local_mount_point.into()),
            cluster_volume_prefix: normalize_abs(&cluster_volume_prefix.into()),
        }
    }

    /// Convert an external path (`ext == "/"` means jail root) to its
    /// chroot-relative form (never begins with `/`; `/` maps to `.`).
    pub fn to_chroot(&self, ext: &str) -> GatewayResult<String> {
        let normalized = normalize(ext);
        if normalized == "/" {
            return Ok(".".to_owned());
        }
        validate_no_escape(&normalized, ValidationContext::UserPath)?;
        Ok(normalized.trim_start_matches('/').to_owned())
    }

    /// Convert a chroot-relative path back to external form.
    pub fn from_chroot(&self, cr: &str) -> String {
        if cr == "." || cr.is_empty() {
            return "/".to_owned();
        }
        if cr.starts_with('/') {
            cr.to_owned()
        } else {
            format!("/{cr}")
        }
    }

    /// Convert an external path to its cluster-volume (RADOS-canonical)
    /// form: prepend `chroot_dir`, then substitute `local_mount_point` for
    /// `cluster_volume_prefix`.
    pub fn user_to_volume(&self, ext: &str) -> GatewayResult<String> {
        let normalized = normalize(ext);
        validate_no_escape(&normalized, ValidationContext::UserPath)?;

        let full = join_abs(&self.chroot_dir, &normalized);
        let volume = substitute_prefix(&full, &self.local_mount_point, &self.cluster_volume_prefix)
            .unwrap_or(full);
        self.validate_within_bounds(&volume, ValidationContext::UserPath)?;
        Ok(volume)
    }

    /// Convert a cluster-volume path back to external form: substitute
    /// `cluster_volume_prefix` for `local_mount_point`, then strip
    /// `chroot_dir`, ensuring a leading `/`.
    pub fn volume_to_user(&self, vol: &str) -> GatewayResult<String> {
        self.validate_within_bounds(vol, ValidationContext::InodeResolution)?;

        let mounted = substitute_prefix(vol, &self.cluster_volume_prefix, &self.local_mount_point)
            .unwrap_or_else(|| vol.to_owned());

        let stripped = strip_prefix_path(&mounted, &self.chroot_dir).unwrap_or(mounted);
        let ext = if stripped.starts_with('/') {
            stripped
        } else {
            format!("/{stripped}")
        };
        Ok(normalize(&ext))
    }

    /// Fail with [`GatewayError::SecurityViolation`] unless the normalized
    /// form of `vol` is `cluster_volume_prefix` itself or a descendant of it
    /// (or of `/` when the prefix is `/`).
    pub fn validate_within_bounds(
        &self,
        vol: &str,
        ctx: ValidationContext,
    ) -> GatewayResult<()> {
        let normalized = normalize(vol);
        if contains_unresolved_parent(vol) && !is_descendant(&normalized, &self.cluster_volume_prefix)
        {
            return Err(GatewayError::SecurityViolation(format!(
                "{ctx}: path {vol:?} escapes volume prefix {:?} via unresolved '..'",
                self.cluster_volume_prefix
            )));
        }
        if !is_descendant(&normalized, &self.cluster_volume_prefix) {
            return Err(GatewayError::SecurityViolation(format!(
                "{ctx}: path {vol:?} (normalized {normalized:?}) is not within volume prefix {:?}",
                self.cluster_volume_prefix
            )));
        }
        Ok(())
    }

    /// The cluster-volume prefix this translator was built with.
    pub fn cluster_volume_prefix(&self) -> &str {
        &self.cluster_volume_prefix
    }
}

/// True if `path`, taken literally (pre-normalization), contains a `..`
/// component. Used only to phrase a more specific error message; the
/// actual security decision is always based on the normalized form.
fn contains_unresolved_parent(path: &str) -> bool {
    path.split('/').any(|c| c == "..")
}

/// `child == prefix`, or `child` starts with `prefix` followed by `/`
/// (prefix `"/"` matches everything).
fn is_descendant(child: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return child.starts_with('/');
    }
    child == prefix || child.starts_with(&format!("{prefix}/"))
}

fn strip_prefix_path(path: &str, prefix: &str) -> Option<String> {
    if prefix == "/" || prefix.is_empty() {
        return Some(path.to_owned());
    }
    path.strip_prefix(prefix).map(|s| s.to_owned())
}

fn substitute_prefix(path: &str, from: &str, to: &str) -> Option<String> {
    if from == "/" {
        // Every absolute path is "within" the root prefix; substituting
        // means prepending `to` (unless `to` is also `/`).
        return if to == "/" {
            Some(path.to_owned())
        } else {
            Some(join_abs(to, path))
        };
    }
    let rest = path.strip_prefix(from)?;
    if to == "/" {
        Some(if rest.is_empty() {
            "/".to_owned()
        } else {
            rest.to_owned()
        })
    } else {
        Some(format!("{to}{rest}"))
    }
}

fn join_abs(base: &str, rest: &str) -> String {
    if base == "/" {
        return normalize(rest);
    }
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        normalize_abs(base)
    } else {
        normalize(&format!("{base}/{rest}"))
    }
}

fn validate_no_escape(normalized: &str, ctx: ValidationContext) -> GatewayResult<()> {
    if !normalized.starts_with('/') {
        return Err(GatewayError::SecurityViolation(format!(
            "{ctx}: path must be absolute, got {normalized:?}"
        )));
    }
    Ok(())
}

fn normalize_abs(p: &str) -> String {
    let n = normalize(p);
    if n.starts_with('/') {
        n
    } else {
        format!("/{n}")
    }
}

/// Collapse `.`, `..`, and duplicate `/` in an absolute path, without
/// touching the filesystem. A `..` that would climb above the root is
/// dropped (it cannot escape further than `/`), which is what lets
/// [`Translator::validate_within_bounds`] reliably detect escape attempts:
/// any leftover ambiguity after normalization means "does not resolve
/// inside the bound", never "resolves outside unnoticed".
pub fn normalize(p: &str) -> String {
    let is_abs = p.starts_with('/');
    // Most resource paths this gateway sees have a handful of components;
    // a small inline buffer keeps the common case off the heap entirely,
    // the same trade-off the teacher makes for its own per-request buffers.
    let mut stack: SmallVec<[&str; 8]> = SmallVec::new();
    for component in p.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() && !is_abs {
                    stack.push("..");
                }
            }
            c => stack.push(c),
        }
    }
    let joined = stack.join("/");
    if is_abs {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_owned()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> Translator {
        Translator::new("/tmp/j", "/tmp/j", "/volumes/vol")
    }

    #[test]
    fn to_chroot_root_variants() {
        let t = translator();
        assert_eq!(t.to_chroot("/").unwrap(), ".");
        assert_eq!(t.to_chroot("").unwrap(), ".");
    }

    #[test]
    fn to_chroot_strips_one_leading_slash() {
        let t = translator();
        assert_eq!(t.to_chroot("/a/b.txt").unwrap(), "a/b.txt");
    }

    #[test]
    fn from_chroot_root_variants() {
        let t = translator();
        assert_eq!(t.from_chroot("."), "/");
        assert_eq!(t.from_chroot("a/b.txt"), "/a/b.txt");
    }

    #[test]
    fn chroot_round_trip_property() {
        let t = translator();
        for p in ["/", "/a", "/a/b/c", "/a/b.txt"] {
            let cr = t.to_chroot(p).unwrap();
            assert_eq!(t.from_chroot(&cr), p, "round trip failed for {p}");
        }
    }

    #[test]
    fn user_to_volume_basic() {
        let t = translator();
        assert_eq!(t.user_to_volume("/a/b.txt").unwrap(), "/volumes/vol/a/b.txt");
        assert_eq!(t.user_to_volume("/").unwrap(), "/volumes/vol");
    }

    #[test]
    fn volume_to_user_basic() {
        let t = translator();
        assert_eq!(
            t.volume_to_user("/volumes/vol/a/b.txt").unwrap(),
            "/a/b.txt"
        );
        assert_eq!(t.volume_to_user("/volumes/vol").unwrap(), "/");
    }

    #[test]
    fn volume_round_trip_property() {
        let t = translator();
        for v in [
            "/volumes/vol",
            "/volumes/vol/a",
            "/volumes/vol/a/b/c.txt",
        ] {
            let user = t.volume_to_user(v).unwrap();
            let back = t.user_to_volume(&user).unwrap();
            assert_eq!(back, v, "round trip failed for {v}");
        }
    }

    #[test]
    fn rejects_dotdot_escape() {
        let t = translator();
        assert!(t.validate_within_bounds("/volumes/vol/../../etc", ValidationContext::UserPath).is_err());
    }

    #[test]
    fn rejects_sibling_prefix_confusion() {
        let t = translator();
        // `/volumes/volx` is not a descendant of `/volumes/vol` despite the
        // shared textual prefix.
        assert!(t
            .validate_within_bounds("/volumes/volx/x", ValidationContext::UserPath)
            .is_err());
    }

    #[test]
    fn accepts_exact_prefix() {
        let t = translator();
        assert!(t
            .validate_within_bounds("/volumes/vol", ValidationContext::UserPath)
            .is_ok());
    }

    #[test]
    fn root_prefix_accepts_everything_absolute() {
        let t = Translator::new("/tmp/j", "/tmp/j", "/");
        assert!(t.validate_within_bounds("/anything/at/all", ValidationContext::UserPath).is_ok());
    }

    #[test]
    fn normalize_collapses_dot_and_dotdot() {
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("/a//b///c"), "/a/b/c");
        assert_eq!(normalize("/../../etc"), "/etc");
    }
}
