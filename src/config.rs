//! Gateway configuration surface.
//!
//! The core never loads configuration itself (that is the surrounding
//! registry plumbing's job); it only defines the typed, validated shape of
//! the keys it consumes, a destination struct rather than a parser itself.

use serde::{Deserialize, Serialize};

/// Default idle time-to-live for a per-user worker thread (5 minutes).
pub const DEFAULT_THREAD_TTL_SECS: u64 = 5 * 60;

/// Default sweeper scan period (1 minute).
pub const DEFAULT_SWEEPER_PERIOD_SECS: u64 = 60;

/// Default directory mode, `0755`.
pub const DEFAULT_DIR_PERMS: u32 = 0o755;

/// Default file mode, `0644`.
pub const DEFAULT_FILE_PERMS: u32 = 0o644;

/// Default synthetic "nobody" identity, matching the conventional overflow
/// uid/gid on Linux.
pub const DEFAULT_NOBODY_ID: u32 = 65534;

/// Environment variable that overrides the chroot directory at startup, for
/// test environments that have no real cluster mount.
pub const CHROOT_DIR_OVERRIDE_ENV: &str = "NCEPH_TEST_CHROOT_DIR";

/// Recognized configuration keys for the gateway core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Single fstab line describing the cluster mount. Drives the mount
    /// descriptor loader. `None` when the caller intends to rely on
    /// auto-discovery or `allow_local_mode`.
    pub fstabentry: Option<String>,

    /// Enables unit-test mode: a local directory stands in for a real
    /// cluster mount, and no admin connection is attempted.
    pub allow_local_mode: bool,

    /// Subdirectory name used as the upload-folder hidden entry.
    pub uploads: String,

    /// Numeric mode applied to directories created by the gateway.
    pub dir_perms: u32,

    /// Numeric mode applied to files created by the gateway.
    pub file_perms: u32,

    /// Default quota (bytes) when no `user.quota.max_bytes` xattr override
    /// is present.
    pub user_quota_bytes: u64,

    /// Fallback uid used for the synthetic "nobody" identity.
    pub nobody_uid: u32,

    /// Fallback gid used for the synthetic "nobody" identity.
    pub nobody_gid: u32,

    /// Idle time-to-live, in seconds, before the sweeper reclaims a worker.
    pub thread_ttl_secs: u64,

    /// Sweeper scan period, in seconds.
    pub sweeper_period_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            fstabentry: None,
            allow_local_mode: false,
            uploads: ".nceph-uploads".to_owned(),
            dir_perms: DEFAULT_DIR_PERMS,
            file_perms: DEFAULT_FILE_PERMS,
            user_quota_bytes: 0,
            nobody_uid: DEFAULT_NOBODY_ID,
            nobody_gid: DEFAULT_NOBODY_ID,
            thread_ttl_secs: DEFAULT_THREAD_TTL_SECS,
            sweeper_period_secs: DEFAULT_SWEEPER_PERIOD_SECS,
        }
    }
}

impl GatewayConfig {
    /// A configuration suitable for `allow_local_mode` tests: short TTLs so
    /// sweeper behavior is observable within a test's timeout.
    pub fn for_local_mode() -> Self {
        Self {
            allow_local_mode: true,
            thread_ttl_secs: 2,
            sweeper_period_secs: 1,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.dir_perms, 0o755);
        assert_eq!(cfg.file_perms, 0o644);
        assert_eq!(cfg.nobody_uid, 65534);
        assert_eq!(cfg.nobody_gid, 65534);
        assert_eq!(cfg.thread_ttl_secs, 300);
        assert_eq!(cfg.sweeper_period_secs, 60);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = GatewayConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.uploads, back.uploads);
    }
}
