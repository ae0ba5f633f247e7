//! Mount Descriptor Loader.
//!
//! Parses a single fstab-format line describing the cluster mount and
//! derives the attributes the rest of the gateway needs. Mirrors the
//! teacher's `mount_options::parse_options_from_args`: a pure, allocation-only
//! parser over whitespace/comma-separated tokens, kept free of any syscalls
//! so it can be exhaustively unit tested.

use std::path::{Path, PathBuf};

use crate::error::{GatewayError, GatewayResult};

/// The filesystem type recognized by the loader (`man mount.fuse`-style
/// `fstype` column, but naming the cluster filesystem instead).
pub const FSTYPE: &str = "ceph";

/// Immutable description of the cluster mount, derived once at startup from
/// a single fstab line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDescriptor {
    /// Monitor host (left of the first `:` in the fstab device field).
    pub mon_host: String,
    /// Monitor port, if the device field specified one.
    pub mon_port: Option<String>,
    /// Path in RADOS/cluster-canonical coordinates, e.g. `/volumes/group/subvol`.
    pub cluster_volume_prefix: String,
    /// Local path where the kernel mount is rooted.
    pub local_mount_point: PathBuf,
    /// Client principal (`name=` mount option).
    pub client_name: String,
    /// Path to the Ceph configuration file.
    pub config_file: PathBuf,
    /// Path to the client keyring file.
    pub keyring_file: PathBuf,
    /// Path to the client secret file (`secretfile=` mount option).
    pub secret_file: PathBuf,
}

impl MountDescriptor {
    /// Parse a single fstab-syntax line:
    /// `DEVICE MOUNTPOINT FSTYPE OPTIONS DUMP PASS`.
    ///
    /// `DUMP`/`PASS` are optional; only the first four whitespace-separated
    /// fields are required. Fails with [`GatewayError::ConfigInvalid`] if
    /// fewer than four fields are present, `FSTYPE` is not [`FSTYPE`], or
    /// required options are missing.
    pub fn parse_fstab_line(line: &str) -> GatewayResult<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(GatewayError::ConfigInvalid(format!(
                "expected at least 4 whitespace-separated fields, got {}",
                fields.len()
            )));
        }
        let device = fields[0];
        let mountpoint = fields[1];
        let fstype = fields[2];
        let options = fields[3];

        if fstype != FSTYPE {
            return Err(GatewayError::ConfigInvalid(format!(
                "unsupported filesystem type {fstype:?}, expected {FSTYPE:?}"
            )));
        }

        let (mon_host, mon_port, cluster_volume_prefix) = parse_device(device)?;
        let opts = parse_options(options)?;

        let client_name = opts
            .name
            .ok_or_else(|| GatewayError::ConfigInvalid("missing required option name=".into()))?;
        let secret_file = opts.secretfile.ok_or_else(|| {
            GatewayError::ConfigInvalid("missing required option secretfile=".into())
        })?;

        let (config_file, keyring_file) = derive_config_paths(&secret_file, &client_name);

        Ok(MountDescriptor {
            mon_host,
            mon_port,
            cluster_volume_prefix,
            local_mount_point: PathBuf::from(mountpoint),
            client_name,
            config_file,
            keyring_file,
            secret_file: PathBuf::from(secret_file),
        })
    }

    /// Best-effort auto-discovery: given the `mon host` line read from a
    /// Ceph config document and the full contents of an fstab file, find the
    /// row whose device field names one of those monitor hosts and parse it.
    ///
    /// Absence of a match is `ConfigInvalid`, not a panic, since
    /// auto-discovery is inherently best-effort.
    pub fn discover(mon_hosts: &[String], fstab_contents: &str) -> GatewayResult<Self> {
        for line in fstab_contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some(device) = trimmed.split_whitespace().next() else {
                continue;
            };
            let Some((host, _)) = device.split_once(':') else {
                continue;
            };
            if mon_hosts.iter().any(|h| h == host) {
                return Self::parse_fstab_line(trimmed);
            }
        }
        Err(GatewayError::ConfigInvalid(
            "no fstab row matched any configured mon host".into(),
        ))
    }

    /// The chroot directory to bind the pool's filesystem capability to:
    /// `local_mount_point`, unless overridden by the
    /// `NCEPH_TEST_CHROOT_DIR` environment variable.
    pub fn chroot_dir(&self) -> PathBuf {
        if let Ok(over) = std::env::var(crate::config::CHROOT_DIR_OVERRIDE_ENV) {
            return PathBuf::from(over);
        }
        self.local_mount_point.clone()
    }
}

struct MountOptions {
    name: Option<String>,
    secretfile: Option<String>,
}

fn parse_options(raw: &str) -> GatewayResult<MountOptions> {
    let mut name = None;
    let mut secretfile = None;
    for kv in raw.split(',') {
        if let Some((k, v)) = kv.split_once('=') {
            match k {
                "name" => name = Some(v.to_owned()),
                "secretfile" => secretfile = Some(v.to_owned()),
                _ => {}
            }
        }
    }
    Ok(MountOptions { name, secretfile })
}

/// Split `DEVICE` on `:` into at most three parts: host, port, path.
fn parse_device(device: &str) -> GatewayResult<(String, Option<String>, String)> {
    let parts: Vec<&str> = device.splitn(3, ':').collect();
    match parts.as_slice() {
        [host, path] => Ok((normalize_host(host), None, (*path).to_owned())),
        [host, port, path] => Ok((normalize_host(host), Some((*port).to_owned()), (*path).to_owned())),
        _ => Err(GatewayError::ConfigInvalid(format!(
            "device field {device:?} must split into host:path or host:port:path"
        ))),
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[').trim_end_matches(']').to_owned()
}

/// Derive the config-file and keyring paths from the basename of the secret
/// file: a basename with three or more dot-separated components names a
/// cluster tag in its first component; otherwise fall back to the default
/// `ceph` cluster name.
fn derive_config_paths(secret_file: &str, client_name: &str) -> (PathBuf, PathBuf) {
    let basename = Path::new(secret_file)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(secret_file);
    let components: Vec<&str> = basename.split('.').collect();

    let tag = if components.len() >= 3 {
        components[0]
    } else {
        "ceph"
    };

    let config_file = PathBuf::from(format!("/etc/ceph/{tag}.conf"));
    let keyring_file = PathBuf::from(format!("/etc/ceph/{tag}.client.{client_name}.keyring"));
    (config_file, keyring_file)
}
