//! CephFS storage gateway core.
//!
//! Wires the five components together: a [`MountDescriptor`] loaded from a
//! single fstab line names the cluster mount; a [`ChrootCapability`] anchors
//! every filesystem syscall to it; a [`Translator`] converts between the
//! external, chroot-relative, and cluster-volume path coordinates a request
//! passes through; a [`pool::ThreadPool`] dispatches each call onto the
//! worker impersonating its caller's uid/gid; and an optional
//! [`resolver::InodeResolver`] turns an opaque inode number back into a
//! path when an administrative connection is available. [`gateway::Gateway`]
//! is the facade a caller actually drives; [`open`] builds one from a
//! [`GatewayConfig`].

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

pub mod chroot;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mount;
pub mod path;
pub mod pool;
pub mod resolver;
mod xattr;

pub use chroot::ChrootCapability;
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gateway::grant::Grant;
pub use gateway::lock::{Lock, LockIdentity, LockKind, LockRequest};
pub use gateway::{FileKind, Gateway, Owner, PermissionSet, Reference, ResourceInfo, UploadOptions, UploadOutcome};
pub use mount::MountDescriptor;
pub use path::Translator;
pub use pool::{CancelToken, Capability, UserIdentity};
pub use resolver::{AdminTransport, InodeResolver};

/// Build a [`Gateway`] from `config`, identifying itself as `storage_id`.
///
/// `admin_transport` is the seam for the RPC connection an
/// [`resolver::InodeResolver`] needs; pass `None` when no admin connection
/// could be established at startup. [`gateway::Gateway::get_path_by_id`] then
/// returns [`GatewayError::NotSupported`] on every call instead of the whole
/// gateway refusing to start.
///
/// `config.allow_local_mode` substitutes a plain local directory (named by
/// the `NCEPH_TEST_CHROOT_DIR` environment variable) for a real cluster
/// mount, skipping fstab discovery entirely. It exists for test and
/// development environments with no cluster to mount against.
pub fn open(
    config: GatewayConfig,
    storage_id: impl Into<String>,
    admin_transport: Option<Arc<dyn AdminTransport>>,
) -> GatewayResult<Gateway> {
    let storage_id = storage_id.into();

    if config.allow_local_mode {
        let chroot_dir = std::env::var(config::CHROOT_DIR_OVERRIDE_ENV)
            .map(PathBuf::from)
            .map_err(|_| {
                GatewayError::ConfigInvalid(format!(
                    "allow_local_mode requires {} to be set",
                    config::CHROOT_DIR_OVERRIDE_ENV
                ))
            })?;
        info!("opening nceph gateway {storage_id:?} in local mode at {}", chroot_dir.display());

        let chroot = Arc::new(ChrootCapability::open(&chroot_dir)?);
        let mount_point = chroot_dir.to_string_lossy().into_owned();
        let translator = Translator::new(mount_point.clone(), mount_point, "/");
        let resolver = admin_transport.map(|t| InodeResolver::new(t, translator.clone()));
        return Ok(Gateway::new(chroot, translator, config, storage_id, resolver));
    }

    let fstabentry = config.fstabentry.clone().ok_or_else(|| {
        GatewayError::ConfigInvalid("fstabentry is required outside of local mode".into())
    })?;
    let descriptor = MountDescriptor::parse_fstab_line(&fstabentry)?;
    let chroot_dir = descriptor.chroot_dir();
    info!(
        "opening nceph gateway {storage_id:?} for mount {} at {}",
        descriptor.cluster_volume_prefix,
        chroot_dir.display()
    );

    let chroot = Arc::new(ChrootCapability::open(&chroot_dir)?);
    let translator = Translator::new(
        chroot_dir.to_string_lossy().into_owned(),
        descriptor.local_mount_point.to_string_lossy().into_owned(),
        descriptor.cluster_volume_prefix.clone(),
    );
    let resolver = admin_transport.map(|t| InodeResolver::new(t, translator.clone()));
    Ok(Gateway::new(chroot, translator, config, storage_id, resolver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct NoopTransport;
    impl AdminTransport for NoopTransport {
        fn send_cluster_command(&self, _command: &serde_json::Value) -> GatewayResult<serde_json::Value> {
            Err(GatewayError::Unavailable("no admin connection in tests".into()))
        }
        fn send_mds_command(&self, _mds_name: &str, _command: &serde_json::Value) -> GatewayResult<serde_json::Value> {
            Err(GatewayError::Unavailable("no admin connection in tests".into()))
        }
    }

    #[test]
    #[serial]
    fn local_mode_requires_the_override_env_var() {
        std::env::remove_var(config::CHROOT_DIR_OVERRIDE_ENV);
        let result = open(GatewayConfig::for_local_mode(), "storage1", None);
        assert!(matches!(result, Err(GatewayError::ConfigInvalid(_))));
    }

    #[test]
    #[serial]
    fn local_mode_opens_against_the_override_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(config::CHROOT_DIR_OVERRIDE_ENV, dir.path());
        let gateway = open(GatewayConfig::for_local_mode(), "storage1", None).unwrap();
        gateway.shutdown();
        std::env::remove_var(config::CHROOT_DIR_OVERRIDE_ENV);
    }

    #[test]
    #[serial]
    fn local_mode_with_admin_transport_enables_get_path_by_id() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(config::CHROOT_DIR_OVERRIDE_ENV, dir.path());
        let gateway = open(
            GatewayConfig::for_local_mode(),
            "storage1",
            Some(Arc::new(NoopTransport) as Arc<dyn AdminTransport>),
        )
        .unwrap();
        assert!(matches!(
            gateway.get_path_by_id("1"),
            Err(GatewayError::Unavailable(_))
        ));
        gateway.shutdown();
        std::env::remove_var(config::CHROOT_DIR_OVERRIDE_ENV);
    }

    #[test]
    fn non_local_mode_requires_fstabentry() {
        let result = open(GatewayConfig::default(), "storage1", None);
        assert!(matches!(result, Err(GatewayError::ConfigInvalid(_))));
    }
}
