//! Filesystem Gateway (component D).
//!
//! Implements the high-level storage operations as chroot-confined
//! syscalls executed on the per-user thread pool (component C). Every
//! mutating or reading operation follows the same shape: resolve a
//! [`Reference`] to a chroot-relative path (via [`path::Translator`] or, for
//! an id, via [`resolver::InodeResolver`]), then dispatch a closure through
//! [`pool::ThreadPool::submit`] that performs the actual syscalls against a
//! [`chroot::ChrootCapability`] under the caller's impersonated credentials.
//!
//! [`path::Translator`]: crate::path::Translator
//! [`resolver::InodeResolver`]: crate::resolver::InodeResolver
//! [`chroot::ChrootCapability`]: crate::chroot::ChrootCapability
//! [`pool::ThreadPool::submit`]: crate::pool::ThreadPool::submit

pub mod grant;
pub mod lock;
pub mod quota;

pub use grant::Grant;
pub use lock::{Lock, LockIdentity, LockKind, LockRequest};

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chroot::ChrootCapability;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::path::Translator;
use crate::pool::{CancelToken, ThreadPool, UserIdentity};
use crate::resolver::InodeResolver;

/// Reserved xattr prefixes that are never surfaced in a
/// [`ResourceInfo::metadata`] map; they belong to grants, locks, and quota.
const RESERVED_XATTR_PREFIXES: &[&str] = &[
    grant::GRANT_XATTR_PREFIX,
    lock::LOCK_XATTR_KEY,
    quota::QUOTA_XATTR_KEY,
    "user.nceph.",
];

/// What every gateway operation takes to name its target: either an
/// external path, or a `(storage_id, opaque_id)` pair resolved through the
/// Inode Resolver. The `storage_id` carried by the `Id` variant identifies
/// which gateway a caller believes it is addressing; the authoritative one
/// used to build a returned [`ResourceInfo::resource_id`] is always the
/// gateway's own (see [`Gateway::new`]).
#[derive(Debug, Clone)]
pub enum Reference {
    Path(String),
    Id { storage_id: String, opaque_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// The POSIX owner of a resource, read from `stat`, not from the request's
/// identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// The fixed capability bitmap every [`ResourceInfo`] carries: informational
/// only, since actual authorization is enforced by POSIX on the worker
/// thread under its impersonated uid/gid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub stat: bool,
    pub read: bool,
    pub write: bool,
    pub list: bool,
    pub create: bool,
    pub rename_or_move: bool,
    pub delete: bool,
    pub add_grant: bool,
    pub remove_grant: bool,
}

/// The one capability set every resource is given; revisions and recycle
/// operations are never granted, matching `get_home`/`create_home` being
/// unsupported outright.
pub const fn fixed_permission_set() -> PermissionSet {
    PermissionSet {
        stat: true,
        read: true,
        write: true,
        list: true,
        create: true,
        rename_or_move: true,
        delete: true,
        add_grant: true,
        remove_grant: true,
    }
}

/// The semantic type returned by metadata operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub kind: FileKind,
    pub resource_id: (String, String),
    pub path: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub symlink_target: Option<String>,
    pub mime_type: Option<String>,
    pub permissions: PermissionSet,
    pub owner: Owner,
    pub metadata: HashMap<String, String>,
}

/// Options accepted by [`Gateway::upload`]. Computing a checksum is opt-in
/// so it never changes the "create-or-truncate, copy-to-completion"
/// contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    pub compute_checksum: bool,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub bytes_written: u64,
    pub checksum: Option<String>,
}

/// Wraps a `Write` destination, accumulating a running SHA-256 digest of
/// everything written through it. Used only when a caller opts into
/// [`UploadOptions::compute_checksum`], so the plain upload path never pays
/// for hashing it does not need.
struct DigestingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> DigestingWriter<W> {
    fn new(inner: W) -> Self {
        DigestingWriter {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn inner_ref(&self) -> &W {
        &self.inner
    }

    fn finish_hex(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The high-level filesystem operations, dispatched through a per-user
/// [`ThreadPool`] onto a shared [`ChrootCapability`].
pub struct Gateway {
    pool: ThreadPool,
    translator: Translator,
    config: GatewayConfig,
    storage_id: String,
    resolver: Option<InodeResolver>,
    /// Held-until-unlock table for advisory locks: the file descriptor a
    /// `set_lock` opened and `flock`'d stays alive here so the kernel-level
    /// lock persists across calls, closing only in `unlock`.
    locks: Mutex<HashMap<String, File>>,
}

impl Gateway {
    /// Build a gateway bound to `chroot`, translating through `translator`,
    /// identifying itself as `storage_id` in every returned
    /// [`ResourceInfo::resource_id`]. `resolver` is `None` when the admin
    /// connection failed at startup: `get_path_by_id` then returns
    /// `NotSupported` rather than the process refusing to start.
    pub fn new(
        chroot: Arc<ChrootCapability>,
        translator: Translator,
        config: GatewayConfig,
        storage_id: impl Into<String>,
        resolver: Option<InodeResolver>,
    ) -> Self {
        let pool = ThreadPool::new(chroot, config.clone());
        Gateway {
            pool,
            translator,
            config,
            storage_id: storage_id.into(),
            resolver,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The startup privilege-verification result.
    pub fn capability(&self) -> crate::pool::Capability {
        self.pool.capability()
    }

    fn resolve(&self, reference: &Reference) -> GatewayResult<(String, String)> {
        match reference {
            Reference::Path(p) => {
                let rel = self.translator.to_chroot(p)?;
                let ext = self.translator.from_chroot(&rel);
                Ok((rel, ext))
            }
            Reference::Id { opaque_id, .. } => {
                let resolver = self.resolver.as_ref().ok_or_else(|| {
                    GatewayError::NotSupported(
                        "inode resolution requires an admin connection".into(),
                    )
                })?;
                let ext = resolver.get_path_by_id(opaque_id)?;
                let rel = self.translator.to_chroot(&ext)?;
                Ok((rel, ext))
            }
        }
    }

    /// Resolve an opaque inode number back to an external path, available
    /// whenever an admin connection was supplied at construction.
    pub fn get_path_by_id(&self, opaque_id: &str) -> GatewayResult<String> {
        self.resolver
            .as_ref()
            .ok_or_else(|| {
                GatewayError::NotSupported("inode resolution requires an admin connection".into())
            })?
            .get_path_by_id(opaque_id)
    }

    pub fn get_metadata(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        keys: &[String],
    ) -> GatewayResult<ResourceInfo> {
        let (rel, ext) = self.resolve(reference)?;
        let storage_id = self.storage_id.clone();
        let keys = keys.to_vec();
        self.pool.submit(identity, cancel, move |chroot| {
            build_resource_info(chroot, &storage_id, &rel, &ext, &keys)
        })
    }

    pub fn list_folder(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        keys: &[String],
    ) -> GatewayResult<Vec<ResourceInfo>> {
        let (rel, _ext) = self.resolve(reference)?;
        let storage_id = self.storage_id.clone();
        let uploads = self.config.uploads.clone();
        let keys = keys.to_vec();
        let translator = self.translator.clone();
        self.pool.submit(identity, cancel, move |chroot| {
            let mut out = Vec::new();
            for name in chroot.read_dir_beneath(&rel)? {
                if name == uploads {
                    continue;
                }
                let child_rel = if rel == "." {
                    name
                } else {
                    format!("{rel}/{name}")
                };
                let child_ext = translator.from_chroot(&child_rel);
                out.push(build_resource_info(
                    chroot,
                    &storage_id,
                    &child_rel,
                    &child_ext,
                    &keys,
                )?);
            }
            Ok(out)
        })
    }

    /// Opens the target for read and returns the handle for the caller to
    /// stream from and close; the open itself runs under the impersonated
    /// identity, but the streaming that follows is the caller's concern.
    /// Only the open and close are dispatched onto the worker, not any
    /// later read the caller performs on the handle.
    pub fn download(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
    ) -> GatewayResult<File> {
        let (rel, _ext) = self.resolve(reference)?;
        self.pool
            .submit(identity, cancel, move |chroot| chroot.open_beneath(&rel, libc::O_RDONLY, 0))
    }

    /// Creates parent directories if missing, then copies `reader` to
    /// completion into a freshly truncated file. On a mid-copy I/O error the
    /// half-written file is removed rather than left at an undefined
    /// length.
    pub fn upload<R>(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        mut reader: R,
        options: UploadOptions,
    ) -> GatewayResult<UploadOutcome>
    where
        R: Read + Send + 'static,
    {
        let (rel, _ext) = self.resolve(reference)?;
        let dir_perms = self.config.dir_perms;
        let file_perms = self.config.file_perms;
        let parent = parent_of(&rel);
        self.pool.submit(identity, cancel, move |chroot| {
            chroot.create_dir_all_beneath(&parent, dir_perms)?;
            let file =
                chroot.open_beneath(&rel, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, file_perms)?;

            let copy_result: io::Result<(u64, Option<String>)> = if options.compute_checksum {
                let mut digesting = DigestingWriter::new(file);
                match io::copy(&mut reader, &mut digesting) {
                    Ok(n) => {
                        let digest = digesting.finish_hex();
                        crate::xattr::fset(
                            digesting.inner_ref(),
                            "user.nceph.checksum",
                            digest.as_bytes(),
                        )
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                        Ok((n, Some(digest)))
                    }
                    Err(e) => Err(e),
                }
            } else {
                let mut file = file;
                io::copy(&mut reader, &mut file).map(|n| (n, None))
            };

            match copy_result {
                Ok((bytes_written, checksum)) => Ok(UploadOutcome {
                    bytes_written,
                    checksum,
                }),
                Err(e) => {
                    let _ = chroot.remove_file_beneath(&rel);
                    Err(GatewayError::io_context(
                        "upload",
                        &std::path::PathBuf::from(&rel),
                        e,
                    ))
                }
            }
        })
    }

    pub fn create_dir(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
    ) -> GatewayResult<()> {
        let (rel, _ext) = self.resolve(reference)?;
        let dir_perms = self.config.dir_perms;
        self.pool
            .submit(identity, cancel, move |chroot| chroot.create_dir_all_beneath(&rel, dir_perms))
    }

    pub fn touch_file(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
    ) -> GatewayResult<()> {
        let (rel, _ext) = self.resolve(reference)?;
        let dir_perms = self.config.dir_perms;
        let file_perms = self.config.file_perms;
        let parent = parent_of(&rel);
        self.pool.submit(identity, cancel, move |chroot| {
            chroot.create_dir_all_beneath(&parent, dir_perms)?;
            chroot.open_beneath(&rel, libc::O_WRONLY | libc::O_CREAT, file_perms)?;
            Ok(())
        })
    }

    /// Named `mv`, not `move`, since the latter is a reserved keyword.
    pub fn mv(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        src: &Reference,
        dst: &Reference,
    ) -> GatewayResult<()> {
        let (src_rel, _) = self.resolve(src)?;
        let (dst_rel, _) = self.resolve(dst)?;
        let dir_perms = self.config.dir_perms;
        let dst_parent = parent_of(&dst_rel);
        self.pool.submit(identity, cancel, move |chroot| {
            chroot.create_dir_all_beneath(&dst_parent, dir_perms)?;
            chroot.rename_beneath(&src_rel, &dst_rel)
        })
    }

    pub fn delete(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
    ) -> GatewayResult<()> {
        let (rel, _ext) = self.resolve(reference)?;
        self.pool
            .submit(identity, cancel, move |chroot| chroot.delete_recursive_beneath(&rel))
    }

    pub fn set_lock(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        request: LockRequest,
    ) -> GatewayResult<Lock> {
        let (rel, _ext) = self.resolve(reference)?;
        let file_perms = self.config.file_perms;
        let rel_for_job = rel.clone();
        let request_for_job = request.clone();
        let file = self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel_for_job, libc::O_RDWR | libc::O_CREAT, file_perms)?;
            let op = request_for_job.kind.flock_operation() | libc::LOCK_NB;
            let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                return Err(if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                    GatewayError::Locked(format!("{rel_for_job} is already locked"))
                } else {
                    GatewayError::internal("flock", err)
                });
            }
            let payload = Lock::from(request_for_job.clone());
            let encoded = serde_json::to_vec(&payload)?;
            crate::xattr::fset(&file, lock::LOCK_XATTR_KEY, &encoded)?;
            Ok(file)
        })?;

        let lock = Lock::from(request);
        self.locks.lock().unwrap().insert(rel, file);
        Ok(lock)
    }

    pub fn get_lock(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
    ) -> GatewayResult<Lock> {
        let (rel, _ext) = self.resolve(reference)?;
        let rel_for_job = rel.clone();
        let result = self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel_for_job, libc::O_RDONLY, 0)?;
            let raw = crate::xattr::fget(&file, lock::LOCK_XATTR_KEY)?
                .ok_or_else(|| GatewayError::NotFound(format!("no lock on {rel_for_job}")))?;
            let lock: Lock = serde_json::from_slice(&raw)?;
            if lock.is_expired(Utc::now()) {
                crate::xattr::fremove(&file, lock::LOCK_XATTR_KEY)?;
                return Err(GatewayError::NotFound(format!("lock on {rel_for_job} expired")));
            }
            Ok(lock)
        });
        if matches!(result, Err(GatewayError::NotFound(_))) {
            // Clearing an expired payload must also drop the fd this
            // resource's `set_lock` kept alive, or the kernel-level flock
            // outlives the payload that advertised it and every later
            // `set_lock` on this path spuriously observes `Locked` forever.
            self.locks.lock().unwrap().remove(&rel);
        }
        result
    }

    pub fn refresh_lock(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        new: LockRequest,
        existing_id: Option<String>,
    ) -> GatewayResult<Lock> {
        let (rel, _ext) = self.resolve(reference)?;
        let new_for_job = new.clone();
        self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel, libc::O_RDONLY, 0)?;
            let raw = crate::xattr::fget(&file, lock::LOCK_XATTR_KEY)?
                .ok_or_else(|| GatewayError::BadRequest(format!("no lock to refresh on {rel}")))?;
            let current: Lock = serde_json::from_slice(&raw)?;
            let who = LockIdentity {
                id: existing_id.clone(),
                holder_user: new_for_job.holder_user.clone(),
                holder_app: new_for_job.holder_app.clone(),
            };
            lock::require_holder_match(&current, &who)?;
            let replacement = Lock::from(new_for_job.clone());
            let encoded = serde_json::to_vec(&replacement)?;
            crate::xattr::fset(&file, lock::LOCK_XATTR_KEY, &encoded)?;
            Ok(replacement)
        })
    }

    pub fn unlock(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        who: LockIdentity,
    ) -> GatewayResult<()> {
        let (rel, _ext) = self.resolve(reference)?;
        let rel_for_job = rel.clone();
        self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel_for_job, libc::O_RDONLY, 0)?;
            let raw = crate::xattr::fget(&file, lock::LOCK_XATTR_KEY)?.ok_or_else(|| {
                GatewayError::BadRequest(format!("no lock to release on {rel_for_job}"))
            })?;
            let current: Lock = serde_json::from_slice(&raw)?;
            lock::require_holder_match(&current, &who)?;
            crate::xattr::fremove(&file, lock::LOCK_XATTR_KEY)
        })?;
        self.locks.lock().unwrap().remove(&rel);
        Ok(())
    }

    pub fn add_grant(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        grant: Grant,
    ) -> GatewayResult<()> {
        self.write_grant(identity, cancel, reference, grant)
    }

    pub fn update_grant(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        grant: Grant,
    ) -> GatewayResult<()> {
        self.write_grant(identity, cancel, reference, grant)
    }

    fn write_grant(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        grant: Grant,
    ) -> GatewayResult<()> {
        let (rel, _ext) = self.resolve(reference)?;
        let key = grant::xattr_key(&grant.grantee_opaque);
        let encoded = grant::encode(&grant)?;
        self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel, libc::O_RDONLY, 0)?;
            crate::xattr::fset(&file, &key, &encoded)
        })
    }

    pub fn remove_grant(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        grantee_opaque: &str,
    ) -> GatewayResult<()> {
        self.delete_grant(identity, cancel, reference, grantee_opaque)
    }

    /// `deny_grant` deletes the grant record exactly like `remove_grant`;
    /// the distinction between an explicit deny and a plain removal belongs
    /// to the caller's business logic, not to xattr storage.
    pub fn deny_grant(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        grantee_opaque: &str,
    ) -> GatewayResult<()> {
        self.delete_grant(identity, cancel, reference, grantee_opaque)
    }

    fn delete_grant(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        grantee_opaque: &str,
    ) -> GatewayResult<()> {
        let (rel, _ext) = self.resolve(reference)?;
        let key = grant::xattr_key(grantee_opaque);
        self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel, libc::O_RDONLY, 0)?;
            crate::xattr::fremove(&file, &key)
        })
    }

    pub fn list_grants(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
    ) -> GatewayResult<Vec<Grant>> {
        let (rel, _ext) = self.resolve(reference)?;
        self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel, libc::O_RDONLY, 0)?;
            let mut grants = Vec::new();
            for name in crate::xattr::flist(&file)? {
                if !grant::is_grant_key(&name) {
                    continue;
                }
                if let Some(raw) = crate::xattr::fget(&file, &name)? {
                    if let Ok(g) = grant::decode(&raw) {
                        grants.push(g);
                    }
                }
            }
            Ok(grants)
        })
    }

    pub fn set_arbitrary_metadata(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        metadata: HashMap<String, String>,
    ) -> GatewayResult<()> {
        let (rel, _ext) = self.resolve(reference)?;
        self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel, libc::O_RDONLY, 0)?;
            for (k, v) in &metadata {
                crate::xattr::fset(&file, &ensure_user_prefix(k), v.as_bytes())?;
            }
            Ok(())
        })
    }

    pub fn unset_arbitrary_metadata(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
        keys: Vec<String>,
    ) -> GatewayResult<()> {
        let (rel, _ext) = self.resolve(reference)?;
        self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel, libc::O_RDONLY, 0)?;
            for k in &keys {
                crate::xattr::fremove(&file, &ensure_user_prefix(k))?;
            }
            Ok(())
        })
    }

    pub fn get_quota(
        &self,
        identity: &UserIdentity,
        cancel: &CancelToken,
        reference: &Reference,
    ) -> GatewayResult<(u64, u64)> {
        let (rel, _ext) = self.resolve(reference)?;
        let default_quota = self.config.user_quota_bytes;
        self.pool.submit(identity, cancel, move |chroot| {
            let file = chroot.open_beneath(&rel, libc::O_RDONLY, 0)?;
            let total = match crate::xattr::fget(&file, quota::QUOTA_XATTR_KEY)? {
                Some(raw) => String::from_utf8_lossy(&raw)
                    .trim()
                    .parse::<u64>()
                    .unwrap_or(default_quota),
                None => default_quota,
            };
            let used = quota::directory_size(chroot, &rel)?;
            Ok((total, used))
        })
    }

    /// Unsupported outright; no home-directory concept exists below this
    /// layer.
    pub fn get_home(&self, _identity: &UserIdentity, _cancel: &CancelToken) -> GatewayResult<ResourceInfo> {
        Err(GatewayError::NotSupported("get_home is not implemented".into()))
    }

    /// Unsupported outright; no home-directory concept exists below this
    /// layer.
    pub fn create_home(&self, _identity: &UserIdentity, _cancel: &CancelToken) -> GatewayResult<()> {
        Err(GatewayError::NotSupported("create_home is not implemented".into()))
    }

    /// Tears down the thread pool, dropping every held lock descriptor
    /// first so the kernel releases their advisory locks before the
    /// workers that opened them exit.
    pub fn shutdown(&self) {
        self.locks.lock().unwrap().clear();
        self.pool.shutdown();
    }
}

fn ensure_user_prefix(key: &str) -> String {
    if key.starts_with("user.") {
        key.to_owned()
    } else {
        format!("user.{key}")
    }
}

fn parent_of(rel: &str) -> String {
    match rel.rsplit_once('/') {
        Some((parent, _)) => parent.to_owned(),
        None => ".".to_owned(),
    }
}

fn build_resource_info(
    chroot: &ChrootCapability,
    storage_id: &str,
    rel: &str,
    ext_path: &str,
    keys: &[String],
) -> GatewayResult<ResourceInfo> {
    let meta = chroot.stat_beneath(rel)?;
    let file_type = meta.file_type();
    let kind = if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::File
    };

    let symlink_target = if kind == FileKind::Symlink {
        Some(chroot.readlink_beneath(rel)?)
    } else {
        None
    };
    let mime_type = if kind == FileKind::File {
        Some(mime_for_path(ext_path))
    } else {
        None
    };
    let mtime = DateTime::<Utc>::from(meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH));

    // A symlink's own xattrs are not read: the only way to open its
    // descriptor without following it is `O_NOFOLLOW`, which `open_beneath`
    // does not expose, so per-resource metadata on a symlink is left empty
    // rather than silently describing its target instead.
    let mut metadata = if kind == FileKind::Symlink {
        HashMap::new()
    } else {
        collect_metadata(chroot, rel, keys)?
    };
    metadata.insert("inode".to_owned(), meta.ino().to_string());
    metadata.insert("device".to_owned(), meta.dev().to_string());

    Ok(ResourceInfo {
        kind,
        resource_id: (storage_id.to_owned(), meta.ino().to_string()),
        path: ext_path.to_owned(),
        size: meta.len(),
        mtime,
        symlink_target,
        mime_type,
        permissions: fixed_permission_set(),
        owner: Owner {
            uid: meta.uid(),
            gid: meta.gid(),
        },
        metadata,
    })
}

fn collect_metadata(
    chroot: &ChrootCapability,
    rel: &str,
    keys: &[String],
) -> GatewayResult<HashMap<String, String>> {
    let file = chroot.open_beneath(rel, libc::O_RDONLY, 0)?;
    let mut map = HashMap::new();
    for name in crate::xattr::flist(&file)? {
        if !name.starts_with("user.") {
            continue;
        }
        if RESERVED_XATTR_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        if !keys.is_empty() && !keys.iter().any(|k| k == &name || format!("user.{k}") == name) {
            continue;
        }
        if let Some(raw) = crate::xattr::fget(&file, &name)? {
            map.insert(name, String::from_utf8_lossy(&raw).into_owned());
        }
    }
    Ok(map)
}

/// Extension-based MIME detection; unrecognized or absent extensions fall
/// back to the generic octet-stream type rather than guessing from content.
fn mime_for_path(path: &str) -> String {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "js" => "application/javascript",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
    .to_owned()
}
