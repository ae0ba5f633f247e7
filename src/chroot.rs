//! Chroot Capability: a directory-anchored filesystem handle that refuses
//! to resolve any path outside of it.
//!
//! `nix` does not wrap `openat2(2)`, so this calls it directly through
//! `libc::syscall`, the same way the `lisy` crate's `open::OpenHow` does:
//! a `struct open_how` built in Rust, passed by reference to the raw
//! syscall number, with `RESOLVE_BENEATH` set so every lookup is confined
//! to the directory file descriptor regardless of `..` components or
//! symlinks planted inside the jail.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::error::{GatewayError, GatewayResult};

/// Kernel `struct open_how`, as consumed by `openat2(2)`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct OpenHow {
    flags: u64,
    mode: u64,
    resolve: u64,
}

/// A directory file descriptor that all path resolution inside the gateway
/// is anchored to. Every lookup carries `RESOLVE_BENEATH`, so the kernel
/// itself rejects any component that would step outside the directory this
/// capability was opened on, independent of and in addition to the
/// string-level checks in [`crate::path::Translator`].
pub struct ChrootCapability {
    dir: OwnedFd,
}

impl ChrootCapability {
    /// Open `root` as the anchor directory. `root` is typically absolute
    /// (a tempdir or a mount point), and `RESOLVE_BENEATH` rejects an
    /// absolute `pathname` outright (openat2(2)), so the anchor itself is
    /// opened without it — confinement starts at the first `*_beneath`
    /// lookup, which always resolves a chroot-relative path against this
    /// descriptor.
    pub fn open(root: &Path) -> GatewayResult<Self> {
        let c_path = to_cstring(root)?;
        let how = OpenHow {
            flags: (libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW) as u64,
            mode: 0,
            resolve: libc::RESOLVE_NO_MAGICLINKS as u64,
        };
        let dir = raw_openat2(libc::AT_FDCWD, &c_path, &how)
            .map_err(|e| GatewayError::io_context("chroot open", &root.to_path_buf(), e))?;
        Ok(ChrootCapability { dir })
    }

    /// Open `rel` (relative, chroot-coordinate path; `.` means the jail
    /// root itself) beneath this capability with the given flags/mode.
    pub fn open_beneath(&self, rel: &str, flags: i32, mode: u32) -> GatewayResult<File> {
        let c_path = to_cstring(Path::new(rel))?;
        let how = OpenHow {
            flags: (flags | libc::O_CLOEXEC) as u64,
            mode: mode as u64,
            resolve: libc::RESOLVE_BENEATH as u64 | libc::RESOLVE_NO_MAGICLINKS as u64,
        };
        let fd = raw_openat2(self.dir.as_raw_fd(), &c_path, &how).map_err(|e| {
            GatewayError::io_context("open beneath chroot", &Path::new(rel).to_path_buf(), e)
        })?;
        Ok(unsafe { File::from_raw_fd(fd.into_raw_fd()) })
    }

    /// Open `rel` as a directory handle beneath this capability, for
    /// listing or as the base of a further `open_beneath` call.
    pub fn open_dir_beneath(&self, rel: &str) -> GatewayResult<ChrootCapability> {
        let c_path = to_cstring(Path::new(rel))?;
        let how = OpenHow {
            flags: (libc::O_DIRECTORY | libc::O_CLOEXEC) as u64,
            mode: 0,
            resolve: libc::RESOLVE_BENEATH as u64 | libc::RESOLVE_NO_MAGICLINKS as u64,
        };
        let fd = raw_openat2(self.dir.as_raw_fd(), &c_path, &how).map_err(|e| {
            GatewayError::io_context("open dir beneath chroot", &Path::new(rel).to_path_buf(), e)
        })?;
        Ok(ChrootCapability { dir: fd })
    }

    /// `fstat` equivalent for `rel`, without following a symlink in the
    /// final component (`O_PATH | O_NOFOLLOW`), so callers can detect
    /// symlinks the way `lstat` would.
    pub fn stat_beneath(&self, rel: &str) -> GatewayResult<std::fs::Metadata> {
        let c_path = to_cstring(Path::new(rel))?;
        let how = OpenHow {
            flags: (libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC) as u64,
            mode: 0,
            resolve: libc::RESOLVE_BENEATH as u64 | libc::RESOLVE_NO_MAGICLINKS as u64,
        };
        let fd = raw_openat2(self.dir.as_raw_fd(), &c_path, &how).map_err(|e| {
            GatewayError::io_context("stat beneath chroot", &Path::new(rel).to_path_buf(), e)
        })?;
        let file = unsafe { File::from_raw_fd(fd.into_raw_fd()) };
        file.metadata().map_err(|e| {
            GatewayError::io_context("stat beneath chroot", &Path::new(rel).to_path_buf(), e)
        })
    }

    /// Read the symlink target of `rel`. Callers are expected to have
    /// already confirmed via [`Self::stat_beneath`] that `rel` is a symlink.
    pub fn readlink_beneath(&self, rel: &str) -> GatewayResult<String> {
        let c_path = to_cstring(Path::new(rel))?;
        let mut buf = vec![0u8; 4096];
        let ret = unsafe {
            libc::readlinkat(
                self.dir.as_raw_fd(),
                c_path.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if ret < 0 {
            return Err(GatewayError::io_context(
                "readlink beneath chroot",
                &Path::new(rel).to_path_buf(),
                io::Error::last_os_error(),
            ));
        }
        buf.truncate(ret as usize);
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// List the entry names of the directory at `rel` (`.`/`..` excluded).
    /// Returns bare names; callers that need type information stat each one.
    pub fn read_dir_beneath(&self, rel: &str) -> GatewayResult<Vec<String>> {
        let dircap = self.open_dir_beneath(rel)?;
        let dup_fd = unsafe { libc::dup(dircap.as_raw_fd()) };
        if dup_fd < 0 {
            return Err(GatewayError::internal("dup for readdir", io::Error::last_os_error()));
        }
        let dirp = unsafe { libc::fdopendir(dup_fd) };
        if dirp.is_null() {
            let err = io::Error::last_os_error();
            unsafe { libc::close(dup_fd) };
            return Err(GatewayError::internal("fdopendir", err));
        }

        let mut names = Vec::new();
        loop {
            let entry = unsafe { libc::readdir(dirp) };
            if entry.is_null() {
                break;
            }
            let name = unsafe { std::ffi::CStr::from_ptr((*entry).d_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            if name != "." && name != ".." {
                names.push(name);
            }
        }
        unsafe { libc::closedir(dirp) };
        Ok(names)
    }

    /// Create every missing directory component of `rel`, tolerating
    /// components that already exist (recursive `MkdirAll`).
    pub fn create_dir_all_beneath(&self, rel: &str, mode: u32) -> GatewayResult<()> {
        let normalized = rel.trim_matches('/');
        if normalized.is_empty() || normalized == "." {
            return Ok(());
        }
        let mut cursor: Option<ChrootCapability> = None;
        let mut built = std::path::PathBuf::new();
        for component in normalized.split('/') {
            built.push(component);
            let parent_fd = cursor.as_ref().map_or_else(|| self.dir.as_raw_fd(), |c| c.as_raw_fd());
            let cname = to_cstring(Path::new(component))?;
            let ret = unsafe { libc::mkdirat(parent_fd, cname.as_ptr(), mode as libc::mode_t) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EEXIST) {
                    return Err(GatewayError::io_context("mkdir beneath chroot", &built, err));
                }
            }
            let next = match &cursor {
                Some(c) => c.open_dir_beneath(component)?,
                None => self.open_dir_beneath(component)?,
            };
            cursor = Some(next);
        }
        Ok(())
    }

    /// Remove the single file (or symlink) at `rel`.
    pub fn remove_file_beneath(&self, rel: &str) -> GatewayResult<()> {
        self.unlink_leaf(rel, 0)
    }

    /// Remove the single, already-empty directory at `rel`.
    pub fn remove_dir_beneath(&self, rel: &str) -> GatewayResult<()> {
        self.unlink_leaf(rel, libc::AT_REMOVEDIR)
    }

    /// Remove `rel` and, if it names a directory, everything beneath it.
    /// An absent target is success, matching the gateway's delete contract.
    pub fn delete_recursive_beneath(&self, rel: &str) -> GatewayResult<()> {
        let meta = match self.stat_beneath(rel) {
            Ok(m) => m,
            Err(GatewayError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            for name in self.read_dir_beneath(rel)? {
                let child = if rel == "." {
                    name
                } else {
                    format!("{rel}/{name}")
                };
                self.delete_recursive_beneath(&child)?;
            }
            self.remove_dir_beneath(rel)
        } else {
            self.remove_file_beneath(rel)
        }
    }

    /// Atomically rename `from_rel` to `to_rel`, both chroot-relative.
    pub fn rename_beneath(&self, from_rel: &str, to_rel: &str) -> GatewayResult<()> {
        let (from_parent, from_leaf) = split_leaf(from_rel);
        let (to_parent, to_leaf) = split_leaf(to_rel);
        let from_cap = self.open_dir_beneath(&from_parent)?;
        let to_cap = self.open_dir_beneath(&to_parent)?;
        let c_from = to_cstring(Path::new(&from_leaf))?;
        let c_to = to_cstring(Path::new(&to_leaf))?;
        let ret = unsafe {
            libc::renameat(
                from_cap.as_raw_fd(),
                c_from.as_ptr(),
                to_cap.as_raw_fd(),
                c_to.as_ptr(),
            )
        };
        if ret < 0 {
            return Err(GatewayError::io_context(
                "rename beneath chroot",
                &Path::new(from_rel).to_path_buf(),
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn unlink_leaf(&self, rel: &str, flags: i32) -> GatewayResult<()> {
        let (parent, leaf) = split_leaf(rel);
        let parent_cap = self.open_dir_beneath(&parent)?;
        let c_leaf = to_cstring(Path::new(&leaf))?;
        let ret = unsafe { libc::unlinkat(parent_cap.as_raw_fd(), c_leaf.as_ptr(), flags) };
        if ret < 0 {
            return Err(GatewayError::io_context(
                "unlink beneath chroot",
                &Path::new(rel).to_path_buf(),
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    /// Raw file descriptor of the anchor directory, for `*at()` calls
    /// (xattrs, `flock`, `fstat`) that this type does not itself wrap.
    pub fn as_raw_fd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }
}

/// Split a chroot-relative path into its parent (chroot-relative, `.` if
/// `rel` has a single component) and its final component, so a mutating
/// `*at()` call can resolve the parent through `RESOLVE_BENEATH` and then
/// touch only a single, slash-free leaf name.
fn split_leaf(rel: &str) -> (String, String) {
    match rel.rsplit_once('/') {
        Some((parent, leaf)) => (parent.to_owned(), leaf.to_owned()),
        None => (".".to_owned(), rel.to_owned()),
    }
}

fn to_cstring(p: &Path) -> GatewayResult<CString> {
    CString::new(p.as_os_str().as_encoded_bytes()).map_err(|e| {
        GatewayError::BadRequest(format!("path contains an interior NUL byte: {e}"))
    })
}

fn raw_openat2(dirfd: RawFd, path: &CString, how: &OpenHow) -> io::Result<OwnedFd> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            dirfd,
            path.as_ptr(),
            how as *const OpenHow,
            std::mem::size_of::<OpenHow>(),
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(res as RawFd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn opens_jail_root_and_a_file_beneath_it() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let cap = ChrootCapability::open(dir.path()).unwrap();
        let mut f = cap.open_beneath("a.txt", libc::O_RDONLY, 0).unwrap();
        let mut buf = String::new();
        f.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");
    }

    #[test]
    fn refuses_to_resolve_above_the_jail() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let cap = ChrootCapability::open(&dir.path().join("sub")).unwrap();
        let result = cap.open_beneath("../a.txt", libc::O_RDONLY, 0);
        assert!(result.is_err());
    }

    #[test]
    fn creates_a_file_beneath_the_jail() {
        let dir = tempfile::tempdir().unwrap();
        let cap = ChrootCapability::open(dir.path()).unwrap();
        let mut f = cap
            .open_beneath("new.txt", libc::O_WRONLY | libc::O_CREAT, 0o644)
            .unwrap();
        f.write_all(b"data").unwrap();
        assert!(dir.path().join("new.txt").exists());
    }

    #[test]
    fn opens_nested_directory_handle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"nested").unwrap();

        let cap = ChrootCapability::open(dir.path()).unwrap();
        let subcap = cap.open_dir_beneath("sub").unwrap();
        let mut f = subcap.open_beneath("b.txt", libc::O_RDONLY, 0).unwrap();
        let mut buf = String::new();
        f.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "nested");
    }

    #[test]
    fn creates_nested_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let cap = ChrootCapability::open(dir.path()).unwrap();
        cap.create_dir_all_beneath("a/b/c", 0o755).unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
        // Calling again on an already-existing tree is not an error.
        cap.create_dir_all_beneath("a/b/c", 0o755).unwrap();
    }

    #[test]
    fn stats_a_file_and_detects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        std::os::unix::fs::symlink("f", dir.path().join("link")).unwrap();

        let cap = ChrootCapability::open(dir.path()).unwrap();
        let meta = cap.stat_beneath("f").unwrap();
        assert!(meta.is_file());
        let link_meta = cap.stat_beneath("link").unwrap();
        assert!(link_meta.file_type().is_symlink());
        assert_eq!(cap.readlink_beneath("link").unwrap(), "f");
    }

    #[test]
    fn lists_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();

        let cap = ChrootCapability::open(dir.path()).unwrap();
        let mut names = cap.read_dir_beneath(".").unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn deletes_recursively_and_absent_target_is_success() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/f"), b"x").unwrap();

        let cap = ChrootCapability::open(dir.path()).unwrap();
        cap.delete_recursive_beneath("a").unwrap();
        assert!(!dir.path().join("a").exists());
        // Already gone: still success.
        cap.delete_recursive_beneath("a").unwrap();
    }

    #[test]
    fn renames_across_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("dst")).unwrap();
        std::fs::write(dir.path().join("src.txt"), b"data").unwrap();

        let cap = ChrootCapability::open(dir.path()).unwrap();
        cap.rename_beneath("src.txt", "dst/moved.txt").unwrap();
        assert!(!dir.path().join("src.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("dst/moved.txt")).unwrap(),
            "data"
        );
    }
}
