//! Extended-attribute storage for the `user.*` namespace: grants, advisory
//! lock payloads, quota overrides, and arbitrary per-resource metadata all
//! persist here rather than in a side database.
//!
//! All operations take an open file descriptor rather than a path, the way
//! `starry::sys::xattr` does it, so a caller that already holds a
//! [`crate::chroot::ChrootCapability`]-derived handle never re-resolves the
//! path and never risks a TOCTOU race between check and use. `nix` does not
//! wrap `f*xattr`, so these call `libc` directly, retrying with a
//! kernel-reported size on `ERANGE` exactly as that reference does.

use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;

use nix::errno::Errno;

use crate::error::{GatewayError, GatewayResult};

const STACK_BUF_SIZE: usize = 4096;

/// Read the value of extended attribute `name` on `fd`. Returns `Ok(None)`
/// if the attribute does not exist.
pub fn fget<F: AsRawFd>(fd: &F, name: &str) -> GatewayResult<Option<Vec<u8>>> {
    let cname = to_cstring(name)?;
    let mut buf = MaybeUninit::<[u8; STACK_BUF_SIZE]>::uninit();

    let ret = unsafe {
        libc::fgetxattr(
            fd.as_raw_fd(),
            cname.as_ptr(),
            buf.as_mut_ptr() as *mut _,
            STACK_BUF_SIZE,
        )
    };
    match Errno::result(ret) {
        Ok(n) => {
            let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n as usize) };
            Ok(Some(data.to_vec()))
        }
        Err(Errno::ERANGE) => Ok(Some(grow_and_retry_get(fd, &cname)?)),
        Err(Errno::ENODATA) => Ok(None),
        Err(e) => Err(map_errno("fgetxattr", name, e)),
    }
}

fn grow_and_retry_get<F: AsRawFd>(fd: &F, name: &CStr) -> GatewayResult<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        let needed = unsafe {
            libc::fgetxattr(fd.as_raw_fd(), name.as_ptr(), std::ptr::null_mut(), 0)
        };
        let expected_len = Errno::result(needed)
            .map_err(|e| map_errno("fgetxattr size probe", &name.to_string_lossy(), e))?
            as usize;
        buf.reserve_exact(expected_len);

        let ret = unsafe {
            libc::fgetxattr(
                fd.as_raw_fd(),
                name.as_ptr(),
                buf.as_mut_ptr() as *mut _,
                buf.capacity(),
            )
        };
        match Errno::result(ret) {
            Ok(n) => {
                unsafe { buf.set_len(n as usize) };
                return Ok(buf);
            }
            Err(Errno::ERANGE) => continue,
            Err(e) => return Err(map_errno("fgetxattr", &name.to_string_lossy(), e)),
        }
    }
}

/// Set extended attribute `name` on `fd` to `value`, creating or replacing
/// it unconditionally.
pub fn fset<F: AsRawFd>(fd: &F, name: &str, value: &[u8]) -> GatewayResult<()> {
    let cname = to_cstring(name)?;
    let ret = unsafe {
        libc::fsetxattr(
            fd.as_raw_fd(),
            cname.as_ptr(),
            value.as_ptr() as *const _,
            value.len(),
            0,
        )
    };
    Errno::result(ret)
        .map(|_| ())
        .map_err(|e| map_errno("fsetxattr", name, e))
}

/// Remove extended attribute `name` from `fd`. Succeeds silently if the
/// attribute was already absent.
pub fn fremove<F: AsRawFd>(fd: &F, name: &str) -> GatewayResult<()> {
    let cname = to_cstring(name)?;
    let ret = unsafe { libc::fremovexattr(fd.as_raw_fd(), cname.as_ptr()) };
    match Errno::result(ret) {
        Ok(_) => Ok(()),
        Err(Errno::ENODATA) => Ok(()),
        Err(e) => Err(map_errno("fremovexattr", name, e)),
    }
}

/// List all extended attribute names set on `fd`.
pub fn flist<F: AsRawFd>(fd: &F) -> GatewayResult<Vec<String>> {
    let mut buf = MaybeUninit::<[u8; STACK_BUF_SIZE]>::uninit();
    let ret = unsafe { libc::flistxattr(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, STACK_BUF_SIZE) };
    match Errno::result(ret) {
        Ok(n) => {
            let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n as usize) };
            Ok(split_names(data))
        }
        Err(Errno::ERANGE) => grow_and_retry_list(fd),
        Err(e) => Err(map_errno("flistxattr", "(list)", e)),
    }
}

fn grow_and_retry_list<F: AsRawFd>(fd: &F) -> GatewayResult<Vec<String>> {
    let mut buf = Vec::new();
    loop {
        let needed = unsafe { libc::flistxattr(fd.as_raw_fd(), std::ptr::null_mut(), 0) };
        let expected_len = Errno::result(needed)
            .map_err(|e| map_errno("flistxattr size probe", "(list)", e))? as usize;
        buf.reserve_exact(expected_len);

        let ret = unsafe {
            libc::flistxattr(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.capacity())
        };
        match Errno::result(ret) {
            Ok(n) => {
                unsafe { buf.set_len(n as usize) };
                return Ok(split_names(&buf));
            }
            Err(Errno::ERANGE) => continue,
            Err(e) => return Err(map_errno("flistxattr", "(list)", e)),
        }
    }
}

fn split_names(data: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut slice = data;
    while let Ok(cstr) = CStr::from_bytes_until_nul(slice) {
        if !cstr.is_empty() {
            names.push(cstr.to_string_lossy().into_owned());
        }
        let advance = cstr.count_bytes() + 1;
        if advance > slice.len() {
            break;
        }
        slice = &slice[advance..];
    }
    names
}

fn to_cstring(name: &str) -> GatewayResult<CString> {
    CString::new(name)
        .map_err(|_| GatewayError::BadRequest(format!("xattr name {name:?} contains a NUL byte")))
}

fn map_errno(op: &str, name: &str, e: Errno) -> GatewayError {
    match e {
        Errno::ENODATA | Errno::ENOENT => GatewayError::NotFound(format!("{op} {name}")),
        Errno::ENOSPC | Errno::EDQUOT => {
            GatewayError::BadRequest(format!("{op} {name}: attribute storage exhausted"))
        }
        other => GatewayError::internal(format!("{op} {name}"), std::io::Error::from(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn round_trips_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .unwrap();

        fset(&f, "user.nceph.test", b"hello").unwrap();
        assert_eq!(fget(&f, "user.nceph.test").unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn missing_attribute_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .unwrap();
        assert_eq!(fget(&f, "user.nceph.missing").unwrap(), None);
    }

    #[test]
    fn remove_then_list_no_longer_shows_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .unwrap();

        fset(&f, "user.nceph.a", b"1").unwrap();
        fset(&f, "user.nceph.b", b"2").unwrap();
        let names = flist(&f).unwrap();
        assert!(names.contains(&"user.nceph.a".to_owned()));
        assert!(names.contains(&"user.nceph.b".to_owned()));

        fremove(&f, "user.nceph.a").unwrap();
        let names = flist(&f).unwrap();
        assert!(!names.contains(&"user.nceph.a".to_owned()));
        assert!(names.contains(&"user.nceph.b".to_owned()));
    }

    #[test]
    fn removing_a_missing_attribute_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .unwrap();
        assert!(fremove(&f, "user.nceph.never-set").is_ok());
    }
}
