//! Advisory file locks, backing `set_lock`/`get_lock`/`refresh_lock`/`unlock`.
//!
//! A lock is two things kept in sync: a payload persisted in the xattr
//! `user.reva.lockpayload`, and an advisory `flock(2)` held on the file
//! descriptor that wrote it. The descriptor is kept alive in
//! [`super::Gateway`]'s lock table rather than closed on return, so the
//! kernel-level lock actually persists across calls the way the payload
//! implies it does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// The xattr key a lock payload is persisted under; every resource has at
/// most one.
pub const LOCK_XATTR_KEY: &str = "user.reva.lockpayload";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    pub(crate) fn flock_operation(self) -> i32 {
        match self {
            LockKind::Shared => libc::LOCK_SH,
            LockKind::Exclusive => libc::LOCK_EX,
        }
    }
}

/// A request to acquire or refresh a lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub id: String,
    pub kind: LockKind,
    pub holder_user: String,
    pub holder_app: String,
    pub expiration: DateTime<Utc>,
}

/// The payload persisted in [`LOCK_XATTR_KEY`], and returned to callers by
/// `get_lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub id: String,
    pub kind: LockKind,
    pub holder_user: String,
    pub holder_app: String,
    pub expiration: DateTime<Utc>,
}

impl From<LockRequest> for Lock {
    fn from(r: LockRequest) -> Self {
        Lock {
            id: r.id,
            kind: r.kind,
            holder_user: r.holder_user,
            holder_app: r.holder_app,
            expiration: r.expiration,
        }
    }
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration < now
    }
}

/// An unlock/refresh request naming the holder and, optionally, the lock id
/// it expects to find. `refresh_lock`'s `existing_id` and `unlock`'s `id`
/// both flow through here.
#[derive(Debug, Clone)]
pub struct LockIdentity {
    pub id: Option<String>,
    pub holder_user: String,
    pub holder_app: String,
}

/// Require that `lock` was held by the user/app named in `identity`, and,
/// if `identity.id` is set, that it matches `lock.id`. Used by both
/// `refresh_lock` (where the id is optional) and `unlock` (where callers
/// pass one in).
pub fn require_holder_match(lock: &Lock, identity: &LockIdentity) -> GatewayResult<()> {
    if lock.holder_user != identity.holder_user || lock.holder_app != identity.holder_app {
        return Err(GatewayError::BadRequest(format!(
            "lock {} is held by {}/{}, not {}/{}",
            lock.id, lock.holder_user, lock.holder_app, identity.holder_user, identity.holder_app
        )));
    }
    if let Some(id) = &identity.id {
        if id != &lock.id {
            return Err(GatewayError::BadRequest(format!(
                "lock id {id:?} does not match held lock {:?}",
                lock.id
            )));
        }
    }
    Ok(())
}
