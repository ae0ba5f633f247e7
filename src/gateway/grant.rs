//! Grant storage, backing `add_grant`/`update_grant`/`remove_grant`/
//! `deny_grant`/`list_grants`.
//!
//! A grant is an opaque permission record the caller supplies; this crate
//! only owns where it lives (`user.grant.<opaque_id>`) and how it is
//! enumerated, not what the permissions inside it mean. That business
//! logic belongs above this layer.

use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;

/// Prefix every grant xattr key carries; `list_grants` enumerates by it.
pub const GRANT_XATTR_PREFIX: &str = "user.grant.";

/// A permission record, opaque to this crate beyond its grantee and the
/// caller-supplied permission strings it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub grantee_opaque: String,
    pub permissions: Vec<String>,
}

/// The xattr key a grant for `grantee_opaque` is stored under.
pub fn xattr_key(grantee_opaque: &str) -> String {
    format!("{GRANT_XATTR_PREFIX}{grantee_opaque}")
}

/// True if `name` is a grant xattr key, i.e. carries [`GRANT_XATTR_PREFIX`].
pub fn is_grant_key(name: &str) -> bool {
    name.starts_with(GRANT_XATTR_PREFIX)
}

/// Decode a grant xattr value. A parse failure is left for the caller to
/// absorb by skipping the entry, not propagated as a hard error.
pub fn decode(raw: &[u8]) -> GatewayResult<Grant> {
    Ok(serde_json::from_slice(raw)?)
}

/// Encode a grant for xattr storage.
pub fn encode(grant: &Grant) -> GatewayResult<Vec<u8>> {
    Ok(serde_json::to_vec(grant)?)
}
