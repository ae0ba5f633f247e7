//! Inode Resolver (component E).
//!
//! Resolves an opaque CephFS inode number back to a path by talking to the
//! cluster's metadata server administratively: find the active MDS from a
//! "fs status" document, then issue a "dump inode" command to it. Both
//! documents vary in shape across cluster versions, so every schema is
//! modeled as an untagged `serde` enum and tried in order, since the
//! document's shape cannot be assumed ahead of time.
//!
//! The actual RPC transport (how a JSON command reaches the admin mount) is
//! out of this crate's scope; [`AdminTransport`] is the seam a caller
//! plugs a real one into, keeping the resolver itself ignorant of the
//! underlying connection.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};
use crate::path::{Translator, ValidationContext};

/// Sends an administrative JSON command and returns the decoded response.
/// Implementations own the actual admin-mount connection; this crate only
/// specifies the command documents and decodes the responses.
pub trait AdminTransport: Send + Sync {
    /// Send a cluster-wide command, e.g. `{"prefix": "fs status", "format": "json"}`.
    fn send_cluster_command(&self, command: &Value) -> GatewayResult<Value>;

    /// Send a command targeted at a specific named MDS, e.g.
    /// `{"prefix": "dump inode", "number": <inode>}`.
    fn send_mds_command(&self, mds_name: &str, command: &Value) -> GatewayResult<Value>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FsStatusResponse {
    Many(Vec<FsStatusDoc>),
    One(FsStatusDoc),
}

#[derive(Debug, Deserialize, Default)]
struct FsStatusDoc {
    #[serde(default)]
    mdsmap: Option<MdsMapShape>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MdsMapShape {
    WithInfo { info: MdsInfoShape },
    Bare(Vec<MdsInfo>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MdsInfoShape {
    List(Vec<MdsInfo>),
    ById(HashMap<String, MdsInfo>),
}

#[derive(Debug, Deserialize, Clone)]
struct MdsInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    state: String,
}

impl MdsMapShape {
    fn into_infos(self) -> Vec<MdsInfo> {
        match self {
            MdsMapShape::Bare(v) => v,
            MdsMapShape::WithInfo { info } => match info {
                MdsInfoShape::List(v) => v,
                MdsInfoShape::ById(m) => m.into_values().collect(),
            },
        }
    }
}

static PATH_FALLBACK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""(/[^"\\]+)""#).unwrap());

const PATH_FIELD_CANDIDATES: &[&str] = &["path", "full_path", "pathname", "name", "dname"];

fn extract_path_field(doc: &Value) -> Option<String> {
    if let Some(obj) = doc.as_object() {
        for key in PATH_FIELD_CANDIDATES {
            if let Some(Value::String(s)) = obj.get(*key) {
                if !s.is_empty() {
                    return Some(s.clone());
                }
            }
        }
    }
    let raw = doc.to_string();
    PATH_FALLBACK_RE
        .captures(&raw)
        .map(|c| c[1].to_owned())
}

/// Resolves `opaque_id` (a decimal inode number) to an external path,
/// stateless across calls; every administrative command runs on the
/// caller-supplied [`AdminTransport`], never the per-user worker pool.
pub struct InodeResolver {
    transport: Arc<dyn AdminTransport>,
    translator: Translator,
}

impl InodeResolver {
    pub fn new(transport: Arc<dyn AdminTransport>, translator: Translator) -> Self {
        InodeResolver {
            transport,
            translator,
        }
    }

    /// Resolve `opaque_id` to an external path. Fails with `Unavailable` if
    /// no MDS is active, `NotFound` if the inode dump carries no
    /// path-like field, or `SecurityViolation` if either the raw resolved
    /// path or its user-facing translation falls outside the jail. The
    /// offending path is never leaked back to the caller in that case.
    pub fn get_path_by_id(&self, opaque_id: &str) -> GatewayResult<String> {
        let inode: u64 = opaque_id
            .parse()
            .map_err(|_| GatewayError::BadRequest(format!("invalid opaque id {opaque_id:?}")))?;

        let mds_name = self.find_active_mds()?;
        let raw_path = self.dump_inode(&mds_name, inode)?;

        self.translator
            .validate_within_bounds(&raw_path, ValidationContext::InodeResolution)?;
        let user_path = self.translator.volume_to_user(&raw_path)?;
        // Re-derive the volume path from the translation and validate it
        // again: a defense-in-depth check independent of how `raw_path`
        // was phrased by the MDS.
        let reconstructed = self.translator.user_to_volume(&user_path)?;
        self.translator
            .validate_within_bounds(&reconstructed, ValidationContext::InodeResolution)?;

        Ok(user_path)
    }

    fn find_active_mds(&self) -> GatewayResult<String> {
        let command = serde_json::json!({"prefix": "fs status", "format": "json"});
        let doc = self.transport.send_cluster_command(&command)?;
        let response: FsStatusResponse = serde_json::from_value(doc)?;

        let docs = match response {
            FsStatusResponse::One(d) => vec![d],
            FsStatusResponse::Many(v) => v,
        };

        for doc in docs {
            let Some(shape) = doc.mdsmap else { continue };
            for info in shape.into_infos() {
                if info.state.contains("active") {
                    let name = info
                        .name
                        .ok_or_else(|| GatewayError::Unavailable("active MDS entry has no name".into()))?;
                    return Ok(name);
                }
            }
        }

        Err(GatewayError::Unavailable(
            "no active MDS found in fs status response".into(),
        ))
    }

    fn dump_inode(&self, mds_name: &str, inode: u64) -> GatewayResult<String> {
        let command = serde_json::json!({"prefix": "dump inode", "number": inode});
        let doc = self.transport.send_mds_command(mds_name, &command)?;
        extract_path_field(&doc)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GatewayError::NotFound(format!("inode {inode} dump returned no path")))
    }
}
