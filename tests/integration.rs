//! End-to-end scenarios and boundary behaviors, exercised through the crate's
//! public facade rather than any one module's internals.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use nceph::{
    AdminTransport, CancelToken, ChrootCapability, FileKind, Gateway, GatewayConfig, GatewayError,
    InodeResolver, Reference, Translator, UploadOptions, UserIdentity,
};

/// Surfaces the crate's `log` output under `RUST_LOG=debug cargo test -- --nocapture`.
/// Idempotent and safe to call from every test in this binary.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct FakeTransport {
    fs_status: Value,
    inode_dump: Mutex<HashMap<u64, Value>>,
}

impl FakeTransport {
    fn with_active_mds() -> Self {
        FakeTransport {
            fs_status: serde_json::json!({
                "mdsmap": { "info": [{"name": "mds.a", "state": "up:active"}] }
            }),
            inode_dump: Mutex::new(HashMap::new()),
        }
    }

    fn returning(self, inode: u64, path: &str) -> Self {
        self.inode_dump
            .lock()
            .unwrap()
            .insert(inode, serde_json::json!({"path": path}));
        self
    }
}

impl AdminTransport for FakeTransport {
    fn send_cluster_command(&self, _command: &Value) -> Result<Value, GatewayError> {
        Ok(self.fs_status.clone())
    }

    fn send_mds_command(&self, _mds_name: &str, command: &Value) -> Result<Value, GatewayError> {
        let inode = command["number"].as_u64().unwrap();
        self.inode_dump
            .lock()
            .unwrap()
            .get(&inode)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("no dump stubbed for inode {inode}")))
    }
}

fn gateway_with_resolver(transport: FakeTransport) -> (Gateway, tempfile::TempDir) {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let chroot = Arc::new(ChrootCapability::open(dir.path()).unwrap());
    let translator = Translator::new(
        dir.path().to_str().unwrap(),
        dir.path().to_str().unwrap(),
        "/volumes/vol",
    );
    let resolver = InodeResolver::new(Arc::new(transport), translator.clone());
    let config = GatewayConfig::for_local_mode();
    let gateway = Gateway::new(chroot, translator, config, "storage1", Some(resolver));
    (gateway, dir)
}

fn plain_gateway() -> (Gateway, tempfile::TempDir) {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let chroot = Arc::new(ChrootCapability::open(dir.path()).unwrap());
    let translator = Translator::new(
        dir.path().to_str().unwrap(),
        dir.path().to_str().unwrap(),
        "/volumes/vol",
    );
    let config = GatewayConfig::for_local_mode();
    let gateway = Gateway::new(chroot, translator, config, "storage1", None);
    (gateway, dir)
}

#[test]
fn s2_inode_resolution_round_trips_to_the_original_path() {
    use std::os::unix::fs::MetadataExt;

    init_logging();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("x"), b"").unwrap();
    let inode = std::fs::metadata(dir.path().join("x")).unwrap().ino();

    let transport = FakeTransport::with_active_mds().returning(inode, "/volumes/vol/x");
    let chroot = Arc::new(ChrootCapability::open(dir.path()).unwrap());
    let translator = Translator::new(
        dir.path().to_str().unwrap(),
        dir.path().to_str().unwrap(),
        "/volumes/vol",
    );
    let resolver = InodeResolver::new(Arc::new(transport), translator.clone());
    let config = GatewayConfig::for_local_mode();
    let gateway = Gateway::new(chroot, translator, config, "storage1", Some(resolver));

    let resolved = gateway.get_path_by_id(&inode.to_string()).unwrap();
    assert_eq!(resolved, "/x");
    gateway.shutdown();
}

#[test]
fn s6_inode_resolution_rejects_an_escaping_path() {
    let transport =
        FakeTransport::with_active_mds().returning(42, "/volumes/vol/x/../../etc");
    let (gateway, _dir) = gateway_with_resolver(transport);

    let result = gateway.get_path_by_id("42");
    assert!(matches!(result, Err(GatewayError::SecurityViolation(_))));
    gateway.shutdown();
}

#[test]
fn s3_a_second_identity_never_observes_the_first_workers_uid() {
    let (gateway, _dir) = plain_gateway();
    let alice = UserIdentity::numeric(4001, 4001);
    let bob = UserIdentity::numeric(4002, 4002);
    let cancel = CancelToken::new();

    gateway
        .create_dir(&alice, &cancel, &Reference::Path("/shared".to_owned()))
        .unwrap();
    gateway
        .touch_file(&alice, &cancel, &Reference::Path("/shared/a.txt".to_owned()))
        .unwrap();

    // Either bob can see it (both workers share the real process uid outside
    // of a privileged test environment) or the read is rejected. What must
    // never happen is the call panicking or silently using alice's uid.
    let result = gateway.get_metadata(&bob, &cancel, &Reference::Path("/shared/a.txt".to_owned()), &[]);
    match result {
        Ok(info) => assert_eq!(info.kind, FileKind::File),
        Err(GatewayError::NotFound(_)) | Err(GatewayError::Internal { .. }) => {}
        Err(other) => panic!("unexpected error variant: {other:?}"),
    }
    gateway.shutdown();
}

#[test]
fn empty_directory_lists_as_empty() {
    let (gateway, _dir) = plain_gateway();
    let identity = UserIdentity::numeric(4003, 4003);
    let cancel = CancelToken::new();
    gateway
        .create_dir(&identity, &cancel, &Reference::Path("/empty".to_owned()))
        .unwrap();
    let listing = gateway
        .list_folder(&identity, &cancel, &Reference::Path("/empty".to_owned()), &[])
        .unwrap();
    assert!(listing.is_empty());
    gateway.shutdown();
}

#[test]
fn uploading_a_zero_byte_stream_succeeds() {
    let (gateway, _dir) = plain_gateway();
    let identity = UserIdentity::numeric(4004, 4004);
    let cancel = CancelToken::new();
    let reference = Reference::Path("/z.bin".to_owned());
    let outcome = gateway
        .upload(&identity, &cancel, &reference, Cursor::new(Vec::new()), UploadOptions::default())
        .unwrap();
    assert_eq!(outcome.bytes_written, 0);
    let info = gateway.get_metadata(&identity, &cancel, &reference, &[]).unwrap();
    assert_eq!(info.size, 0);
    gateway.shutdown();
}

#[test]
fn moving_a_file_onto_itself_is_a_no_op() {
    let (gateway, _dir) = plain_gateway();
    let identity = UserIdentity::numeric(4005, 4005);
    let cancel = CancelToken::new();
    let reference = Reference::Path("/m.txt".to_owned());
    gateway.touch_file(&identity, &cancel, &reference).unwrap();
    gateway.mv(&identity, &cancel, &reference, &reference).unwrap();
    let info = gateway.get_metadata(&identity, &cancel, &reference, &[]).unwrap();
    assert_eq!(info.kind, FileKind::File);
    gateway.shutdown();
}

#[test]
fn uploading_into_a_deeply_nested_absent_path_creates_every_parent() {
    let (gateway, _dir) = plain_gateway();
    let identity = UserIdentity::numeric(4006, 4006);
    let cancel = CancelToken::new();
    let reference = Reference::Path("/a/b/c/d.txt".to_owned());
    gateway
        .upload(&identity, &cancel, &reference, Cursor::new(b"payload".to_vec()), UploadOptions::default())
        .unwrap();

    let mut file = gateway.download(&identity, &cancel, &reference).unwrap();
    let mut buf = String::new();
    file.read_to_string(&mut buf).unwrap();
    assert_eq!(buf, "payload");
    gateway.shutdown();
}

#[test]
fn fifo_per_worker_read_after_write_across_operations() {
    let (gateway, _dir) = plain_gateway();
    let identity = UserIdentity::numeric(4007, 4007);
    let cancel = CancelToken::new();

    for i in 0..5 {
        let reference = Reference::Path(format!("/seq-{i}.txt"));
        gateway
            .upload(&identity, &cancel, &reference, Cursor::new(vec![b'a'; i + 1]), UploadOptions::default())
            .unwrap();
        let info = gateway.get_metadata(&identity, &cancel, &reference, &[]).unwrap();
        assert_eq!(info.size as usize, i + 1);
    }
    gateway.shutdown();
}
